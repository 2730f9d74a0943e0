//! Feature Extraction Module
//!
//! Turns raw tracker windows into the frequency and interval features consumed by
//! obsolescence predictors.

use crate::access_tracker::{count_recent_accesses, steps_between_accesses, RawFeature};
use serde::{Deserialize, Serialize};

/// Look-back windows for access counts, in time steps
pub const ARRIVAL_WINDOWS: [usize; 4] = [30, 50, 100, 200];

/// Number of most recent inter-access gaps kept per access kind
pub const NUM_DELTAS: usize = 6;

/// Features derived from one access kind (reads or writes)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFeatures {
    /// Accesses in the last 30, 50, 100 and 200 steps
    pub arrive_times: [u32; 4],
    /// Gaps between the six most recent accesses, newest first, zero padded
    pub deltas: [u32; NUM_DELTAS],
    /// `deltas[i] - deltas[i + 1]`
    pub delta_differences: [i64; NUM_DELTAS - 1],
}

impl AccessFeatures {
    pub fn extract(words: &[u64]) -> Self {
        let mut arrive_times = [0u32; 4];
        for (slot, window) in arrive_times.iter_mut().zip(ARRIVAL_WINDOWS) {
            *slot = count_recent_accesses(words, window);
        }

        let mut deltas = [0u32; NUM_DELTAS];
        deltas.copy_from_slice(&steps_between_accesses(words, NUM_DELTAS));

        let mut delta_differences = [0i64; NUM_DELTAS - 1];
        for (i, diff) in delta_differences.iter_mut().enumerate() {
            *diff = deltas[i] as i64 - deltas[i + 1] as i64;
        }

        Self {
            arrive_times,
            deltas,
            delta_differences,
        }
    }

    /// Number of accesses recorded in the last 200 steps
    pub fn recent_accesses(&self) -> u32 {
        self.arrive_times[ARRIVAL_WINDOWS.len() - 1]
    }
}

/// Read and write features of one cached item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub read: AccessFeatures,
    pub write: AccessFeatures,
}

impl FeatureVector {
    pub fn extract(raw: &RawFeature) -> Self {
        Self {
            read: AccessFeatures::extract(&raw.read_accesses),
            write: AccessFeatures::extract(&raw.write_accesses),
        }
    }
}
