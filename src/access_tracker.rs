//! Access Tracker Module
//!
//! Per-item bit-packed history of reads and writes over a sliding window of time
//! steps. One bit per elapsed step; a set bit means at least one access happened
//! in that step.
//!
//! Layout: word 0 holds the 64 most recent steps and bit 0 of word 0 is the newest
//! step. Advancing the window moves bits toward higher bit indices and carries the
//! top bits of word `i` into the low bits of word `i + 1`; bits pushed past the last
//! word are dropped.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub const WORD_BITS: usize = 64;

/// Raw window words of one tracker, in the layout described above
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeature {
    pub read_accesses: Vec<u64>,
    pub write_accesses: Vec<u64>,
}

/// Access history of one cached item.
///
/// Time steps are the orchestrator's logical clock; a step earlier than the last
/// recorded one does not move the window.
pub trait AccessTracker: Debug + Send + Sync {
    /// Advance to `time_step` and set the newest read bit
    fn record_read(&mut self, time_step: u64);

    /// Advance to `time_step` and set the newest write bit
    fn record_write(&mut self, time_step: u64);

    /// Advance to `time_step` without recording an access
    fn sync_time_step(&mut self, time_step: u64);

    fn last_update_time_step(&self) -> u64;

    /// Window length in time steps
    fn window_size(&self) -> usize;

    fn read_words(&self) -> &[u64];

    fn write_words(&self) -> &[u64];

    fn to_raw_feature(&self) -> RawFeature {
        RawFeature {
            read_accesses: self.read_words().to_vec(),
            write_accesses: self.write_words().to_vec(),
        }
    }

    /// Snapshot of the window as it would look after `sync_time_step(time_step)`,
    /// leaving the tracker untouched.
    fn raw_feature_at(&self, time_step: u64) -> RawFeature {
        let mut raw = self.to_raw_feature();
        let steps = time_step.saturating_sub(self.last_update_time_step());
        shift_toward_older(&mut raw.read_accesses, steps);
        shift_toward_older(&mut raw.write_accesses, steps);
        raw
    }

    fn num_reads_last_k_time_steps(&self, k: usize) -> u32 {
        count_recent_accesses(self.read_words(), k)
    }

    fn num_writes_last_k_time_steps(&self, k: usize) -> u32 {
        count_recent_accesses(self.write_words(), k)
    }

    fn num_steps_between_reads(&self, k: usize) -> Vec<u32> {
        steps_between_accesses(self.read_words(), k)
    }

    fn num_steps_between_writes(&self, k: usize) -> Vec<u32> {
        steps_between_accesses(self.write_words(), k)
    }
}

/// Shift a window `steps` positions toward "older", clearing it when `steps` reaches
/// the window length.
pub fn shift_toward_older(words: &mut [u64], steps: u64) {
    if steps == 0 || words.is_empty() {
        return;
    }
    let window = (words.len() * WORD_BITS) as u64;
    if steps >= window {
        words.fill(0);
        return;
    }

    let word_shift = (steps / WORD_BITS as u64) as usize;
    let bit_shift = (steps % WORD_BITS as u64) as u32;

    // Descending order only reads indices that have not been rewritten yet
    for i in (0..words.len()).rev() {
        words[i] = match i.checked_sub(word_shift) {
            Some(src) => {
                let mut value = words[src] << bit_shift;
                if bit_shift > 0 && src > 0 {
                    value |= words[src - 1] >> (WORD_BITS as u32 - bit_shift);
                }
                value
            }
            None => 0,
        };
    }
}

/// Population count of the `k` most recent steps.
pub fn count_recent_accesses(words: &[u64], k: usize) -> u32 {
    let mut remaining = k;
    let mut count = 0;
    for &word in words {
        if remaining == 0 {
            break;
        }
        if remaining >= WORD_BITS {
            count += word.count_ones();
            remaining -= WORD_BITS;
        } else {
            count += (word & ((1u64 << remaining) - 1)).count_ones();
            remaining = 0;
        }
    }
    count
}

/// Gaps between the `k` most recent accesses, newest first.
///
/// The first gap is measured from "now" (position -1) to the newest set bit. The
/// result always has length `k`; entries beyond the accesses present are 0.
pub fn steps_between_accesses(words: &[u64], k: usize) -> Vec<u32> {
    let mut gaps = vec![0u32; k];
    let mut last_pos: i64 = -1;
    let mut filled = 0;

    for (word_index, &word) in words.iter().enumerate() {
        if filled >= k {
            break;
        }
        let mut mask = word;
        while mask != 0 && filled < k {
            let pos = (word_index * WORD_BITS) as i64 + mask.trailing_zeros() as i64;
            gaps[filled] = (pos - last_pos) as u32;
            last_pos = pos;
            filled += 1;
            mask &= mask - 1;
        }
    }
    gaps
}

/// 64-step window held in one machine word per access kind
#[derive(Debug, Clone, Default)]
pub struct FixedSizeAccessTracker {
    reads: u64,
    writes: u64,
    last_update_time_step: u64,
}

impl FixedSizeAccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, time_step: u64) {
        if time_step <= self.last_update_time_step {
            return;
        }
        let steps = time_step - self.last_update_time_step;
        if steps >= WORD_BITS as u64 {
            self.reads = 0;
            self.writes = 0;
        } else {
            self.reads <<= steps;
            self.writes <<= steps;
        }
        self.last_update_time_step = time_step;
    }
}

impl AccessTracker for FixedSizeAccessTracker {
    fn record_read(&mut self, time_step: u64) {
        self.advance(time_step);
        self.reads |= 1;
    }

    fn record_write(&mut self, time_step: u64) {
        self.advance(time_step);
        self.writes |= 1;
    }

    fn sync_time_step(&mut self, time_step: u64) {
        self.advance(time_step);
    }

    fn last_update_time_step(&self) -> u64 {
        self.last_update_time_step
    }

    fn window_size(&self) -> usize {
        WORD_BITS
    }

    fn read_words(&self) -> &[u64] {
        std::slice::from_ref(&self.reads)
    }

    fn write_words(&self) -> &[u64] {
        std::slice::from_ref(&self.writes)
    }
}

/// Window of any multiple of 64 steps
#[derive(Debug, Clone)]
pub struct VariableSizeAccessTracker {
    reads: Vec<u64>,
    writes: Vec<u64>,
    last_update_time_step: u64,
}

impl VariableSizeAccessTracker {
    /// `window_size` is rounded up to the next multiple of 64 (at least 64).
    pub fn new(window_size: usize) -> Self {
        let words = window_size.div_ceil(WORD_BITS).max(1);
        Self {
            reads: vec![0; words],
            writes: vec![0; words],
            last_update_time_step: 0,
        }
    }

    fn advance(&mut self, time_step: u64) {
        if time_step <= self.last_update_time_step {
            return;
        }
        let steps = time_step - self.last_update_time_step;
        shift_toward_older(&mut self.reads, steps);
        shift_toward_older(&mut self.writes, steps);
        self.last_update_time_step = time_step;
    }
}

impl AccessTracker for VariableSizeAccessTracker {
    fn record_read(&mut self, time_step: u64) {
        self.advance(time_step);
        self.reads[0] |= 1;
    }

    fn record_write(&mut self, time_step: u64) {
        self.advance(time_step);
        self.writes[0] |= 1;
    }

    fn sync_time_step(&mut self, time_step: u64) {
        self.advance(time_step);
    }

    fn last_update_time_step(&self) -> u64 {
        self.last_update_time_step
    }

    fn window_size(&self) -> usize {
        self.reads.len() * WORD_BITS
    }

    fn read_words(&self) -> &[u64] {
        &self.reads
    }

    fn write_words(&self) -> &[u64] {
        &self.writes
    }
}

/// Which tracker a cache creates for newly inserted items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessTrackerKind {
    #[default]
    Fixed,
    Variable { window_size: usize },
}

impl AccessTrackerKind {
    pub fn create(&self) -> Box<dyn AccessTracker> {
        match self {
            AccessTrackerKind::Fixed => Box::new(FixedSizeAccessTracker::new()),
            AccessTrackerKind::Variable { window_size } => {
                Box::new(VariableSizeAccessTracker::new(*window_size))
            }
        }
    }
}
