//! Obsolete Items Predictor Module
//!
//! Decides which eviction candidates are obsolete once a marking phase completes.
//! Implementations are selected from configuration and injected into the proxy.

use crate::access_tracker::{count_recent_accesses, RawFeature};
use crate::config::{PredictorConfig, PredictorKind};
use crate::features::FeatureVector;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Predicts obsolescence for a batch of items.
///
/// The answer is positional: entry `i` refers to `features[i]`. Missing trailing
/// entries mean "not obsolete".
#[async_trait]
pub trait ObsoleteItemsPredictor: Send + Sync {
    async fn predict(&self, features: &[RawFeature]) -> Result<Vec<bool>>;

    fn name(&self) -> &'static str;
}

/// Never predicts anything obsolete; eviction falls back to LRU
#[derive(Debug, Default)]
pub struct SimpleObsoleteItemsPredictor;

#[async_trait]
impl ObsoleteItemsPredictor for SimpleObsoleteItemsPredictor {
    async fn predict(&self, _features: &[RawFeature]) -> Result<Vec<bool>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

/// Flags items without any read in the last `idle_window` time steps
#[derive(Debug)]
pub struct IdleItemsPredictor {
    idle_window: usize,
}

impl IdleItemsPredictor {
    pub fn new(idle_window: usize) -> Self {
        Self { idle_window }
    }
}

#[async_trait]
impl ObsoleteItemsPredictor for IdleItemsPredictor {
    async fn predict(&self, features: &[RawFeature]) -> Result<Vec<bool>> {
        Ok(features
            .iter()
            .map(|feature| count_recent_accesses(&feature.read_accesses, self.idle_window) == 0)
            .collect())
    }

    fn name(&self) -> &'static str {
        "idle"
    }
}

#[derive(Debug, Serialize)]
struct PredictFeature<'a> {
    read_accesses: &'a [u64],
    write_accesses: &'a [u64],
    extracted: FeatureVector,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    features: Vec<PredictFeature<'a>>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    is_obsolete: Vec<bool>,
}

/// Client of a remote prediction service speaking JSON over HTTP.
///
/// Sends `POST /predict` with the raw windows and the extracted features of every
/// candidate and expects `{"is_obsolete": [...]}` back.
pub struct RemoteObsoleteItemsPredictor {
    client: Client<HttpConnector, Full<Bytes>>,
    uri: Uri,
    request_timeout: Duration,
}

impl RemoteObsoleteItemsPredictor {
    pub fn new(address: &str, request_timeout: Duration) -> Result<Self> {
        let base = if address.starts_with("http://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let uri: Uri = format!("{}/predict", base).parse().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid predictor address {}: {}", address, e))
        })?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(HttpConnector::new());

        info!("Remote obsolescence predictor at {}", uri);
        Ok(Self {
            client,
            uri,
            request_timeout,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

#[async_trait]
impl ObsoleteItemsPredictor for RemoteObsoleteItemsPredictor {
    async fn predict(&self, features: &[RawFeature]) -> Result<Vec<bool>> {
        if features.is_empty() {
            return Ok(Vec::new());
        }

        let payload = PredictRequest {
            features: features
                .iter()
                .map(|raw| PredictFeature {
                    read_accesses: &raw.read_accesses,
                    write_accesses: &raw.write_accesses,
                    extracted: FeatureVector::extract(raw),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&payload)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ProxyError::PredictorError(format!("Failed to build request: {}", e)))?;

        debug!("Requesting predictions for {} items", features.len());
        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::PredictorError("Prediction request timed out".to_string()))?
            .map_err(|e| ProxyError::PredictorError(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::PredictorError(format!("Failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ProxyError::PredictorError(format!(
                "Prediction service returned {}",
                status
            )));
        }

        let parsed: PredictResponse = serde_json::from_slice(&body_bytes).map_err(|e| {
            ProxyError::PredictorError(format!("Malformed prediction response: {}", e))
        })?;
        Ok(parsed.is_obsolete)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Build the predictor selected in configuration
pub fn build_predictor(config: &PredictorConfig) -> Result<Arc<dyn ObsoleteItemsPredictor>> {
    let predictor: Arc<dyn ObsoleteItemsPredictor> = match config.kind {
        PredictorKind::None => Arc::new(SimpleObsoleteItemsPredictor),
        PredictorKind::Idle => Arc::new(IdleItemsPredictor::new(config.idle_window)),
        PredictorKind::Remote => {
            let address = config.address.as_deref().ok_or_else(|| {
                ProxyError::ConfigError("Remote predictor requires an address".to_string())
            })?;
            Arc::new(RemoteObsoleteItemsPredictor::new(
                address,
                config.request_timeout,
            )?)
        }
    };
    info!("Obsolescence predictor: {}", predictor.name());
    Ok(predictor)
}
