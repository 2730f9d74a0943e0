//! API Server Module
//!
//! JSON over HTTP/1 front end of the proxy:
//!
//! - `POST /read` `{"keys": [..]}` returns `{"items": [{"key", "value", "version"}]}`
//! - `POST /invalidate` `{"keys": [..], "timestamp": {"seconds", "nanos"}}` returns
//!   `{"success": true}`
//! - `GET /metrics` returns the proxy counters and index statistics
//! - `GET /health` returns status, build version and host name

use crate::cache_types::ItemRecord;
use crate::config::ServerConfig;
use crate::consistent_cache::ConsistentCacheStats;
use crate::metrics::MetricsSnapshot;
use crate::shutdown::ShutdownSignal;
use crate::task_queue::ProxyHandle;
use crate::time_utils::{timestamp_to_nanos, Timestamp};
use crate::{ProxyError, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const BUILD_VERSION: &str = match option_env!("BUILD_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

const BUILD_TIMESTAMP: &str = match option_env!("BUILD_TIMESTAMP") {
    Some(timestamp) => timestamp,
    None => "unknown",
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub items: Vec<ItemRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub keys: Vec<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub build_timestamp: String,
    pub hostname: String,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    cache: Option<ConsistentCacheStats>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Decrements the active connection count when a connection ends
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Request router, cloned into every connection
#[derive(Clone)]
pub struct ApiHandler {
    handle: ProxyHandle,
    hostname: String,
}

impl ApiHandler {
    pub fn new(handle: ProxyHandle, hostname: String) -> Self {
        Self { handle, hostname }
    }

    /// Dispatch one request whose body has already been read
    pub async fn route(&self, method: &Method, path: &str, body: &[u8]) -> Response<String> {
        let result = match (method, path) {
            (&Method::POST, "/read") => self.handle_read(body).await,
            (&Method::POST, "/invalidate") => self.handle_invalidate(body).await,
            (&Method::GET, "/metrics") => self.handle_metrics().await,
            (&Method::GET, "/health") => Ok(self.handle_health()),
            _ => {
                debug!("No route for {} {}", method, path);
                return error_response(StatusCode::NOT_FOUND, &format!("No route for {} {}", method, path));
            }
        };
        result.unwrap_or_else(|e| {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!("{} {} failed: {}", method, path, e);
            }
            error_response(status, &e.to_string())
        })
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<String> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match req.into_body().collect().await {
            Ok(collected) => self.route(&method, &path, &collected.to_bytes()).await,
            Err(e) => error_response(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read request body: {}", e),
            ),
        }
    }

    async fn handle_read(&self, body: &[u8]) -> Result<Response<String>> {
        let request: ReadRequest = parse_body(body)?;
        let items = self.handle.read(request.keys).await?;
        json_response(StatusCode::OK, &ReadResponse { items })
    }

    async fn handle_invalidate(&self, body: &[u8]) -> Result<Response<String>> {
        let request: InvalidateRequest = parse_body(body)?;
        let version = timestamp_to_nanos(&request.timestamp)?;
        let success = self.handle.invalidate(request.keys, version).await?;
        json_response(StatusCode::OK, &InvalidateResponse { success })
    }

    async fn handle_metrics(&self) -> Result<Response<String>> {
        let cache = self.handle.cache_stats().await.ok();
        let body = MetricsResponse {
            counters: self.handle.metrics().snapshot(),
            cache,
        };
        json_response(StatusCode::OK, &body)
    }

    fn handle_health(&self) -> Response<String> {
        let (status, code) = if self.handle.is_closed() {
            ("shutting_down", StatusCode::SERVICE_UNAVAILABLE)
        } else {
            ("ok", StatusCode::OK)
        };
        let body = HealthResponse {
            status: status.to_string(),
            version: BUILD_VERSION.to_string(),
            build_timestamp: BUILD_TIMESTAMP.to_string(),
            hostname: self.hostname.clone(),
        };
        json_response(code, &body)
            .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
    }
}

/// HTTP API server
pub struct ApiServer {
    bind_address: String,
    port: u16,
    request_timeout: Duration,
    handler: ApiHandler,
}

impl ApiServer {
    pub fn new(config: &ServerConfig, handle: ProxyHandle, hostname: String) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            request_timeout: config.request_timeout,
            handler: ApiHandler::new(handle, hostname),
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(
            self.bind_address.parse().map_err(|e| {
                ProxyError::ConfigError(format!("Invalid bind address {}: {}", self.bind_address, e))
            })?,
            self.port,
        );
        TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to bind API server to {}: {}", addr, e))
        })
    }

    /// Bind and serve until shutdown is signalled
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from `listener` until shutdown is signalled, then give open
    /// connections a few seconds to finish
    pub async fn serve(&self, listener: TcpListener, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("API server listening on {}", addr);
        }
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            debug!("Accepted connection from {}", remote_addr);
                            let io = TokioIo::new(stream);
                            let handler = self.handler.clone();
                            let request_timeout = self.request_timeout;
                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let guard = ConnectionGuard { counter: active_connections.clone() };

                            tokio::spawn(async move {
                                let _guard = guard;
                                let service = service_fn(move |req| {
                                    let handler = handler.clone();
                                    async move {
                                        let response = match tokio::time::timeout(
                                            request_timeout,
                                            handler.handle_request(req),
                                        )
                                        .await
                                        {
                                            Ok(response) => response,
                                            Err(_) => {
                                                error!("API request timed out after {:?}", request_timeout);
                                                error_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
                                            }
                                        };
                                        Ok::<_, hyper::Error>(response)
                                    }
                                });

                                let mut builder = http1::Builder::new();
                                builder.keep_alive(true);
                                if let Err(e) = builder.serve_connection(io, service).await {
                                    debug!("Connection from {} ended with error: {}", remote_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("API server received shutdown signal");
                    break;
                }
            }
        }

        let drain_deadline = Instant::now() + Duration::from_secs(5);
        while active_connections.load(Ordering::Relaxed) > 0 && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("API server stopped with {} open connections", remaining);
        }
        info!("API server stopped");
        Ok(())
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Malformed request body: {}", e)))
}

fn status_for(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::InvalidRequest(_) | ProxyError::SerializationError(_) => StatusCode::BAD_REQUEST,
        ProxyError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_collaborator_failure() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<String>> {
    let body = serde_json::to_string(body)?;
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body)
        .map_err(|e| ProxyError::HttpError(format!("Failed to build response: {}", e)))
}

fn error_response(status: StatusCode, message: &str) -> Response<String> {
    let body = serde_json::to_string(&ErrorResponse {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_connector::InMemoryCacheStore;
    use crate::config::{CacheConfig, VersionSelectionPolicy};
    use crate::db_connector::InMemoryDatabase;
    use crate::predictor::SimpleObsoleteItemsPredictor;
    use crate::proxy::MccProxy;
    use crate::task_queue::spawn_worker;

    fn handler() -> (ApiHandler, Arc<InMemoryDatabase>) {
        let db = Arc::new(InMemoryDatabase::new());
        let proxy = MccProxy::new(
            &CacheConfig::default(),
            VersionSelectionPolicy::Eager,
            db.clone(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(SimpleObsoleteItemsPredictor),
        );
        let (handle, _worker) = spawn_worker(proxy);
        (ApiHandler::new(handle, "test-host".to_string()), db)
    }

    fn json(response: &Response<String>) -> serde_json::Value {
        serde_json::from_str(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_read_and_invalidate_routes() {
        let (handler, db) = handler();
        let version = db.write("test", "a", "1").unwrap();

        let body = serde_json::json!({
            "keys": ["a"],
            "timestamp": { "seconds": 0, "nanos": version }
        });
        let response = handler
            .route(&Method::POST, "/invalidate", body.to_string().as_bytes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(&response)["success"], true);

        let response = handler.route(&Method::POST, "/read", br#"{"keys":["a","zz"]}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        let parsed: ReadResponse = serde_json::from_str(response.body()).unwrap();
        assert_eq!(parsed.items, vec![ItemRecord::new("a", "1", version)]);
    }

    #[tokio::test]
    async fn test_empty_read_returns_no_items() {
        let (handler, _db) = handler();
        let response = handler.route(&Method::POST, "/read", br#"{"keys":[]}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(&response)["items"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (handler, _db) = handler();
        let response = handler.route(&Method::POST, "/read", b"{not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json(&response)["error"].is_string());

        let response = handler
            .route(
                &Method::POST,
                "/invalidate",
                br#"{"keys":["a"],"timestamp":{"seconds":-1,"nanos":0}}"#,
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_database_outage_is_bad_gateway() {
        let (handler, db) = handler();
        db.set_available(false);
        let response = handler.route(&Method::POST, "/read", br#"{"keys":["a"]}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (handler, _db) = handler();
        let response = handler.route(&Method::GET, "/read", b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (handler, _db) = handler();
        let response = handler.route(&Method::GET, "/health", b"").await;
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = serde_json::from_str(response.body()).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.hostname, "test-host");
        assert!(!health.version.is_empty());

        handler.route(&Method::POST, "/read", br#"{"keys":["a"]}"#).await;
        let response = handler.route(&Method::GET, "/metrics", b"").await;
        let metrics = json(&response);
        assert_eq!(metrics["read_requests"], 1);
        assert_eq!(metrics["cache"]["item_count"], 0);
    }

    #[tokio::test]
    async fn test_health_reports_shutdown() {
        let (handler, _db) = handler();
        handler.handle.shutdown().await.unwrap();
        let response = handler.route(&Method::GET, "/health", b"").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = handler.route(&Method::POST, "/read", br#"{"keys":["a"]}"#).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ProxyError::CacheStoreError("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ProxyError::InvariantViolation("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&ProxyError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
