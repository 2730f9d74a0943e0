//! HTTP API over a real socket

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mcc_proxy::cache_connector::InMemoryCacheStore;
use mcc_proxy::config::{CacheConfig, ServerConfig, VersionSelectionPolicy};
use mcc_proxy::db_connector::InMemoryDatabase;
use mcc_proxy::predictor::SimpleObsoleteItemsPredictor;
use mcc_proxy::proxy::MccProxy;
use mcc_proxy::server::{ApiServer, HealthResponse, ReadResponse};
use mcc_proxy::shutdown::ShutdownCoordinator;
use mcc_proxy::task_queue::spawn_worker;
use mcc_proxy::time_utils::nanos_to_timestamp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    db: Arc<InMemoryDatabase>,
    coordinator: ShutdownCoordinator,
    server_task: JoinHandle<()>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl TestServer {
    async fn start() -> Self {
        let db = Arc::new(InMemoryDatabase::new());
        let proxy = MccProxy::new(
            &CacheConfig::default(),
            VersionSelectionPolicy::Eager,
            db.clone(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(SimpleObsoleteItemsPredictor),
        );
        proxy.start().await.unwrap();
        let (handle, _worker) = spawn_worker(proxy);

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.set_proxy_handle(handle.clone());

        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = ApiServer::new(&config, handle, "it-host".to_string());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signal = coordinator.subscribe();
        let server_task = tokio::spawn(async move {
            server.serve(listener, signal).await.unwrap();
        });

        Self {
            addr,
            db,
            coordinator,
            server_task,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// Close pooled client connections first so the server drains immediately
    async fn stop(self) {
        let TestServer {
            coordinator,
            server_task,
            client,
            ..
        } = self;
        drop(client);
        coordinator.initiate_shutdown().await.unwrap();
        server_task.await.unwrap();
    }

    async fn call(&self, method: Method, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[tokio::test]
async fn test_read_invalidate_and_metrics_over_http() {
    let server = TestServer::start().await;
    let version = server
        .db
        .write_batch("test", &[("key1", "1"), ("key2", "2")])
        .unwrap();

    let invalidate = serde_json::json!({
        "keys": ["key1", "key2"],
        "timestamp": nanos_to_timestamp(version),
    });
    let (status, body) = server
        .call(Method::POST, "/invalidate", &invalidate.to_string())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    for _ in 0..2 {
        let (status, body) = server
            .call(Method::POST, "/read", r#"{"keys":["key1","key2"]}"#)
            .await;
        assert_eq!(status, StatusCode::OK);
        let response: ReadResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.items.len(), 2);
        assert!(response.items.iter().all(|item| item.version == version));
    }

    let (status, metrics) = server.call(Method::GET, "/metrics", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["read_requests"], 2);
    assert_eq!(metrics["db_reads"], 1);
    assert_eq!(metrics["mcc_hits"], 1);
    assert_eq!(metrics["invalidation_requests"], 1);
    assert_eq!(metrics["cache"]["item_count"], 2);

    server.stop().await;
}

#[tokio::test]
async fn test_error_statuses_over_http() {
    let server = TestServer::start().await;

    let (status, body) = server.call(Method::POST, "/read", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = server.call(Method::DELETE, "/read", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.db.set_available(false);
    let (status, _) = server.call(Method::POST, "/read", r#"{"keys":["a"]}"#).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, health) = server.call(Method::GET, "/health", "").await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(health).unwrap();
    assert_eq!(health.hostname, "it-host");

    server.stop().await;
}
