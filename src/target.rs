//! Reference target endpoint.
//!
//! Answers `GET /` with the number of milliseconds it spent hashing the
//! caller's `X-Forwarded-For` header, as a plain decimal body.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

/// Configuration for the target server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    /// Port to listen on (0 for random)
    pub port: u16,
    /// Hash rounds per request
    pub iterations: u32,
    /// Extra latency per response in milliseconds
    pub latency_ms: u64,
    /// Error rate (0.0 to 1.0)
    pub error_rate: f64,
    /// Report this value instead of the measured time
    pub fixed_millis: Option<i64>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            iterations: 100_000,
            latency_ms: 0,
            error_rate: 0.0,
            fixed_millis: None,
        }
    }
}

pub struct TargetServer {
    config: TargetConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl TargetServer {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            port: 0,
        }
    }

    /// Start the server and return the actual port
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = router(self.config.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        tracing::info!("Target listening on http://{}:{}", self.config.host, port);
        Ok(port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL clients should use
    pub fn url(&self) -> String {
        let host = match self.config.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            host => host,
        };
        format!("http://{}:{}/", host, self.port)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TargetServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn router(config: TargetConfig) -> Router {
    Router::new()
        .route("/", get(handle_hash))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(config))
}

async fn handle_hash(State(config): State<Arc<TargetConfig>>, headers: HeaderMap) -> Response {
    if config.error_rate > 0.0 && rand::thread_rng().gen::<f64>() < config.error_rate {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Simulated error").into_response();
    }

    let start = Instant::now();
    let origin = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let iterations = config.iterations;

    let hashed = tokio::task::spawn_blocking(move || {
        let mut acc = 0u32;
        for _ in 0..iterations {
            acc ^= fnv1a_32(origin.as_bytes());
        }
        acc
    })
    .await;
    if let Err(e) = hashed {
        tracing::error!("Hash task failed: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "hash task failed").into_response();
    }

    if config.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.latency_ms)).await;
    }

    let millis = config
        .fixed_millis
        .unwrap_or_else(|| start.elapsed().as_millis() as i64);
    tracing::debug!("milliseconds: {}", millis);

    (StatusCode::OK, millis.to_string()).into_response()
}

/// 32-bit FNV-1a
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[tokio::test]
    async fn test_hash_returns_integer_body() {
        let app = router(TargetConfig {
            iterations: 1_000,
            ..Default::default()
        });

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-forwarded-for", "10.1.2.3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.parse::<i64>().is_ok(), "body was {body:?}");
    }

    #[tokio::test]
    async fn test_fixed_millis() {
        let app = router(TargetConfig {
            iterations: 1,
            fixed_millis: Some(117),
            ..Default::default()
        });

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(body_string(response).await, "117");
    }

    #[tokio::test]
    async fn test_error_rate_one_always_fails() {
        let app = router(TargetConfig {
            error_rate: 1.0,
            ..Default::default()
        });

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response).await.parse::<i64>().is_err());
    }

    #[tokio::test]
    async fn test_target_server_starts() {
        let mut server = TargetServer::new(TargetConfig {
            iterations: 10,
            fixed_millis: Some(3),
            ..Default::default()
        });
        let port = server.start().await.unwrap();
        assert!(port > 0);
        assert_eq!(server.url(), format!("http://127.0.0.1:{}/", port));

        let body = reqwest::get(server.url()).await.unwrap().text().await.unwrap();
        assert_eq!(body, "3");
        server.stop();
    }
}
