//! Rate-paced request producer.
//!
//! Emits `batch_size` requests at the start of every pacing cycle and then
//! sleeps out the rest of the cycle. A cycle that overruns its interval is
//! followed immediately by the next one; lost throughput is never made up
//! with extra batches.

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::codec;
use crate::config::{batch_interval, PipelineConfig};
use crate::error::{LoadtestError, Result};

/// An outbound request waiting for a worker
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl PendingRequest {
    pub fn get(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| LoadtestError::RequestBuild(format!("{}: {}", endpoint, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("loadtest/", env!("CARGO_PKG_VERSION"))),
        );

        Ok(Self {
            method: Method::GET,
            url,
            headers,
        })
    }

    pub fn into_request(self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method, self.url);
        *request.headers_mut() = self.headers;
        request
    }
}

/// Produces pending requests into the shared request queue
#[derive(Debug, Clone)]
pub struct RequestGenerator {
    requests_per_minute: u32,
    batch_size: usize,
    endpoint: String,
}

impl RequestGenerator {
    pub fn new(requests_per_minute: u32, batch_size: usize, endpoint: String) -> Self {
        Self {
            requests_per_minute,
            batch_size,
            endpoint,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.requests_per_minute,
            config.batch_size,
            config.endpoint.clone(),
        )
    }

    pub fn interval(&self) -> Duration {
        batch_interval(self.requests_per_minute, self.batch_size)
    }

    /// Run pacing cycles until `shutdown` flips to `true`
    ///
    /// Owns `requests` and closes it (by dropping) on return. Construction
    /// failures go to `diagnostics` and do not end the cycle. Returns the
    /// number of requests enqueued.
    pub async fn generate(
        self,
        requests: mpsc::Sender<PendingRequest>,
        diagnostics: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let interval = self.interval();
        let mut enqueued = 0u64;

        tracing::info!(
            requests_per_minute = self.requests_per_minute,
            batch_size = self.batch_size,
            interval_ms = interval.as_millis() as u64,
            "Request generator started"
        );

        loop {
            let deadline = Instant::now() + interval;

            for _ in 0..self.batch_size {
                match PendingRequest::get(&self.endpoint) {
                    Ok(request) => {
                        // Blocks while the queue is full
                        if requests.send(request).await.is_err() {
                            tracing::warn!("Request queue closed by consumers, stopping generator");
                            return enqueued;
                        }
                        enqueued += 1;
                    }
                    Err(e) => {
                        tracing::warn!("{}", e);
                        let _ = diagnostics.send(codec::defang(&e.to_string())).await;
                    }
                }
            }

            let cancelled = *shutdown.borrow();
            if cancelled || wait_until(deadline, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(enqueued, "Request generator stopped, closing request queue");
        enqueued
    }
}

/// Sleep until `deadline`; returns `true` if cancelled first
async fn wait_until(deadline: Instant, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            changed = shutdown.changed() => {
                // A dropped sender means nobody can ever resume us
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    const ENDPOINT: &str = "http://127.0.0.1:9/";

    #[test]
    fn test_pending_request_get() {
        let request = PendingRequest::get("http://example.com/hash?x=1").unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.as_str(), "http://example.com/hash?x=1");
        assert!(request.headers.contains_key(USER_AGENT));

        let built = request.into_request();
        assert_eq!(built.method(), &Method::GET);
        assert!(built.headers().contains_key(USER_AGENT));
    }

    #[test]
    fn test_pending_request_rejects_bad_url() {
        let err = PendingRequest::get("::not a url::").unwrap_err();
        assert!(matches!(err, LoadtestError::RequestBuild(_)));
    }

    #[test]
    fn test_interval_math() {
        let generator = RequestGenerator::new(600, 10, ENDPOINT.to_string());
        assert_eq!(generator.interval(), Duration::from_secs(1));

        let generator = RequestGenerator::new(240, 4, ENDPOINT.to_string());
        assert_eq!(generator.interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_hits_target_rate() {
        let (req_tx, mut req_rx) = mpsc::channel(1024);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let generator = RequestGenerator::new(600, 10, ENDPOINT.to_string());
        let handle = tokio::spawn(generator.generate(req_tx, diag_tx, stop_rx));

        // Ten cycles fit in the window: t = 0s, 1s, ..., 9s
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        stop_tx.send(true).unwrap();
        let enqueued = handle.await.unwrap();

        let mut received = 0u64;
        while req_rx.recv().await.is_some() {
            received += 1;
        }

        assert_eq!(received, enqueued);
        assert!((95..=105).contains(&received), "got {received}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_spaced_by_interval() {
        let (req_tx, mut req_rx) = mpsc::channel(64);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let generator = RequestGenerator::new(120, 4, ENDPOINT.to_string());
        let start = Instant::now();
        let handle = tokio::spawn(generator.generate(req_tx, diag_tx, stop_rx));

        let mut arrivals = Vec::new();
        for _ in 0..12 {
            req_rx.recv().await.unwrap();
            arrivals.push(start.elapsed());
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // 120 rpm in batches of 4 is one batch every 2 seconds
        assert!(arrivals[..4].iter().all(|t| *t < Duration::from_secs(1)));
        assert!(arrivals[4..8]
            .iter()
            .all(|t| *t >= Duration::from_secs(2) && *t < Duration::from_secs(3)));
        assert!(arrivals[8..].iter().all(|t| *t >= Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_generator_blocks_when_queue_full() {
        let (req_tx, mut req_rx) = mpsc::channel(3);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let generator = RequestGenerator::new(600, 10, ENDPOINT.to_string());
        let mut generate = task::spawn(generator.generate(req_tx, diag_tx, stop_rx));

        assert_pending!(generate.poll());
        assert_pending!(generate.poll());

        let mut drained = 0;
        while req_rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 3);

        // Freeing capacity lets exactly another queue-full through
        assert!(generate.is_woken());
        assert_pending!(generate.poll());

        let mut drained = 0;
        while req_rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finishes_batch_and_closes_queue() {
        let (req_tx, mut req_rx) = mpsc::channel(64);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        // Cancelled before the first cycle even starts
        stop_tx.send(true).unwrap();

        let generator = RequestGenerator::new(60, 5, ENDPOINT.to_string());
        let enqueued = generator.generate(req_tx, diag_tx, stop_rx).await;
        assert_eq!(enqueued, 5);

        let mut received = 0;
        while req_rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_failures_become_diagnostics() {
        let (req_tx, mut req_rx) = mpsc::channel(64);
        let (diag_tx, mut diag_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(true);

        let generator = RequestGenerator::new(60, 3, "not a url".to_string());
        let enqueued = generator.generate(req_tx, diag_tx, stop_rx).await;
        drop(stop_tx);

        assert_eq!(enqueued, 0);
        assert!(req_rx.recv().await.is_none());

        let mut diagnostics = Vec::new();
        while let Some(line) = diag_rx.recv().await {
            diagnostics.push(line);
        }
        assert_eq!(diagnostics.len(), 3);
        assert!(diagnostics[0].starts_with("Request construction failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_shutdown_sender_stops_generator() {
        let (req_tx, _req_rx) = mpsc::channel(64);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        let generator = RequestGenerator::new(60, 2, ENDPOINT.to_string());
        assert_eq!(generator.generate(req_tx, diag_tx, stop_rx).await, 2);
    }

    #[tokio::test]
    async fn test_stops_when_consumers_are_gone() {
        let (req_tx, req_rx) = mpsc::channel(1);
        let (diag_tx, _diag_rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(req_rx);

        let generator = RequestGenerator::new(600, 10, ENDPOINT.to_string());
        assert_eq!(generator.generate(req_tx, diag_tx, stop_rx).await, 0);
    }
}
