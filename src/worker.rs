//! Fixed-size worker pool draining the shared request queue.

use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{self, RequestResult};
use crate::generator::PendingRequest;

/// Shared receiving end of the request queue
pub type RequestQueue = Arc<Mutex<mpsc::Receiver<PendingRequest>>>;

/// Build the HTTP client shared by all workers
pub fn build_client(request_timeout: Duration, workers: usize) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .pool_max_idle_per_host(workers)
        .build()
        .context("Failed to create HTTP client")
}

/// What a single request attempt produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Record(RequestResult),
    /// Local error, logged but not counted as a result
    Diagnostic(String),
}

impl Outcome {
    /// The single output-stream line for this outcome
    pub fn into_line(self) -> String {
        match self {
            Outcome::Record(result) => codec::encode(&result),
            Outcome::Diagnostic(message) => message,
        }
    }
}

/// Execute one request and turn the round trip into an outcome
pub async fn execute_request(client: &reqwest::Client, request: PendingRequest) -> Outcome {
    let url = request.url.clone();
    let start = Instant::now();

    let response = match client.execute(request.into_request()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Transport failure");
            return Outcome::Record(RequestResult::failure());
        }
    };

    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Failed to read response body");
            return Outcome::Record(RequestResult::failure());
        }
    };
    let elapsed_ms = start.elapsed().as_millis() as i64;

    match body.trim().parse::<i64>() {
        Ok(hash_duration_millis) => {
            Outcome::Record(RequestResult::success(hash_duration_millis, elapsed_ms))
        }
        // The body is untrusted and must not reach the decoder as a record
        Err(e) => Outcome::Diagnostic(codec::defang(&format!(
            "response from {} ({}) is not an integer: {:?}: {}",
            url,
            status,
            truncate(&body, 64),
            e
        ))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

struct Worker {
    id: usize,
    client: reqwest::Client,
    requests: RequestQueue,
    output: mpsc::Sender<String>,
}

impl Worker {
    async fn run(self) -> u64 {
        let mut processed = 0u64;

        loop {
            let next = {
                let mut requests = self.requests.lock().await;
                requests.recv().await
            };
            // Queue closed and drained
            let Some(request) = next else { break };

            processed += 1;
            let outcome = execute_request(&self.client, request).await;
            if let Outcome::Diagnostic(ref message) = outcome {
                tracing::warn!(worker = self.id, "{}", message);
            }

            // One send per outcome keeps records whole on the output stream
            if self.output.send(outcome.into_line()).await.is_err() {
                tracing::warn!(worker = self.id, "Output stream closed, stopping worker");
                break;
            }
        }

        tracing::debug!(worker = self.id, processed, "Worker finished");
        processed
    }
}

/// Handle to a running set of workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining `requests` into `output`
    pub fn spawn(
        workers: usize,
        client: reqwest::Client,
        requests: mpsc::Receiver<PendingRequest>,
        output: mpsc::Sender<String>,
    ) -> Self {
        let requests: RequestQueue = Arc::new(Mutex::new(requests));

        let handles = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    client: client.clone(),
                    requests: Arc::clone(&requests),
                    output: output.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(workers, "Worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to finish; returns requests processed per worker
    pub async fn join(self) -> Vec<u64> {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(processed) => processed,
                Err(e) => {
                    tracing::error!("Worker task failed: {}", e);
                    0
                }
            })
            .collect()
    }
}
