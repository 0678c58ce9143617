// Integration tests for the loadtest pipeline
//
// These run the full generator → workers → decoder path against a real
// target server listening on a random local port.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loadtest::{
    config::PipelineConfig,
    report::HistorySummary,
    target::{TargetConfig, TargetServer},
    Pipeline,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

/// Log destination the test can read back
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn start_target(config: TargetConfig) -> TargetServer {
    let mut server = TargetServer::new(config);
    server.start().await.expect("Failed to start target server");
    server
}

fn pipeline_config(endpoint: String) -> PipelineConfig {
    PipelineConfig {
        endpoint,
        requests_per_minute: 240,
        batch_size: 4,
        workers: 4,
        request_timeout: Duration::from_secs(5),
        result_mining: true,
        duration: None,
    }
}

// ==================================================================================================
// End-to-end runs
// ==================================================================================================

#[tokio::test]
async fn test_run_against_target_collects_every_result() {
    let server = start_target(TargetConfig {
        iterations: 10,
        latency_ms: 50,
        fixed_millis: Some(117),
        ..Default::default()
    })
    .await;

    // One batch of 4 per second for 2 seconds
    let mut config = pipeline_config(server.url());
    config.duration = Some(Duration::from_secs(2));
    let out = SharedBuffer::default();
    let pipeline = Pipeline::new(config, Box::new(out.clone())).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(15), pipeline.run())
        .await
        .expect("run should end after its duration")
        .unwrap();

    let history = pipeline.history();
    assert_eq!(summary.requests_enqueued % 4, 0);
    assert!(
        (8..=12).contains(&summary.requests_enqueued),
        "enqueued {}",
        summary.requests_enqueued
    );
    assert_eq!(summary.requests_processed, summary.requests_enqueued);
    assert_eq!(history.len() as u64, summary.requests_enqueued);
    assert_eq!(summary.records, history.len());

    for result in &history {
        assert!(result.success);
        assert_eq!(result.hash_duration_millis, 117);
        assert!(
            (40..1_000).contains(&result.total_duration_millis),
            "total {}ms",
            result.total_duration_millis
        );
    }

    // Every record also reached the log unchanged
    let logged = out.contents();
    assert_eq!(logged.lines().count(), history.len());
    assert!(logged.lines().all(|l| l.starts_with("-~:117:true:")));

    let stats = HistorySummary::from_results(&history);
    assert_eq!(stats.failures, 0);
    assert!(stats.latency_p50_ms >= 40);
}

#[tokio::test]
async fn test_shutdown_drains_slow_requests_as_failures() {
    let server = start_target(TargetConfig {
        iterations: 1,
        latency_ms: 10_000,
        ..Default::default()
    })
    .await;

    let mut config = pipeline_config(server.url());
    config.request_timeout = Duration::from_millis(200);
    let pipeline = Pipeline::new(config, Box::new(io::sink())).unwrap();

    // Cancelled before the first cycle: a single batch still goes out
    pipeline.shutdown_handle().shutdown();
    let summary = tokio::time::timeout(Duration::from_secs(5), pipeline.run())
        .await
        .expect("timeouts should bound the drain")
        .unwrap();

    assert_eq!(summary.requests_enqueued, 4);
    let history = pipeline.history();
    assert_eq!(history.len(), 4);
    assert!(history
        .iter()
        .all(|r| !r.success && r.hash_duration_millis == 0 && r.total_duration_millis == 0));
}

#[tokio::test]
async fn test_server_errors_are_diagnostics() {
    let server = start_target(TargetConfig {
        error_rate: 1.0,
        ..Default::default()
    })
    .await;

    let out = SharedBuffer::default();
    let pipeline = Pipeline::new(pipeline_config(server.url()), Box::new(out.clone())).unwrap();

    pipeline.shutdown_handle().shutdown();
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.requests_processed, 4);
    assert_eq!(summary.records, 0);
    assert!(pipeline.history().is_empty());
    let logged = out.contents();
    assert_eq!(logged.lines().count(), 4);
    assert!(logged.lines().all(|l| l.contains("not an integer")));
}

#[tokio::test]
async fn test_run_without_result_mining() {
    let server = start_target(TargetConfig {
        iterations: 1,
        fixed_millis: Some(9),
        ..Default::default()
    })
    .await;

    let mut config = pipeline_config(server.url());
    config.result_mining = false;
    let out = SharedBuffer::default();
    let pipeline = Pipeline::new(config, Box::new(out.clone())).unwrap();

    pipeline.shutdown_handle().shutdown();
    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.requests_processed, 4);
    assert!(pipeline.history().is_empty());
    assert!(out.contents().lines().all(|l| l.starts_with("-~:9:true:")));
}
