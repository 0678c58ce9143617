//! Summaries of the result history.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::codec::RequestResult;
use crate::parser::LogParser;

/// Aggregate view over a slice of results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub latency_max_ms: u64,
    pub mean_hash_ms: f64,
}

impl HistorySummary {
    /// Latency percentiles cover successful requests only; failures carry
    /// no timing.
    pub fn from_results(results: &[RequestResult]) -> Self {
        let total = results.len() as u64;
        let successes = results.iter().filter(|r| r.success).count() as u64;
        let failures = total - successes;

        let mut summary = Self {
            total,
            successes,
            failures,
            success_rate: if total == 0 {
                100.0
            } else {
                successes as f64 / total as f64 * 100.0
            },
            ..Default::default()
        };

        if successes == 0 {
            return summary;
        }

        let hash_total: i64 = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.hash_duration_millis)
            .sum();
        summary.mean_hash_ms = hash_total as f64 / successes as f64;

        // Auto-resizing, 3 significant figures
        if let Ok(mut hist) = Histogram::<u64>::new(3) {
            for result in results.iter().filter(|r| r.success) {
                let _ = hist.record(result.total_duration_millis.max(0) as u64);
            }
            summary.latency_p50_ms = hist.value_at_quantile(0.50);
            summary.latency_p95_ms = hist.value_at_quantile(0.95);
            summary.latency_p99_ms = hist.value_at_quantile(0.99);
            summary.latency_max_ms = hist.max();
        }

        summary
    }

    /// One-line form for periodic logging
    pub fn one_line(&self) -> String {
        format!(
            "{} results ({} ok, {} failed, {:.1}% success) p50={}ms p95={}ms p99={}ms max={}ms",
            self.total,
            self.successes,
            self.failures,
            self.success_rate,
            self.latency_p50_ms,
            self.latency_p95_ms,
            self.latency_p99_ms,
            self.latency_max_ms
        )
    }

    /// Print the summary as an ASCII table
    pub fn print_table(&self) {
        println!();
        println!("┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐");
        println!("│ Requests │  Failed  │ Success% │  p50(ms) │  p95(ms) │  p99(ms) │  max(ms) │ hash(ms) │");
        println!("├──────────┼──────────┼──────────┼──────────┼──────────┼──────────┼──────────┼──────────┤");
        println!(
            "│ {:>8} │ {:>8} │ {:>7.1}% │ {:>8} │ {:>8} │ {:>8} │ {:>8} │ {:>8.1} │",
            self.total,
            self.failures,
            self.success_rate,
            self.latency_p50_ms,
            self.latency_p95_ms,
            self.latency_p99_ms,
            self.latency_max_ms,
            self.mean_hash_ms
        );
        println!("└──────────┴──────────┴──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘");
        println!();
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Log a summary of `parser`'s history every `every` until shutdown
pub async fn report_periodically(
    parser: Arc<dyn LogParser>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let history = parser.history();
                if history.is_empty() {
                    continue;
                }
                tracing::info!("{}", HistorySummary::from_results(&history).one_line());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
