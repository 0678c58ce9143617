//! Pipeline coordinator.
//!
//! Wires generator → request queue → worker pool → output stream → decoder,
//! and owns the cancellation signal for a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::codec::RequestResult;
use crate::config::PipelineConfig;
use crate::error::{LoadtestError, Result};
use crate::generator::RequestGenerator;
use crate::parser::{DisabledLogParser, LogParser, ResultLogParser};
use crate::worker::{build_client, WorkerPool};

/// Output lines buffered between workers and the decoder
const OUTPUT_BUFFER: usize = 256;

/// Cloneable trigger for the run's cooperative cancellation
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Ask the generator to stop after its current batch
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// What happened during one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub requests_enqueued: u64,
    pub requests_processed: u64,
    pub lines_relayed: u64,
    pub records: usize,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    parser: Arc<dyn LogParser>,
    /// Log destination used directly when result mining is off
    plain_log: Option<Mutex<Box<dyn Write + Send>>>,
    shutdown: ShutdownHandle,
}

impl Pipeline {
    /// Build a pipeline logging to `log`
    ///
    /// With result mining on, lines go through a `ResultLogParser` teeing to
    /// `log`; with it off, lines go to `log` directly and the history stays
    /// empty.
    pub fn new(config: PipelineConfig, log: Box<dyn Write + Send>) -> Result<Self> {
        if config.result_mining {
            let parser: Arc<dyn LogParser> = Arc::new(ResultLogParser::new(log));
            Self::build(config, parser, None)
        } else {
            Self::build(config, Arc::new(DisabledLogParser), Some(Mutex::new(log)))
        }
    }

    /// Build a pipeline that relays every line into `parser`
    pub fn with_parser(config: PipelineConfig, parser: Arc<dyn LogParser>) -> Result<Self> {
        Self::build(config, parser, None)
    }

    fn build(
        config: PipelineConfig,
        parser: Arc<dyn LogParser>,
        plain_log: Option<Mutex<Box<dyn Write + Send>>>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            parser,
            plain_log,
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn parser(&self) -> Arc<dyn LogParser> {
        Arc::clone(&self.parser)
    }

    /// Results decoded so far, in completion order
    pub fn history(&self) -> Vec<RequestResult> {
        self.parser.history()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until cancelled (or `config.duration` elapses) and everything drains
    ///
    /// Returns an error if the HTTP client cannot be built or the decoder
    /// hits a malformed record.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let records_before = self.parser.len();

        let client = build_client(self.config.request_timeout, self.config.workers)?;

        let (req_tx, req_rx) = mpsc::channel(self.config.workers);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTPUT_BUFFER);

        tracing::info!(
            %run_id,
            endpoint = %self.config.endpoint,
            workers = self.config.workers,
            "Pipeline starting"
        );

        let generator = RequestGenerator::from_config(&self.config);
        let generator = tokio::spawn(generator.generate(
            req_tx,
            out_tx.clone(),
            self.shutdown.subscribe(),
        ));
        let pool = WorkerPool::spawn(self.config.workers, client, req_rx, out_tx);
        let timer = self.config.duration.map(|duration| {
            let shutdown = self.shutdown.clone();
            tokio::spawn(stop_after(duration, shutdown))
        });

        // Every sender lives in the generator or a worker, so this ends once
        // the queue is closed and drained.
        let mut lines_relayed = 0u64;
        let mut fatal = None;
        while let Some(line) = out_rx.recv().await {
            lines_relayed += 1;
            if let Err(e) = self.log_line(&line) {
                tracing::error!("Result decoding failed, stopping run: {}", e);
                self.shutdown.shutdown();
                fatal = Some(e);
                break;
            }
        }
        // Unblocks any worker still trying to write
        drop(out_rx);

        let requests_enqueued = generator
            .await
            .map_err(|e| LoadtestError::Internal(anyhow::anyhow!("generator task failed: {}", e)))?;
        let requests_processed = pool.join().await.iter().sum();
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            elapsed_secs: start.elapsed().as_secs_f64(),
            requests_enqueued,
            requests_processed,
            lines_relayed,
            records: self.parser.len().saturating_sub(records_before),
        };
        tracing::info!(
            %run_id,
            requests_enqueued,
            requests_processed,
            records = summary.records,
            "Pipeline drained"
        );
        Ok(summary)
    }

    fn log_line(&self, line: &str) -> Result<()> {
        match &self.plain_log {
            Some(log) => {
                let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
                writeln!(log, "{}", line)?;
                Ok(())
            }
            None => self.parser.write_chunk(&format!("{}\n", line)),
        }
    }
}

async fn stop_after(duration: Duration, shutdown: ShutdownHandle) {
    tokio::time::sleep(duration).await;
    tracing::info!("Run duration of {:?} reached, shutting down", duration);
    shutdown.shutdown();
}
