use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::error::LoadtestError;
use crate::target::TargetConfig;

/// Rate-paced HTTP load generator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate load against an endpoint
    Run(RunArgs),
    /// Serve the reference hashing endpoint
    Target(TargetArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Target endpoint URL
    #[arg(short, long, env = "LOADTEST_ENDPOINT", default_value = "http://127.0.0.1:8080/")]
    pub endpoint: String,

    /// Aggregate request rate
    #[arg(short = 'r', long, env = "LOADTEST_RPM", default_value = "1000")]
    pub requests_per_minute: u32,

    /// Requests enqueued per pacing cycle
    #[arg(short, long, env = "LOADTEST_BATCH_SIZE", default_value = "10")]
    pub batch_size: usize,

    /// Number of concurrent workers
    #[arg(short, long, env = "LOADTEST_WORKERS", default_value = "10")]
    pub workers: usize,

    /// Per-request timeout in seconds
    #[arg(short, long, env = "LOADTEST_TIMEOUT", default_value = "10")]
    pub timeout_secs: u64,

    /// Disable result mining (records are still logged)
    #[arg(long, env = "LOADTEST_NO_RESULT_MINING")]
    pub no_result_mining: bool,

    /// Stop after this many seconds (runs until interrupted otherwise)
    #[arg(short, long, env = "LOADTEST_DURATION")]
    pub duration_secs: Option<u64>,

    /// Seconds between progress summaries (0 disables)
    #[arg(long, env = "LOADTEST_REPORT_INTERVAL", default_value = "5")]
    pub report_interval_secs: u64,

    /// Probe the endpoint once before starting and abort if unreachable
    #[arg(long, env = "LOADTEST_PREFLIGHT")]
    pub preflight: bool,

    /// Print the final summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Listen address
    #[arg(short = 'H', long, env = "TARGET_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "TARGET_PORT", default_value = "8080")]
    pub port: u16,

    /// Hash rounds per request
    #[arg(short, long, env = "TARGET_ITERATIONS", default_value = "100000")]
    pub iterations: u32,

    /// Extra latency added to every response, in milliseconds
    #[arg(short, long, env = "TARGET_LATENCY_MS", default_value = "0")]
    pub latency_ms: u64,

    /// Fraction of requests answered with a 500 (0.0 to 1.0)
    #[arg(long, env = "TARGET_ERROR_RATE", default_value = "0.0")]
    pub error_rate: f64,
}

/// Immutable snapshot handed to the pipeline at startup
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub endpoint: String,
    pub requests_per_minute: u32,
    pub batch_size: usize,
    pub workers: usize,
    pub request_timeout: Duration,
    pub result_mining: bool,
    /// Stop on our own after this long
    pub duration: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/".to_string(),
            requests_per_minute: 1000,
            batch_size: 10,
            workers: 10,
            request_timeout: Duration::from_secs(10),
            result_mining: true,
            duration: None,
        }
    }
}

impl PipelineConfig {
    /// Time between the starts of two pacing cycles
    pub fn batch_interval(&self) -> Duration {
        batch_interval(self.requests_per_minute, self.batch_size)
    }

    pub fn validate(&self) -> Result<(), LoadtestError> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            LoadtestError::InvalidConfig(format!("invalid endpoint '{}': {}", self.endpoint, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LoadtestError::InvalidConfig(format!(
                "endpoint must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.requests_per_minute == 0 {
            return Err(LoadtestError::InvalidConfig(
                "requests per minute must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(LoadtestError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(LoadtestError::InvalidConfig(
                "worker count must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(LoadtestError::InvalidConfig(
                "request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `batch_size / (requests_per_minute / 60)` seconds
pub fn batch_interval(requests_per_minute: u32, batch_size: usize) -> Duration {
    const NANOS_PER_MINUTE: u128 = 60 * 1_000_000_000;
    let nanos = batch_size as u128 * NANOS_PER_MINUTE / requests_per_minute.max(1) as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct RunSettings {
    pub pipeline: PipelineConfig,
    /// `None` disables the periodic summary
    pub report_interval: Option<Duration>,
    pub preflight: bool,
    pub json_summary: bool,
}

#[derive(Clone, Debug)]
pub enum Mode {
    Run(RunSettings),
    Target(TargetConfig),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self::from_args(CliArgs::parse()))
    }

    pub fn from_args(args: CliArgs) -> Self {
        let mode = match args.command {
            Command::Run(run) => Mode::Run(RunSettings {
                pipeline: PipelineConfig {
                    endpoint: run.endpoint,
                    requests_per_minute: run.requests_per_minute,
                    batch_size: run.batch_size,
                    workers: run.workers,
                    request_timeout: Duration::from_secs(run.timeout_secs),
                    result_mining: !run.no_result_mining,
                    duration: run.duration_secs.map(Duration::from_secs),
                },
                report_interval: match run.report_interval_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                preflight: run.preflight,
                json_summary: run.json,
            }),
            Command::Target(target) => Mode::Target(TargetConfig {
                host: target.host,
                port: target.port,
                iterations: target.iterations,
                latency_ms: target.latency_ms,
                error_rate: target.error_rate,
                fixed_millis: None,
            }),
        };

        Config {
            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
            mode,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            Mode::Run(settings) => settings.pipeline.validate()?,
            Mode::Target(target) => {
                if !(0.0..=1.0).contains(&target.error_rate) {
                    anyhow::bail!(
                        "TARGET_ERROR_RATE must be between 0.0 and 1.0, got {}",
                        target.error_rate
                    );
                }
            }
        }
        Ok(())
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
