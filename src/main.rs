use anyhow::{Context, Result};
use std::sync::Arc;

use loadtest::config::{Config, LogFormat, Mode, RunSettings};
use loadtest::report::{self, HistorySummary};
use loadtest::target::{TargetConfig, TargetServer};
use loadtest::worker::build_client;
use loadtest::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    match config.mode {
        Mode::Run(settings) => run_loadtest(settings, &host).await,
        Mode::Target(target) => serve_target(target).await,
    }
}

async fn run_loadtest(settings: RunSettings, host: &str) -> Result<()> {
    tracing::info!("Starting loadtest on {}...", host);
    tracing::info!(
        "Target: {} ({} req/min, batches of {}, {} workers, {:?} timeout, result mining {})",
        settings.pipeline.endpoint,
        settings.pipeline.requests_per_minute,
        settings.pipeline.batch_size,
        settings.pipeline.workers,
        settings.pipeline.request_timeout,
        if settings.pipeline.result_mining {
            "enabled"
        } else {
            "disabled"
        }
    );

    if settings.preflight {
        preflight(&settings)
            .await
            .with_context(|| format!("{} - endpoint unreachable", host))?;
        tracing::info!("✅ Preflight request succeeded");
    }

    // Records and diagnostics go to stdout, operational logs to stderr
    let pipeline = Arc::new(Pipeline::new(
        settings.pipeline.clone(),
        Box::new(std::io::stdout()),
    )?);
    let shutdown = pipeline.shutdown_handle();

    let reporter = settings.report_interval.map(|every| {
        tokio::spawn(report::report_periodically(
            pipeline.parser(),
            every,
            shutdown.subscribe(),
        ))
    });

    let mut runner = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run().await })
    };

    let outcome = tokio::select! {
        outcome = &mut runner => outcome,
        _ = shutdown_signal() => {
            tracing::info!("{} - Shutdown signal received, draining in-flight requests...", host);
            shutdown.shutdown();
            runner.await
        }
    };
    shutdown.shutdown();
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    let summary = outcome
        .context("pipeline task panicked")?
        .with_context(|| format!("{} - load test aborted", host))?;

    let history = HistorySummary::from_results(&pipeline.history());
    if settings.json_summary {
        println!("{}", history.to_json());
    } else if settings.pipeline.result_mining {
        history.print_table();
    }

    tracing::info!(
        "👋 Done: {} requests enqueued, {} processed, {} results in {:.1}s",
        summary.requests_enqueued,
        summary.requests_processed,
        summary.records,
        summary.elapsed_secs
    );
    Ok(())
}

/// One request against the endpoint; any transport failure aborts startup
async fn preflight(settings: &RunSettings) -> Result<()> {
    let client = build_client(settings.pipeline.request_timeout, 1)?;
    let response = client.get(&settings.pipeline.endpoint).send().await?;
    tracing::debug!(status = %response.status(), "Preflight response");
    Ok(())
}

async fn serve_target(config: TargetConfig) -> Result<()> {
    tracing::info!(
        "Serving target: {} hash rounds, {}ms extra latency, {:.0}% errors",
        config.iterations,
        config.latency_ms,
        config.error_rate * 100.0
    );

    let mut server = TargetServer::new(config);
    server.start().await.context("Failed to start target server")?;

    shutdown_signal().await;
    server.stop();
    tracing::info!("👋 Target shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
