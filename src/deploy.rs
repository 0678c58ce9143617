//! Seam for remote execution of the load generator.
//!
//! Provisioning is owned by whoever implements [`DeploymentController`];
//! this module only knows how to drive one: bring the deployment up, relay
//! its logs into the result parser, and step up the replica count.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::parser::{LogParser, ParserWriter};

/// What to run remotely
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub namespace: String,
    /// Where replicas download the binary from
    pub binary_url: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
}

#[async_trait]
pub trait DeploymentController: Send + Sync {
    async fn deploy(&self, spec: &DeploymentSpec) -> Result<()>;

    async fn scale(&self, spec: &DeploymentSpec, replicas: u32) -> Result<()>;

    async fn teardown(&self) -> Result<()>;

    /// Stream the deployment's log output into `sink`
    async fn stream_logs(&self, sink: Box<dyn Write + Send>) -> Result<()>;
}

/// Deploy `spec` and point its logs at `parser`
///
/// Deployment failure is fatal. A failed log relay only means results from
/// the remote replicas will not be mined; the deployment keeps running.
pub async fn bootstrap(
    controller: &dyn DeploymentController,
    spec: &DeploymentSpec,
    parser: Arc<dyn LogParser>,
) -> Result<()> {
    tracing::info!(name = %spec.name, namespace = %spec.namespace, "Creating deployment");
    controller.deploy(spec).await?;

    if let Err(e) = controller
        .stream_logs(Box::new(ParserWriter::new(parser)))
        .await
    {
        tracing::warn!("Log relay unavailable, local result mining disabled: {}", e);
    }
    Ok(())
}

/// Step the replica count from 2 up to `target_replicas`, one step per `step`
///
/// Scaling errors are logged and skipped. Returns the last replica count
/// that scaled successfully (1 if none did).
pub async fn run_scaling_loop(
    controller: Arc<dyn DeploymentController>,
    spec: DeploymentSpec,
    target_replicas: u32,
    step: Duration,
    parser: Arc<dyn LogParser>,
    mut shutdown: watch::Receiver<bool>,
) -> u32 {
    tracing::info!("Started scaling loop from 1 to {}", target_replicas);
    let mut current = 1;

    for replicas in 2..=target_replicas {
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        tracing::info!("Scaling to {} replicas", replicas);
        match controller.scale(&spec, replicas).await {
            Ok(()) => current = replicas,
            Err(e) => {
                tracing::warn!("Failed to scale to {} replicas: {}", replicas, e);
                continue;
            }
        }

        // New replicas need their logs relayed too
        if let Err(e) = controller
            .stream_logs(Box::new(ParserWriter::new(Arc::clone(&parser))))
            .await
        {
            tracing::warn!("Failed to refresh log relay: {}", e);
        }
    }

    current
}
