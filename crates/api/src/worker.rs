//! Background worker draining the deployment queue.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use metrics::histogram;
use rigger_core::AppDef;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Drives one accepted definition to completion.
#[async_trait::async_trait]
pub trait DeploymentHandler: Send + Sync {
    async fn handle(&self, def: AppDef) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub name: String,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub processed: u64,
    pub last: Option<DeploymentOutcome>,
}

pub struct WorkerHandle {
    status: watch::Receiver<WorkerStatus>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus { self.status.borrow().clone() }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> { self.status.clone() }

    /// Wait until at least `processed` requests have finished. `None` if the worker
    /// exited first.
    pub async fn wait_for(&mut self, processed: u64) -> Option<WorkerStatus> {
        loop {
            {
                let s = self.status.borrow_and_update();
                if s.processed >= processed {
                    return Some(s.clone());
                }
            }
            if self.status.changed().await.is_err() {
                let s = self.status.borrow();
                return (s.processed >= processed).then(|| s.clone());
            }
        }
    }

    /// Wait for the worker to exit (once every dispatcher sender is gone).
    pub async fn join(self) -> Result<()> {
        self.join.await.map_err(|e| anyhow!("deployment worker panicked: {}", e))
    }
}

/// Spawn the single worker. Requests are handled in arrival order, one at a time.
pub fn spawn_worker(mut rx: mpsc::Receiver<AppDef>, handler: Arc<dyn DeploymentHandler>) -> WorkerHandle {
    let (tx, status) = watch::channel(WorkerStatus::default());
    let join = tokio::spawn(async move {
        while let Some(def) = rx.recv().await {
            let name = def.name().to_string();
            let t0 = Instant::now();
            info!(deployment = %name, "deployment started");
            let res = handler.handle(def).await;
            let elapsed_ms = t0.elapsed().as_millis() as u64;
            histogram!("deploy_latency_ms", elapsed_ms as f64);
            let outcome = match res {
                Ok(()) => {
                    info!(deployment = %name, elapsed_ms, "deployment finished");
                    DeploymentOutcome { name, ok: true, error: None, elapsed_ms }
                }
                Err(e) => {
                    error!(deployment = %name, elapsed_ms, error = %format!("{:#}", e), "deployment failed");
                    DeploymentOutcome { name, ok: false, error: Some(format!("{:#}", e)), elapsed_ms }
                }
            };
            tx.send_modify(|s| {
                s.processed += 1;
                s.last = Some(outcome);
            });
        }
        debug!("deployment queue closed; worker exiting");
    });
    WorkerHandle { status, join }
}
