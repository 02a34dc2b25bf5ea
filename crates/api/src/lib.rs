//! Rigger deployment API (in-process).
//!
//! `Dispatcher` admits deployment requests into a single-slot queue, keeps the
//! latest accepted definition and rotates the access credential carried by
//! each request. A background worker (`spawn_worker`) drains the queue one
//! request at a time.
//!
//! The rotated credential is held for consumers that authenticate their own
//! outbound calls; they read it through `Dispatcher::credential()`. The kube
//! client behind `KubeDeployer` does not use it and authenticates from the
//! kubeconfig.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use rigger_core::AppDef;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

mod deploy;
mod token;
mod worker;

pub use deploy::KubeDeployer;
pub use token::{RefreshableToken, SharedToken};
pub use worker::{spawn_worker, DeploymentHandler, DeploymentOutcome, WorkerHandle, WorkerStatus};

/// Secret name reserved for the access token that rides along with a request.
pub const ACCESS_TOKEN_SECRET: &str = "access-token";

/// API errors suitable for transport.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RiggerError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("credential: {0}")]
    Credential(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type RiggerResult<T> = Result<T, RiggerError>;

/// Single-writer owner of the latest accepted definition and the credential.
///
/// Admission is all or nothing: a request either refreshes the credential,
/// replaces `latest` and lands on the queue, or leaves all three untouched.
pub struct Dispatcher {
    latest: ArcSwap<AppDef>,
    credential: Arc<dyn RefreshableToken>,
    tx: mpsc::Sender<AppDef>,
    admit: Mutex<()>,
}

impl Dispatcher {
    /// Returns the dispatcher and the receiving end of its capacity-1 queue.
    pub fn new(latest: AppDef, credential: Arc<dyn RefreshableToken>) -> (Self, mpsc::Receiver<AppDef>) {
        let (tx, rx) = mpsc::channel(1);
        let me = Self { latest: ArcSwap::from_pointee(latest), credential, tx, admit: Mutex::new(()) };
        (me, rx)
    }

    /// Accept a deployment request. Waits while a previous request is still queued.
    pub async fn create_deployment(&self, req: AppDef) -> RiggerResult<AppDef> {
        if req.name().is_empty() {
            return Err(RiggerError::Validation("deployment name is required".into()));
        }
        let _admission = self.admit.lock().await;
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| RiggerError::Unavailable("deployment worker has stopped".into()))?;

        match req.get_secret(ACCESS_TOKEN_SECRET) {
            Ok(token) => {
                if let Err(e) = self.credential.refresh(&token) {
                    counter!("dispatch_refresh_err", 1u64);
                    warn!(deployment = %req.name(), error = %e, "access token refresh failed");
                    return Err(RiggerError::Credential(format!("refreshing access token: {}", e)));
                }
                debug!(deployment = %req.name(), "access token refreshed");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                counter!("dispatch_refresh_err", 1u64);
                return Err(RiggerError::Credential(e.to_string()));
            }
        }

        self.latest.store(Arc::new(req.clone()));
        permit.send(req);
        counter!("dispatch_accepted_total", 1u64);
        let accepted = self.latest();
        info!(deployment = %accepted.name(), components = accepted.spec.components.len(), "deployment accepted");
        Ok(accepted)
    }

    /// Copy of the most recently accepted definition (may still be applying).
    pub fn latest(&self) -> AppDef {
        AppDef::clone(&self.latest.load())
    }

    /// Credential rotated by accepted requests, for callers that authenticate with it.
    pub fn credential(&self) -> &Arc<dyn RefreshableToken> { &self.credential }
}
