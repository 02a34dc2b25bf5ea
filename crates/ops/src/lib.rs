//! Rigger Ops: apply a named list of components with batch-level retries.
//!
//! Every pass walks the full list in order and skips components already
//! confirmed, so a flaky component never causes a successful one to be
//! applied twice. Passes are separated by a constant delay.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use rigger_apply::{ReconcileReport, Reconciler, NAMESPACE_PARAM};
use rigger_core::{AppDef, NameValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Retry budget: one initial pass plus `max_retries` further passes, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 6, delay: Duration::from_secs(5) } }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self { Self { max_retries, delay } }

    /// Read `RIGGER_APPLY_RETRIES` / `RIGGER_APPLY_DELAY_SECS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_retries = std::env::var("RIGGER_APPLY_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(d.max_retries);
        let delay = std::env::var("RIGGER_APPLY_DELAY_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.delay);
        Self { max_retries, delay }
    }

    pub fn passes(&self) -> u32 { self.max_retries.saturating_add(1) }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{outstanding} component(s) still not applied after {passes} attempt(s): {}", .components.join(", "))]
    RetryExhausted { outstanding: usize, passes: u32, components: Vec<String> },
}

/// Applies a single component. Implementations carry their own connection configuration.
#[async_trait::async_trait]
pub trait ComponentApplier: Send + Sync {
    async fn apply(&self, component: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(policy: RetryPolicy) -> Self { Self { policy } }

    pub fn policy(&self) -> RetryPolicy { self.policy }

    pub async fn apply_components(&self, components: &[String], applier: &dyn ComponentApplier) -> Result<(), ApplyError> {
        let passes = self.policy.passes();
        let mut done: HashSet<&str> = HashSet::with_capacity(components.len());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            for c in components {
                if done.contains(c.as_str()) {
                    continue;
                }
                counter!("component_apply_attempts", 1u64);
                match applier.apply(c).await {
                    Ok(()) => {
                        info!(component = %c, attempt, "component applied");
                        counter!("component_apply_ok", 1u64);
                        done.insert(c.as_str());
                    }
                    Err(e) => {
                        warn!(component = %c, attempt, error = %e, "component apply failed");
                        counter!("component_apply_err", 1u64);
                    }
                }
            }
            let outstanding: Vec<String> = components.iter().filter(|c| !done.contains(c.as_str())).cloned().collect();
            if outstanding.is_empty() {
                debug!(attempt, total = components.len(), "all components applied");
                return Ok(());
            }
            if attempt >= passes {
                return Err(ApplyError::RetryExhausted { outstanding: outstanding.len(), passes, components: outstanding });
            }
            info!(outstanding = outstanding.len(), delay_ms = self.policy.delay.as_millis() as u64, "retrying outstanding components");
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

/// Applies component `c` by reconciling `<dir>/<c>.yaml` with that component's parameters.
/// A component without a `namespace` parameter lands in the definition's namespace.
pub struct ManifestApplier {
    reconciler: Reconciler,
    dir: PathBuf,
    def: AppDef,
}

impl ManifestApplier {
    pub fn new(reconciler: Reconciler, dir: impl Into<PathBuf>, def: AppDef) -> Self {
        Self { reconciler, dir: dir.into(), def }
    }

    /// Manifests are read from the definition's `appDir`.
    pub fn for_app(reconciler: Reconciler, def: AppDef) -> Self {
        let dir = PathBuf::from(&def.spec.app_dir);
        Self::new(reconciler, dir, def)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn manifest_path(&self, component: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", component))
    }

    fn params(&self, component: &str) -> Vec<NameValue> {
        let mut params = self.def.parameters_for(component);
        if !params.iter().any(|p| p.name == NAMESPACE_PARAM) {
            params.push(NameValue::new(NAMESPACE_PARAM, self.def.namespace()));
        }
        params
    }

    /// Delete everything the component's manifest describes.
    pub async fn remove(&self, component: &str) -> Result<ReconcileReport> {
        self.reconciler.delete_file(self.manifest_path(component), &self.params(component)).await
    }
}

#[async_trait::async_trait]
impl ComponentApplier for ManifestApplier {
    async fn apply(&self, component: &str) -> Result<()> {
        let report = self.reconciler.apply_file(self.manifest_path(component), &self.params(component)).await?;
        debug!(component = %component, created = report.created, skipped = report.skipped, "manifest reconciled");
        Ok(())
    }
}
