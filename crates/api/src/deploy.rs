//! Deployment handler backed by the reconciler.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rigger_apply::{ReconcileReport, Reconciler};
use rigger_core::AppDef;
use rigger_ops::{ManifestApplier, Orchestrator, RetryPolicy};
use tracing::info;

use crate::worker::DeploymentHandler;

/// Ensures the target namespace, then applies every component with batch retries.
pub struct KubeDeployer {
    reconciler: Reconciler,
    policy: RetryPolicy,
    manifest_dir: Option<PathBuf>,
}

impl KubeDeployer {
    pub fn new(reconciler: Reconciler, policy: RetryPolicy) -> Self {
        Self { reconciler, policy, manifest_dir: None }
    }

    /// Read manifests from `dir` instead of the definition's `appDir`.
    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = Some(dir.into());
        self
    }

    fn applier(&self, def: &AppDef) -> ManifestApplier {
        match &self.manifest_dir {
            Some(dir) => ManifestApplier::new(self.reconciler.clone(), dir.clone(), def.clone()),
            None => ManifestApplier::for_app(self.reconciler.clone(), def.clone()),
        }
    }

    pub async fn deploy(&self, def: &AppDef) -> Result<()> {
        let ns = def.namespace();
        self.reconciler.ensure_namespace(ns).await?;
        let applier = self.applier(def);
        Orchestrator::new(self.policy)
            .apply_components(&def.spec.components, &applier)
            .await
            .with_context(|| format!("deploying {}", def.name()))?;
        info!(deployment = %def.name(), namespace = %ns, components = def.spec.components.len(), "all components applied");
        Ok(())
    }

    /// Delete every component's resources, last component first. Stops at the first failure.
    pub async fn teardown(&self, def: &AppDef) -> Result<ReconcileReport> {
        let applier = self.applier(def);
        let mut total = ReconcileReport::default();
        for c in def.spec.components.iter().rev() {
            let r = applier.remove(c).await.with_context(|| format!("removing component {}", c))?;
            info!(component = %c, deleted = r.deleted, skipped = r.skipped, "component removed");
            total.deleted += r.deleted;
            total.skipped += r.skipped;
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl DeploymentHandler for KubeDeployer {
    async fn handle(&self, def: AppDef) -> Result<()> {
        self.deploy(&def).await
    }
}
