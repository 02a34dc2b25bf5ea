use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rigger_apply::Reconciler;
use rigger_core::AppDef;
use rigger_kubehub::{MemoryResourceApi, ResourceRef};
use rigger_ops::{ApplyError, ComponentApplier, ManifestApplier, Orchestrator, RetryPolicy};

/// Fails `component` for its first `failures` invocations (u32::MAX = forever).
#[derive(Default)]
struct Flaky {
    failures: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
    order: Mutex<Vec<String>>,
}

impl Flaky {
    fn failing(mut self, component: &str, times: u32) -> Self {
        self.failures.insert(component.to_string(), times);
        self
    }
    fn calls(&self, component: &str) -> u32 {
        self.calls.lock().unwrap().get(component).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ComponentApplier for Flaky {
    async fn apply(&self, component: &str) -> Result<()> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(component.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.order.lock().unwrap().push(component.to_string());
        match self.failures.get(component) {
            Some(&f) if n <= f => Err(anyhow!("{} not ready", component)),
            _ => Ok(()),
        }
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn quick(max_retries: u32) -> Orchestrator {
    Orchestrator::new(RetryPolicy::new(max_retries, Duration::from_millis(1)))
}

#[tokio::test]
async fn converges_without_reapplying_confirmed_components() {
    let comps = names(&["istio", "dex", "jupyter", "katib"]);
    let applier = Flaky::default().failing("jupyter", 3);
    quick(6).apply_components(&comps, &applier).await.unwrap();

    assert_eq!(applier.calls("istio"), 1);
    assert_eq!(applier.calls("dex"), 1);
    assert_eq!(applier.calls("katib"), 1);
    assert_eq!(applier.calls("jupyter"), 4);
    // one failure does not abort the pass
    let order = applier.order.lock().unwrap().clone();
    assert_eq!(&order[..4], &["istio", "dex", "jupyter", "katib"]);
    assert!(order[4..].iter().all(|c| c == "jupyter"));
}

#[tokio::test]
async fn exhaustion_reports_outstanding_components() {
    let comps = names(&["a", "b", "c", "d"]);
    let applier = Flaky::default().failing("b", u32::MAX).failing("d", u32::MAX);
    let err = quick(2).apply_components(&comps, &applier).await.unwrap_err();

    let ApplyError::RetryExhausted { outstanding, passes, components } = err;
    assert_eq!(outstanding, 2);
    assert_eq!(passes, 3);
    assert_eq!(components, names(&["b", "d"]));
    assert_eq!(applier.calls("a"), 1);
    assert_eq!(applier.calls("c"), 1);
    assert_eq!(applier.calls("b"), 3);
    assert_eq!(applier.calls("d"), 3);
}

#[tokio::test]
async fn zero_retries_means_a_single_pass() {
    let comps = names(&["only"]);
    let applier = Flaky::default().failing("only", 1);
    assert!(quick(0).apply_components(&comps, &applier).await.is_err());
    assert_eq!(applier.calls("only"), 1);
}

#[tokio::test]
async fn empty_component_list_succeeds_immediately() {
    let applier = Flaky::default();
    quick(6).apply_components(&[], &applier).await.unwrap();
    assert!(applier.order.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delay_separates_passes() {
    let comps = names(&["slow"]);
    let applier = Flaky::default().failing("slow", 2);
    let orch = Orchestrator::new(RetryPolicy::new(3, Duration::from_millis(20)));
    let t0 = std::time::Instant::now();
    orch.apply_components(&comps, &applier).await.unwrap();
    assert!(t0.elapsed() >= Duration::from_millis(40));
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let dir = std::env::temp_dir().join(format!("rigger_{}_{}", tag, nanos));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn manifest_applier_uses_component_parameters() {
    let dir = temp_dir("manifests");
    std::fs::write(dir.join("web.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n").unwrap();
    std::fs::write(dir.join("db.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: db\n").unwrap();

    let mut def = AppDef::new("demo");
    def.metadata.namespace = Some("kf".into());
    def.spec.app_dir = dir.display().to_string();
    def.spec.components = names(&["web", "db"]);
    def.set_parameter("db", "namespace", "data");

    let mem = Arc::new(MemoryResourceApi::new());
    let applier = ManifestApplier::for_app(Reconciler::new(mem.clone()), def.clone());
    quick(0).apply_components(&def.spec.components, &applier).await.unwrap();

    let cm = |ns: &str, name: &str| ResourceRef { api_version: "v1".into(), kind: "ConfigMap".into(), namespace: Some(ns.into()), name: name.into() };
    assert!(mem.contains(&cm("kf", "web")));
    assert!(mem.contains(&cm("data", "db")));

    applier.remove("db").await.unwrap();
    applier.remove("web").await.unwrap();
    assert!(mem.is_empty());
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_manifest_is_retried_then_reported() {
    let dir = temp_dir("missing");
    let mut def = AppDef::new("demo");
    def.spec.app_dir = dir.display().to_string();
    let mem = Arc::new(MemoryResourceApi::new());
    let applier = ManifestApplier::for_app(Reconciler::new(mem), def);

    let err = quick(1).apply_components(&names(&["ghost"]), &applier).await.unwrap_err();
    assert!(err.to_string().contains("ghost"), "err={}", err);
    let _ = std::fs::remove_dir_all(&dir);
}
