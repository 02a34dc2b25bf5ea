use std::sync::Arc;

use rigger_apply::{Reconciler, ReconcileReport};
use rigger_core::NameValue;
use rigger_kubehub::{MemoryResourceApi, ResourceRef};

const TWO_DOCS: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: apps
data:
  mode: fast
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
";

fn rref(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> ResourceRef {
    ResourceRef { api_version: api_version.into(), kind: kind.into(), namespace: ns.map(str::to_string), name: name.into() }
}

fn setup() -> (Arc<MemoryResourceApi>, Reconciler) {
    let mem = Arc::new(MemoryResourceApi::new());
    let rec = Reconciler::new(mem.clone());
    (mem, rec)
}

#[tokio::test]
async fn apply_is_idempotent() {
    let (mem, rec) = setup();
    let first = rec.apply(TWO_DOCS, &[]).await.unwrap();
    assert_eq!(first, ReconcileReport { created: 2, skipped: 0, deleted: 0 });
    assert!(mem.contains(&rref("v1", "ConfigMap", Some("apps"), "settings")));
    assert!(mem.contains(&rref("apps/v1", "Deployment", Some("default"), "web")));

    let creates_before = mem.calls().creates;
    let second = rec.apply(TWO_DOCS, &[]).await.unwrap();
    assert_eq!(second, ReconcileReport { created: 0, skipped: 2, deleted: 0 });
    assert_eq!(mem.calls().creates, creates_before);
    assert_eq!(mem.len(), 2);
}

#[tokio::test]
async fn delete_of_absent_resources_is_a_no_op() {
    let (mem, rec) = setup();
    let report = rec.delete(TWO_DOCS, &[]).await.unwrap();
    assert_eq!(report, ReconcileReport { created: 0, skipped: 2, deleted: 0 });
    assert_eq!(mem.calls().deletes, 0);
}

#[tokio::test]
async fn delete_removes_what_apply_created() {
    let (mem, rec) = setup();
    let params = vec![NameValue::new("namespace", "team")];
    rec.apply(TWO_DOCS, &params).await.unwrap();
    assert!(mem.contains(&rref("apps/v1", "Deployment", Some("team"), "web")));

    let report = rec.delete(TWO_DOCS, &params).await.unwrap();
    assert_eq!(report.deleted, 2);
    assert!(mem.is_empty());
}

const THREE_DOCS: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: runner
";

#[tokio::test]
async fn delete_get_failure_aborts_remaining_documents() {
    let (mem, rec) = setup();
    rec.apply(THREE_DOCS, &[]).await.unwrap();
    mem.fail_gets_for("Deployment");

    let err = rec.delete(THREE_DOCS, &[]).await.unwrap_err();
    assert!(err.to_string().contains("injected failure"), "err={}", err);
    assert!(!mem.contains(&rref("v1", "ConfigMap", Some("default"), "settings")));
    assert!(mem.contains(&rref("apps/v1", "Deployment", Some("default"), "web")));
    assert!(mem.contains(&rref("v1", "ServiceAccount", Some("default"), "runner")));
    assert_eq!(mem.calls().deletes, 1);
}

#[tokio::test]
async fn delete_call_failure_is_surfaced() {
    let (mem, rec) = setup();
    rec.apply(THREE_DOCS, &[]).await.unwrap();
    mem.fail_deletes_for("ConfigMap");

    let err = rec.delete(THREE_DOCS, &[]).await.unwrap_err();
    assert!(err.to_string().contains("delete"), "err={}", err);
    assert_eq!(mem.len(), 3);
    assert_eq!(mem.calls().deletes, 1);
}

#[tokio::test]
async fn create_failure_aborts_remaining_documents() {
    let (mem, rec) = setup();
    mem.fail_creates_for("ConfigMap");
    let err = rec.apply(TWO_DOCS, &[]).await.unwrap_err();
    assert!(err.to_string().contains("injected failure"), "err={}", err);
    assert!(mem.is_empty());
    assert_eq!(mem.calls().creates, 1);
}

#[tokio::test]
async fn get_failure_is_not_treated_as_absent() {
    let (mem, rec) = setup();
    mem.fail_gets_for("Deployment");
    assert!(rec.apply(TWO_DOCS, &[]).await.is_err());
    // the first document went through before the failing one
    assert_eq!(mem.len(), 1);
    assert_eq!(mem.calls().creates, 1);
}

#[tokio::test]
async fn malformed_document_stops_processing() {
    let (mem, rec) = setup();
    let blob = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\nkind: Broken\nmetadata:\n  name: x\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: never\n";
    let err = rec.apply(blob, &[]).await.unwrap_err();
    assert!(err.to_string().contains("missing apiVersion"), "err={}", err);
    assert_eq!(mem.len(), 1);
    assert!(!mem.contains(&rref("v1", "ConfigMap", Some("default"), "never")));
}

#[tokio::test]
async fn apply_file_reads_from_disk() {
    let (mem, rec) = setup();
    let mut path = std::env::temp_dir();
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    path.push(format!("rigger_reconcile_{}.yaml", nanos));
    std::fs::write(&path, TWO_DOCS).unwrap();

    let report = rec.apply_file(&path, &[]).await.unwrap();
    assert_eq!(report.created, 2);
    let report = rec.delete_file(&path, &[]).await.unwrap();
    assert_eq!(report.deleted, 2);
    assert!(mem.is_empty());
    let _ = std::fs::remove_file(&path);

    let err = rec.apply_file(&path, &[]).await.unwrap_err();
    assert!(err.to_string().contains("reading"), "err={}", err);
}

#[tokio::test]
async fn ensure_namespace_creates_once() {
    let (mem, rec) = setup();
    assert!(!rec.namespace_exists("kf").await);
    assert!(rec.ensure_namespace("kf").await.unwrap());
    assert!(rec.namespace_exists("kf").await);
    assert!(!rec.ensure_namespace("kf").await.unwrap());
    assert_eq!(mem.calls().namespace_creates, 1);
}

#[tokio::test]
async fn ensure_namespace_surfaces_create_failure() {
    let (mem, rec) = setup();
    mem.fail_namespace_creates(true);
    let err = rec.ensure_namespace("kf").await.unwrap_err();
    assert!(err.to_string().contains("couldn't create namespace kf"), "err={}", err);
}
