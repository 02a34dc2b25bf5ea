//! Rigger apply: create-if-absent / delete-if-present reconciliation of
//! multi-document YAML against a `ResourceApi`.
//!
//! Existence checks are best effort: nothing guards against another actor
//! creating or deleting the same object between the `get` and the write.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use rigger_core::{NameValue, DEFAULT_NAMESPACE};
use rigger_kubehub::{ResourceApi, ResourceRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// A line holding exactly `---` plus optional trailing whitespace (anything but a
/// newline) separates documents.
pub const YAML_SEPARATOR: &str = r"(?m)^---[^\S\n]*$";

/// Auxiliary parameter naming the namespace for documents that omit one.
pub const NAMESPACE_PARAM: &str = "namespace";

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(YAML_SEPARATOR).expect("separator regex is valid"));

fn max_yaml_bytes() -> usize {
    std::env::var("RIGGER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("RIGGER_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// True when `v` holds more than `max` nodes. Exactly `max` is allowed.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Split a multi-document blob, dropping whitespace-only records.
pub fn split_documents(blob: &str) -> Vec<&str> {
    SEPARATOR.split(blob).filter(|s| !s.trim().is_empty()).collect()
}

/// One parsed resource document.
#[derive(Debug, Clone)]
pub struct ResourceDoc {
    pub target: ResourceRef,
    pub object: Json,
}

impl ResourceDoc {
    /// Parse one document. `Ok(None)` when the document holds no object (e.g. only comments).
    pub fn parse(doc: &str) -> Result<Option<Self>> {
        if doc.len() > max_yaml_bytes() {
            return Err(anyhow!("YAML document too large (>{} bytes)", max_yaml_bytes()));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(doc).context("parsing YAML")?;
        let object = serde_json::to_value(val).context("converting YAML to JSON")?;
        if object.is_null() {
            return Ok(None);
        }
        if json_node_budget_exceeded(&object, max_yaml_nodes()) {
            return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
        }
        let target = ResourceRef::from_object(&object)?;
        Ok(Some(Self { target, object }))
    }

    /// Explicit namespace wins, then the `namespace` parameter, then `DEFAULT_NAMESPACE`.
    /// The chosen value is written back into the object.
    pub fn resolve_namespace(&mut self, params: &[NameValue]) {
        if self.target.namespace.is_some() {
            return;
        }
        let ns = params
            .iter()
            .find(|nv| nv.name == NAMESPACE_PARAM)
            .map(|nv| nv.value.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if let Some(meta) = self.object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        }
        self.target.namespace = Some(ns);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub skipped: usize,
    pub deleted: usize,
}

/// Applies or deletes resource documents one at a time. The first failure aborts the call.
#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn ResourceApi>,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ResourceApi>) -> Self { Self { api } }

    pub fn api(&self) -> &Arc<dyn ResourceApi> { &self.api }

    pub async fn apply(&self, blob: &str, params: &[NameValue]) -> Result<ReconcileReport> {
        let t0 = std::time::Instant::now();
        let mut report = ReconcileReport::default();
        for doc in split_documents(blob) {
            let Some(mut res) = ResourceDoc::parse(doc)? else {
                debug!("skipping empty document");
                continue;
            };
            res.resolve_namespace(params);
            info!(resource = %res.target, "creating");
            match self.api.get(&res.target).await {
                Ok(Some(_)) => {
                    info!(resource = %res.target, "object already exists");
                    counter!("reconcile_skipped_total", 1u64);
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    counter!("reconcile_err", 1u64);
                    return Err(e);
                }
            }
            if let Err(e) = self.api.create(&res.object).await {
                counter!("reconcile_err", 1u64);
                return Err(e);
            }
            counter!("reconcile_created_total", 1u64);
            report.created += 1;
        }
        histogram!("reconcile_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Mirror of `apply`: absent objects are already deleted and are skipped.
    pub async fn delete(&self, blob: &str, params: &[NameValue]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for doc in split_documents(blob) {
            let Some(mut res) = ResourceDoc::parse(doc)? else { continue };
            res.resolve_namespace(params);
            info!(resource = %res.target, "deleting");
            match self.api.get(&res.target).await {
                Ok(None) => {
                    info!(resource = %res.target, "object already deleted");
                    report.skipped += 1;
                    continue;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    counter!("reconcile_err", 1u64);
                    return Err(e);
                }
            }
            if let Err(e) = self.api.delete(&res.target).await {
                counter!("reconcile_err", 1u64);
                return Err(e);
            }
            counter!("reconcile_deleted_total", 1u64);
            report.deleted += 1;
        }
        Ok(report)
    }

    pub async fn apply_file(&self, path: impl AsRef<Path>, params: &[NameValue]) -> Result<ReconcileReport> {
        let path = path.as_ref();
        let blob = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        self.apply(&blob, params).await.with_context(|| format!("applying {}", path.display()))
    }

    pub async fn delete_file(&self, path: impl AsRef<Path>, params: &[NameValue]) -> Result<ReconcileReport> {
        let path = path.as_ref();
        let blob = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        self.delete(&blob, params).await.with_context(|| format!("deleting {}", path.display()))
    }

    /// Make sure `name` exists. Returns `true` when it had to be created.
    pub async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        match self.api.get_namespace(name).await {
            Ok(Some(_)) => return Ok(false),
            Ok(None) => {}
            Err(e) => warn!(namespace = %name, error = %e, "namespace lookup failed; trying to create it"),
        }
        info!(namespace = %name, "creating namespace");
        self.api
            .create_namespace(name)
            .await
            .with_context(|| format!("couldn't create namespace {}", name))?;
        Ok(true)
    }

    pub async fn namespace_exists(&self, name: &str) -> bool {
        matches!(self.api.get_namespace(name).await, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_matches_bare_separator_lines_only() {
        let blob = "---\na: 1\n---   \nb: 2\n----\nstill: b\n--- # not a separator\n---\n\n   \n---\nc: 3\n";
        let docs = split_documents(blob);
        assert_eq!(docs.len(), 3, "docs={:?}", docs);
        assert!(docs[0].contains("a: 1"));
        assert!(docs[1].contains("b: 2") && docs[1].contains("----") && docs[1].contains("# not a separator"));
        assert!(docs[2].contains("c: 3"));
    }

    #[test]
    fn split_handles_crlf_and_no_separator() {
        assert_eq!(split_documents("a: 1\r\n---\r\nb: 2\r\n").len(), 2);
        assert_eq!(split_documents("a: 1\n").len(), 1);
        assert!(split_documents("\n---\n  \n---\n").is_empty());
    }

    #[test]
    fn split_accepts_any_trailing_whitespace_on_the_line() {
        let docs = split_documents("a: 1\n---\x0c\nb: 2\n---\x0b\t \nc: 3\n");
        assert_eq!(docs.len(), 3, "docs={:?}", docs);
        // the separator never swallows the next line
        assert_eq!(split_documents("a: 1\n---\n\nb: 2\n").len(), 2);
        assert!(split_documents("a: 1\n---\n\nb: 2\n")[1].contains("b: 2"));
    }

    #[test]
    fn parse_skips_comment_only_documents() {
        assert!(ResourceDoc::parse("# just a comment\n").unwrap().is_none());
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e = ResourceDoc::parse("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = ResourceDoc::parse("a: [unclosed\n").unwrap_err().to_string();
        assert!(e.contains("parsing YAML"), "e={}", e);
    }

    #[test]
    fn node_budget_counts_nested_values() {
        // root, a, 1, 2, 3, b, c
        let v = serde_json::json!({ "a": [1, 2, 3], "b": { "c": true } });
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(!json_node_budget_exceeded(&v, 7));
        assert!(json_node_budget_exceeded(&v, 6));
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(!json_node_budget_exceeded(&serde_json::json!(1), 1));
    }

    #[test]
    fn namespace_resolution_order() {
        let explicit = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: mine\n";
        let bare = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let params = vec![NameValue::new("replicas", "2"), NameValue::new(NAMESPACE_PARAM, "fromparam")];

        let mut d = ResourceDoc::parse(explicit).unwrap().unwrap();
        d.resolve_namespace(&params);
        assert_eq!(d.target.namespace.as_deref(), Some("mine"));

        let mut d = ResourceDoc::parse(bare).unwrap().unwrap();
        d.resolve_namespace(&params);
        assert_eq!(d.target.namespace.as_deref(), Some("fromparam"));
        assert_eq!(d.object["metadata"]["namespace"], "fromparam");

        let mut d = ResourceDoc::parse(bare).unwrap().unwrap();
        d.resolve_namespace(&[]);
        assert_eq!(d.target.namespace.as_deref(), Some(DEFAULT_NAMESPACE));
    }
}
