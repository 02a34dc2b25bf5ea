//! In-memory `ResourceApi` for tests and offline runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{ResourceApi, ResourceRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCounts {
    pub gets: usize,
    pub creates: usize,
    pub deletes: usize,
    pub namespace_gets: usize,
    pub namespace_creates: usize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, Json>,
    namespaces: BTreeSet<String>,
    calls: CallCounts,
    fail_create: BTreeSet<String>,
    fail_get: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    fail_namespace_create: bool,
}

/// Objects keyed by apiVersion/kind/namespace/name. Kinds can be told to fail
/// on get, create or delete to exercise error paths.
#[derive(Default)]
pub struct MemoryResourceApi {
    state: Mutex<State>,
}

impl MemoryResourceApi {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, obj: Json) -> Result<()> {
        let key = ResourceRef::from_object(&obj)?;
        self.state().objects.insert(key, obj);
        Ok(())
    }

    pub fn insert_namespace(&self, name: &str) {
        self.state().namespaces.insert(name.to_string());
    }

    pub fn contains(&self, target: &ResourceRef) -> bool { self.state().objects.contains_key(target) }
    pub fn has_namespace(&self, name: &str) -> bool { self.state().namespaces.contains(name) }
    pub fn len(&self) -> usize { self.state().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn calls(&self) -> CallCounts { self.state().calls }

    pub fn fail_creates_for(&self, kind: &str) { self.state().fail_create.insert(kind.to_string()); }
    pub fn fail_gets_for(&self, kind: &str) { self.state().fail_get.insert(kind.to_string()); }
    pub fn fail_deletes_for(&self, kind: &str) { self.state().fail_delete.insert(kind.to_string()); }
    pub fn fail_namespace_creates(&self, on: bool) { self.state().fail_namespace_create = on; }
}

#[async_trait::async_trait]
impl ResourceApi for MemoryResourceApi {
    async fn get(&self, target: &ResourceRef) -> Result<Option<Json>> {
        let mut st = self.state();
        st.calls.gets += 1;
        if st.fail_get.contains(&target.kind) {
            return Err(anyhow!("get {}: injected failure", target));
        }
        Ok(st.objects.get(target).cloned())
    }

    async fn create(&self, obj: &Json) -> Result<()> {
        let key = ResourceRef::from_object(obj)?;
        let mut st = self.state();
        st.calls.creates += 1;
        if st.fail_create.contains(&key.kind) {
            return Err(anyhow!("create {}: injected failure", key));
        }
        if st.objects.contains_key(&key) {
            return Err(anyhow!("create {}: already exists", key));
        }
        st.objects.insert(key, obj.clone());
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        let mut st = self.state();
        st.calls.deletes += 1;
        if st.fail_delete.contains(&target.kind) {
            return Err(anyhow!("delete {}: injected failure", target));
        }
        match st.objects.remove(target) {
            Some(_) => Ok(()),
            None => Err(anyhow!("delete {}: not found", target)),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Json>> {
        let mut st = self.state();
        st.calls.namespace_gets += 1;
        Ok(st.namespaces.contains(name).then(|| serde_json::json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name } })))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.calls.namespace_creates += 1;
        if st.fail_namespace_create {
            return Err(anyhow!("create namespace {}: injected failure", name));
        }
        st.namespaces.insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, ns: &str) -> Json {
        serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": ns } })
    }

    #[tokio::test]
    async fn create_get_delete_cycle() {
        let api = MemoryResourceApi::new();
        let obj = cm("a", "ns");
        let key = ResourceRef::from_object(&obj).unwrap();
        assert!(api.get(&key).await.unwrap().is_none());
        api.create(&obj).await.unwrap();
        assert!(api.create(&obj).await.is_err());
        assert_eq!(api.get(&key).await.unwrap(), Some(obj));
        api.delete(&key).await.unwrap();
        assert!(api.is_empty());
        assert!(api.delete(&key).await.is_err());
        let calls = api.calls();
        assert_eq!((calls.gets, calls.creates, calls.deletes), (2, 2, 2));
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let api = MemoryResourceApi::new();
        api.fail_creates_for("ConfigMap");
        assert!(api.create(&cm("a", "ns")).await.is_err());
        api.fail_namespace_creates(true);
        assert!(api.create_namespace("x").await.is_err());
        assert!(!api.has_namespace("x"));
    }
}
