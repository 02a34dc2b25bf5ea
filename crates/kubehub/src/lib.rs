//! Rigger kubehub – the remote resource API the reconciler talks to.
//!
//! `ResourceApi` is the seam: get/create/delete addressed by
//! apiVersion/kind/namespace/name, plus namespace get/create. `KubeResourceApi`
//! backs it with kube-rs; `MemoryResourceApi` is an in-process stand-in.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

mod memory;

pub use memory::{CallCounts, MemoryResourceApi};

/// Address of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// Read apiVersion/kind/metadata.{name,namespace} off a raw object.
    pub fn from_object(obj: &Json) -> Result<Self> {
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing apiVersion"))?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing kind"))?;
        let meta = obj.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing metadata.name"))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        Ok(Self { api_version: api_version.to_string(), kind: kind.to_string(), namespace, name: name.to_string() })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        GroupVersionKind { group, version, kind: self.kind.clone() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Remote resource API. `get` returns `Ok(None)` for not-found; every other failure is an error.
#[async_trait::async_trait]
pub trait ResourceApi: Send + Sync {
    async fn get(&self, target: &ResourceRef) -> Result<Option<Json>>;
    async fn create(&self, obj: &Json) -> Result<()>;
    async fn delete(&self, target: &ResourceRef) -> Result<()>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Json>>;
    async fn create_namespace(&self, name: &str) -> Result<()>;
}

/// kube-rs backed implementation. Discovery runs once at connect and again on a miss,
/// so kinds registered by earlier documents (CRDs) resolve later in the same run.
pub struct KubeResourceApi {
    client: Client,
    resources: ArcSwap<Vec<(ApiResource, bool)>>,
}

impl KubeResourceApi {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let resources = discover(client.clone()).await?;
        info!(kinds = resources.len(), "discovery complete");
        Ok(Self { client, resources: ArcSwap::from_pointee(resources) })
    }

    fn lookup(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
        self.resources
            .load()
            .iter()
            .find(|(ar, _)| ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind)
            .cloned()
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        if let Some(found) = self.lookup(gvk) {
            return Ok(found);
        }
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "kind not cached; rerunning discovery");
        let fresh = discover(self.client.clone()).await?;
        self.resources.store(Arc::new(fresh));
        self.lookup(gvk).ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }

    async fn dynamic_api(&self, target: &ResourceRef) -> Result<(Api<DynamicObject>, bool)> {
        let (ar, namespaced) = self.resolve(&target.gvk()).await?;
        let api = if namespaced {
            match target.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(anyhow!("namespace required for namespaced kind {}", target.kind)),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, namespaced))
    }
}

async fn discover(client: Client) -> Result<Vec<(ApiResource, bool)>> {
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push((ar, matches!(caps.scope, Scope::Namespaced)));
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl ResourceApi for KubeResourceApi {
    async fn get(&self, target: &ResourceRef) -> Result<Option<Json>> {
        let (api, _) = self.dynamic_api(target).await?;
        let found = api.get_opt(&target.name).await.with_context(|| format!("getting {}", target))?;
        match found {
            Some(obj) => Ok(Some(serde_json::to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &Json) -> Result<()> {
        let target = ResourceRef::from_object(obj)?;
        let (api, namespaced) = self.dynamic_api(&target).await?;
        let mut dynamic: DynamicObject = serde_json::from_value(obj.clone()).with_context(|| format!("decoding {}", target))?;
        if !namespaced {
            dynamic.metadata.namespace = None;
        }
        api.create(&PostParams::default(), &dynamic).await.with_context(|| format!("creating {}", target))?;
        counter!("kube_create_total", 1u64);
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        let (api, _) = self.dynamic_api(target).await?;
        api.delete(&target.name, &DeleteParams::default()).await.with_context(|| format!("deleting {}", target))?;
        counter!("kube_delete_total", 1u64);
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Json>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(name).await.with_context(|| format!("getting namespace {}", name))? {
            Some(ns) => Ok(Some(serde_json::to_value(&ns)?)),
            None => Ok(None),
        }
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() };
        api.create(&PostParams::default(), &ns).await.with_context(|| format!("creating namespace {}", name))?;
        Ok(())
    }
}
