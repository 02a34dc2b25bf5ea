//! Rigger core types: the application definition (`AppDef`) and its accessors.
//!
//! An `AppDef` is the declarative description of what gets deployed: named
//! components, their parameters, registries/packages, secrets and opaque
//! plugin payloads. It is plain data; nothing here talks to a cluster.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod plugin;

pub use plugin::{PluginSpec, PluginStore};

pub const DEFAULT_API_VERSION: &str = "rigger.dev/v1alpha1";
pub const DEFAULT_KIND: &str = "AppDef";
/// Namespace used when neither the definition nor a parameter names one.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("no secret named {0} in app definition")]
    SecretNotFound(String),
    #[error("no secret source provided for secret {0}")]
    NoSecretSource(String),
    #[error("missing plugin {0}")]
    PluginNotFound(String),
    #[error("could not serialize spec for plugin {name}: {reason}")]
    Serialization { name: String, reason: String },
    #[error("could not decode plugin {name} into the requested type: {reason}")]
    SpecDecode { name: String, reason: String },
    #[error("{path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SpecError {
    /// Missing secret or plugin. Callers usually treat these as a branch, not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpecError::SecretNotFound(_) | SpecError::PluginNotFound(_))
    }
}

fn default_api_version() -> String { DEFAULT_API_VERSION.to_string() }
fn default_kind() -> String { DEFAULT_KIND.to_string() }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDef {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AppDefSpec,
    #[serde(default)]
    pub status: AppDefStatus,
}

impl Default for AppDef {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::default(),
            spec: AppDefSpec::default(),
            status: AppDefStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefSpec {
    /// Local directory holding rendered component manifests (`<appDir>/<component>.yaml`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registries: Vec<RegistryConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Package>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<Repo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<Secret>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<Plugin>,
}

/// A component parameter; nested components are addressed as `a.b.c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Name/value pair handed to the reconciler as auxiliary parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reg_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: String,
    /// Name of the registry containing the package.
    #[serde(default)]
    pub registry: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,
}

/// Secrets can be given by reference (env) so they never land in source control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_source: Option<SecretSource>,
}

impl Secret {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret_source: Some(SecretSource { literal_source: Some(LiteralSource { value: value.into() }), env_source: None }),
        }
    }

    pub fn from_env(name: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret_source: Some(SecretSource { literal_source: None, env_source: Some(EnvSource { name: var.into() }) }),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.secret_source.as_ref().map(|s| s.literal_source.is_some()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal_source: Option<LiteralSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_source: Option<EnvSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralSource {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSource {
    /// Environment variable holding the value.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PluginSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Local cache location per repo name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repos_cache: BTreeMap<String, RepoCache>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCache {
    pub local_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

pub fn default_registry() -> RegistryConfig {
    RegistryConfig {
        name: "rigger".into(),
        repo: "https://github.com/rigger-dev/manifests.git".into(),
        path: "manifests".into(),
        ..Default::default()
    }
}

impl AppDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { metadata: ObjectMeta { name: name.into(), namespace: None }, ..Default::default() }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    /// Target namespace, falling back to `DEFAULT_NAMESPACE`.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, SpecError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SpecError::Io { path: path.display().to_string(), source })?;
        Self::from_yaml(&raw)
    }

    /// Resolve a secret: literal value first, then the named env var (unset reads as empty).
    pub fn get_secret(&self, name: &str) -> Result<String, SpecError> {
        let secret = self.spec.secrets.iter().find(|s| s.name == name).ok_or_else(|| SpecError::SecretNotFound(name.to_string()))?;
        let source = secret.secret_source.as_ref().ok_or_else(|| SpecError::NoSecretSource(name.to_string()))?;
        if let Some(lit) = &source.literal_source {
            return Ok(lit.value.clone());
        }
        if let Some(env) = &source.env_source {
            return Ok(std::env::var(&env.name).unwrap_or_default());
        }
        Err(SpecError::NoSecretSource(name.to_string()))
    }

    /// Overwrites an existing secret with the same name, otherwise appends.
    pub fn set_secret(&mut self, secret: Secret) {
        match self.spec.secrets.iter_mut().find(|s| s.name == secret.name) {
            Some(slot) => *slot = secret,
            None => self.spec.secrets.push(secret),
        }
    }

    pub fn set_parameter(&mut self, component: &str, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.spec.parameters.iter_mut().find(|p| p.component == component && p.name == name) {
            Some(p) => p.value = value,
            None => self.spec.parameters.push(Parameter { component: component.into(), name: name.into(), value }),
        }
    }

    /// Parameters for one component, in definition order.
    pub fn parameters_for(&self, component: &str) -> Vec<NameValue> {
        self.spec
            .parameters
            .iter()
            .filter(|p| p.component == component)
            .map(|p| NameValue::new(p.name.clone(), p.value.clone()))
            .collect()
    }

    pub fn remove_component(&mut self, name: &str) {
        self.spec.components.retain(|c| c != name);
    }

    pub fn remove_package(&mut self, name: &str) {
        self.spec.packages.retain(|p| p.name != name);
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition by type. Transition time moves only when the status flips.
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        let now = Utc::now();
        match self.status.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = Some(now);
                }
                c.status = status;
                c.reason = reason.to_string();
                c.message = message.to_string();
                c.last_update_time = Some(now);
            }
            None => self.status.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_update_time: Some(now),
                last_transition_time: Some(now),
            }),
        }
    }

    /// Copy of this definition with every literal-sourced secret removed.
    pub fn stripped(&self) -> AppDef {
        let mut out = self.clone();
        out.spec.secrets.retain(|s| {
            if s.is_literal() {
                warn!(secret = %s.name, "stripping literal secret before serializing");
                false
            } else {
                true
            }
        });
        out
    }

    /// Write the definition as YAML with literal secrets stripped.
    pub fn write_snapshot(&self, path: impl AsRef<Path>) -> Result<(), SpecError> {
        let path = path.as_ref();
        let buf = serde_yaml::to_string(&self.stripped())?;
        info!(path = %path.display(), "writing stripped app definition");
        std::fs::write(path, buf).map_err(|source| SpecError::Io { path: path.display().to_string(), source })
    }
}
