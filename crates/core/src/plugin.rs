//! Opaque, name-keyed plugin payloads.
//!
//! Platform code stores arbitrary configuration here without core knowing its
//! shape. The payload is kept only as serialized JSON text; reading it back
//! means decoding that text into a type the caller picks, so numbers come back
//! exactly as they were written.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use tracing::{error, info};

use crate::{AppDef, AppDefSpec, Plugin, SpecError};

/// Serialized plugin payload. Never holds a live typed value.
///
/// Persists as a JSON string. A structured value written by hand in the
/// definition file is accepted too and re-serialized on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PluginSpec(String);

impl PluginSpec {
    /// Serialize `value` to bytes, then keep the bytes as the opaque text.
    pub fn encode<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<Self, SpecError> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            error!(plugin = %name, error = %e, "could not marshal plugin spec");
            SpecError::Serialization { name: name.to_string(), reason: e.to_string() }
        })?;
        let raw = String::from_utf8(bytes).map_err(|e| {
            error!(plugin = %name, error = %e, "could not convert plugin spec to opaque form");
            SpecError::Serialization { name: name.to_string(), reason: e.to_string() }
        })?;
        Ok(Self(raw))
    }

    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<T, SpecError> {
        serde_json::from_str(&self.0).map_err(|e| {
            error!(plugin = %name, error = %e, "could not decode plugin spec to the requested type");
            SpecError::SpecDecode { name: name.to_string(), reason: e.to_string() }
        })
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl<'de> Deserialize<'de> for PluginSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Raw(String),
            Tree(Json),
        }
        match Wire::deserialize(deserializer)? {
            Wire::Raw(raw) => Ok(Self(raw)),
            Wire::Tree(tree) => serde_json::to_string(&tree).map(Self).map_err(serde::de::Error::custom),
        }
    }
}

/// Typed get/set of plugin payloads keyed by plugin name.
pub trait PluginStore {
    fn get_plugin_spec<T: DeserializeOwned>(&self, name: &str) -> Result<T, SpecError>;
    fn set_plugin_spec<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), SpecError>;
}

impl PluginStore for AppDefSpec {
    fn get_plugin_spec<T: DeserializeOwned>(&self, name: &str) -> Result<T, SpecError> {
        let plugin = self.plugins.iter().find(|p| p.name == name).ok_or_else(|| SpecError::PluginNotFound(name.to_string()))?;
        match &plugin.spec {
            Some(spec) => spec.decode(name),
            // A plugin entry with no payload decodes like an explicit null.
            None => T::deserialize(&Json::Null).map_err(|e| SpecError::SpecDecode { name: name.to_string(), reason: e.to_string() }),
        }
    }

    fn set_plugin_spec<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), SpecError> {
        let spec = PluginSpec::encode(name, value)?;
        match self.plugins.iter_mut().find(|p| p.name == name) {
            Some(p) => p.spec = Some(spec),
            None => {
                info!(plugin = %name, "adding plugin");
                self.plugins.push(Plugin { name: name.to_string(), spec: Some(spec) });
            }
        }
        Ok(())
    }
}

impl PluginStore for AppDef {
    fn get_plugin_spec<T: DeserializeOwned>(&self, name: &str) -> Result<T, SpecError> {
        self.spec.get_plugin_spec(name)
    }

    fn set_plugin_spec<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), SpecError> {
        self.spec.set_plugin_spec(name, value)
    }
}
