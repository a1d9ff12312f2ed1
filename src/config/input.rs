//! Provider block input
//!
//! The only string-keyed form of the configuration. A declarative provider
//! block arrives as JSON, YAML or an in-memory map and is parsed once into a
//! [`ProviderBlock`]; everything downstream works on typed fields.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Suffix shared by every per-service override key.
pub const CUSTOM_ENDPOINT_SUFFIX: &str = "_custom_endpoint";

/// A boolean that may also arrive as a string (`"true"`, `"1"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BoolLike {
    Bool(bool),
    Text(String),
}

impl BoolLike {
    /// String form fed to the resolver. An empty string means "not set".
    pub fn as_config_str(&self) -> Option<String> {
        match self {
            BoolLike::Bool(b) => Some(b.to_string()),
            BoolLike::Text(s) if s.is_empty() => None,
            BoolLike::Text(s) => Some(s.clone()),
        }
    }
}

impl From<bool> for BoolLike {
    fn from(value: bool) -> Self {
        BoolLike::Bool(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BatchingBlock {
    #[serde(default)]
    pub send_after: Option<String>,
    #[serde(default)]
    pub enable_batching: Option<bool>,
}

/// Raw provider configuration as written by the user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderBlock {
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub impersonate_service_account: Option<String>,
    #[serde(default)]
    pub impersonate_service_account_delegates: Option<Vec<String>>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub billing_project: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub universe_domain: Option<String>,
    #[serde(default)]
    pub batching: Option<BatchingBlock>,
    #[serde(default)]
    pub user_project_override: Option<BoolLike>,
    #[serde(default)]
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub request_reason: Option<String>,
    #[serde(default)]
    pub default_labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub add_terraform_attribution_label: Option<bool>,
    #[serde(default)]
    pub terraform_attribution_label_addition_strategy: Option<String>,

    /// Every key not listed above. Only `<service>_custom_endpoint` keys are
    /// accepted; see [`ProviderBlock::custom_endpoints`].
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProviderBlock {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| Error::validation("provider", e.to_string()))
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).map_err(|e| Error::validation("provider", e.to_string()))
    }

    pub fn from_map(map: serde_json::Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::validation("provider", e.to_string()))
    }

    /// Load from a file, choosing the format by extension (`.json` or YAML).
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation("provider", format!("cannot read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Per-service override values keyed by the full field name.
    ///
    /// Fails on any unrecognized key or a non-string override.
    pub fn custom_endpoints(&self) -> Result<BTreeMap<String, String>> {
        let mut overrides = BTreeMap::new();
        for (key, value) in &self.extra {
            if !key.ends_with(CUSTOM_ENDPOINT_SUFFIX) {
                return Err(Error::validation(key.as_str(), "unknown configuration key"));
            }
            match value {
                Value::Null => {}
                Value::String(s) if s.is_empty() => {}
                Value::String(s) => {
                    overrides.insert(key.clone(), s.clone());
                }
                _ => return Err(Error::validation(key.as_str(), "expected a string")),
            }
        }
        Ok(overrides)
    }

    pub fn set_custom_endpoint(&mut self, field: &str, url: &str) {
        self.extra
            .insert(field.to_string(), Value::String(url.to_string()));
    }
}
