//! Secret metadata records and store options

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::driver::DriverType;

/// Metadata describing one secret. The bytes live in the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Random, immutable identifier
    pub id: String,
    /// Human-chosen unique name
    pub name: String,
    /// Driver owning the secret bytes
    pub driver: DriverType,
    /// Driver configuration (not secret data)
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
    /// Free-form metadata, opaque to the manager
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Free-form labels for filtering
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options controlling how a secret is stored
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub driver_options: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Replace an existing secret with the same name
    pub replace: bool,
    /// Return the existing secret's ID instead of failing when the name is taken
    pub ignore_if_exists: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set replace mode
    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    /// Set ignore-if-exists mode
    pub fn ignore_if_exists(mut self) -> Self {
        self.ignore_if_exists = true;
        self
    }

    /// Add a driver option
    pub fn with_driver_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_options.insert(key.into(), value.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A listing filter: `name=PREFIX`, `id=PREFIX` or `label=KEY[=VALUE]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretFilter {
    Name(String),
    Id(String),
    Label { key: String, value: Option<String> },
}

impl SecretFilter {
    /// Whether the secret satisfies this filter
    pub fn matches(&self, secret: &Secret) -> bool {
        match self {
            SecretFilter::Name(prefix) => secret.name.starts_with(prefix.as_str()),
            SecretFilter::Id(prefix) => secret.id.starts_with(prefix.as_str()),
            SecretFilter::Label { key, value } => match (secret.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            },
        }
    }
}

impl FromStr for SecretFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((kind, rest)) = s.split_once('=') else {
            bail!("Invalid filter {:?}: expected KIND=VALUE", s);
        };

        match kind {
            "name" => Ok(SecretFilter::Name(rest.to_string())),
            "id" => Ok(SecretFilter::Id(rest.to_string())),
            "label" => {
                let (key, value) = match rest.split_once('=') {
                    Some((k, v)) => (k, Some(v.to_string())),
                    None => (rest, None),
                };
                if key.is_empty() {
                    bail!("Invalid filter {:?}: label key cannot be empty", s);
                }
                Ok(SecretFilter::Label {
                    key: key.to_string(),
                    value,
                })
            }
            other => bail!("Unknown filter {:?} (expected name, id or label)", other),
        }
    }
}
