//! Secret storage drivers
//!
//! A driver persists raw secret bytes under an opaque ID. It knows nothing
//! about names; uniqueness of names is the manager's job. Every driver
//! validates the ID with [`validate_key`](crate::validate::validate_key)
//! before it becomes part of a path or a process environment.

mod file;
mod pass;
mod shell;

pub use file::FileDriver;
pub use pass::PassDriver;
pub use shell::{ShellDriver, SECRET_ID_ENV};

use anyhow::{bail, Result};
use keeper_core::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SecretsError;

/// Storage backend for secret bytes, keyed by ID
pub trait Driver {
    /// Which kind of driver this is
    fn driver_type(&self) -> DriverType;

    /// Store `data` under `id`. Fails with `AlreadyExists` rather than overwrite.
    fn store(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Fetch the bytes stored under `id`
    fn lookup(&self, id: &str) -> Result<Vec<u8>>;

    /// Remove the bytes stored under `id`
    fn delete(&self, id: &str) -> Result<()>;

    /// All IDs the backend currently holds
    fn list(&self) -> Result<Vec<String>>;
}

/// Available drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    /// One file per ID on local disk
    File,
    /// gpg-encrypted password-store entries
    Pass,
    /// User-supplied shell commands
    Shell,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::File => "file",
            DriverType::Pass => "pass",
            DriverType::Shell => "shell",
        }
    }

    pub fn all() -> &'static [DriverType] {
        &[DriverType::File, DriverType::Pass, DriverType::Shell]
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(DriverType::File),
            "pass" => Ok(DriverType::Pass),
            "shell" => Ok(DriverType::Shell),
            other => bail!(SecretsError::UnknownDriver(other.to_string())),
        }
    }
}

/// Process-level knobs shared by all drivers
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Upper bound for each driver subprocess
    pub timeout: Duration,
    /// Binary run by the pass driver
    pub gpg_binary: String,
    /// Shell running shell driver templates
    pub shell: String,
    /// Largest secret a driver command may return
    pub max_output: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.driver_timeout(),
            gpg_binary: config.gpg_binary.clone(),
            shell: config.shell.clone(),
            max_output: config.max_secret_size,
        }
    }
}

/// Construct the driver of the given type from its options
pub fn open_driver(
    driver: DriverType,
    options: &BTreeMap<String, String>,
    settings: &DriverSettings,
) -> Result<Box<dyn Driver>> {
    Ok(match driver {
        DriverType::File => Box::new(FileDriver::from_options(options)?),
        DriverType::Pass => Box::new(PassDriver::from_options(options, settings)?),
        DriverType::Shell => Box::new(ShellDriver::from_options(options, settings)?),
    })
}

/// Fetch a required option
fn required_option<'a>(
    options: &'a BTreeMap<String, String>,
    driver: DriverType,
    option: &'static str,
) -> Result<&'a str> {
    match options.get(option).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!(SecretsError::MissingDriverOption {
            driver: driver.as_str(),
            option,
        }),
    }
}

/// Fetch an optional option, treating blank values as absent
fn optional_option<'a>(options: &'a BTreeMap<String, String>, option: &str) -> Option<&'a str> {
    options
        .get(option)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Give a non-categorical driver failure its operation and ID context.
///
/// Categorical errors (`NotFound`, `AlreadyExists`, `InvalidKey`, an already
/// wrapped `Driver`) pass through untouched.
pub(crate) fn driver_failure(
    driver: DriverType,
    op: &'static str,
    id: &str,
    err: anyhow::Error,
) -> anyhow::Error {
    if err.downcast_ref::<SecretsError>().is_some() {
        return err;
    }
    SecretsError::Driver {
        driver: driver.as_str(),
        op,
        id: id.to_string(),
        reason: format!("{:#}", err),
    }
    .into()
}

/// Error for a subprocess that exited unsuccessfully
fn command_failed(
    driver: DriverType,
    op: &'static str,
    id: &str,
    output: &keeper_core::ProcessOutput,
) -> SecretsError {
    let stderr = output.stderr_text();
    let reason = if stderr.is_empty() {
        output.exit_description()
    } else {
        format!("{}: {}", output.exit_description(), stderr)
    };
    SecretsError::Driver {
        driver: driver.as_str(),
        op,
        id: id.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_type_round_trip_names() {
        for driver in DriverType::all() {
            assert_eq!(driver.as_str().parse::<DriverType>().unwrap(), *driver);
        }
    }

    #[test]
    fn test_unknown_driver() {
        let err = "vault".parse::<DriverType>().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SecretsError>(),
            Some(SecretsError::UnknownDriver(name)) if name == "vault"
        ));
        assert!("File".parse::<DriverType>().is_err());
    }

    #[test]
    fn test_open_driver_checks_options() {
        let settings = DriverSettings::default();
        let err = open_driver(DriverType::Shell, &BTreeMap::new(), &settings)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<SecretsError>(),
            Some(SecretsError::MissingDriverOption { driver: "shell", .. })
        ));

        let err = open_driver(DriverType::File, &BTreeMap::new(), &settings)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<SecretsError>(),
            Some(SecretsError::MissingDriverOption { option: "path", .. })
        ));
    }

    #[test]
    fn test_driver_failure_keeps_categorical_errors() {
        let err = driver_failure(
            DriverType::File,
            "lookup",
            "abc",
            SecretsError::NotFound("abc".to_string()).into(),
        );
        assert!(matches!(
            err.downcast_ref::<SecretsError>(),
            Some(SecretsError::NotFound(_))
        ));

        let err = driver_failure(DriverType::File, "lookup", "abc", anyhow::anyhow!("disk on fire"));
        match err.downcast_ref::<SecretsError>() {
            Some(SecretsError::Driver { driver, op, id, reason }) => {
                assert_eq!(*driver, "file");
                assert_eq!(*op, "lookup");
                assert_eq!(id, "abc");
                assert!(reason.contains("disk on fire"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
