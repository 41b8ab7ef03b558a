//! Shell driver - four user-supplied commands
//!
//! Options `store`, `lookup`, `list` and `delete` each hold a command line run
//! with the configured shell. The ID never becomes part of the command text;
//! it is exported as `$SECRET_ID`. Secret bytes go to the store command's
//! stdin and come back on the lookup command's stdout. The list command
//! prints one ID per line.
//!
//! The list command decides existence: storing an ID it already reports is
//! `AlreadyExists`, and a failed lookup or delete of an ID it does not report
//! is `NotFound`. Any other non-zero exit is a driver error.

use anyhow::{bail, Result};
use keeper_core::{Invocation, ProcessOutput};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{command_failed, required_option, Driver, DriverSettings, DriverType};
use crate::error::SecretsError;
use crate::validate::validate_key;

/// Environment variable carrying the secret ID
pub const SECRET_ID_ENV: &str = "SECRET_ID";

pub struct ShellDriver {
    store_cmd: String,
    lookup_cmd: String,
    list_cmd: String,
    delete_cmd: String,
    shell: String,
    timeout: Duration,
    max_output: usize,
}

impl ShellDriver {
    pub fn from_options(options: &BTreeMap<String, String>, settings: &DriverSettings) -> Result<Self> {
        Ok(Self {
            store_cmd: required_option(options, DriverType::Shell, "store")?.to_string(),
            lookup_cmd: required_option(options, DriverType::Shell, "lookup")?.to_string(),
            list_cmd: required_option(options, DriverType::Shell, "list")?.to_string(),
            delete_cmd: required_option(options, DriverType::Shell, "delete")?.to_string(),
            shell: settings.shell.clone(),
            timeout: settings.timeout,
            max_output: settings.max_output,
        })
    }

    fn invocation(&self, command: &str) -> Invocation {
        Invocation::new(self.shell.as_str())
            .arg("-c")
            .arg(command)
            .timeout(self.timeout)
    }

    /// Run a per-ID command; its stdout is bounded by the secret size limit
    fn run(&self, command: &str, id: &str, input: Option<&[u8]>) -> Result<ProcessOutput> {
        self.invocation(command)
            .env(SECRET_ID_ENV, id)
            .output_limit(self.max_output)
            .run(input)
    }

    /// IDs reported by the list command, in the order it prints them
    fn listed(&self) -> Result<Vec<String>> {
        let output = self.invocation(&self.list_cmd).run(None)?;
        if !output.success() {
            bail!(command_failed(DriverType::Shell, "list", "*", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn is_listed(&self, id: &str) -> Result<bool> {
        Ok(self.listed()?.iter().any(|listed| listed == id))
    }
}

impl Driver for ShellDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Shell
    }

    fn store(&self, id: &str, data: &[u8]) -> Result<()> {
        validate_key(id)?;
        if self.is_listed(id)? {
            bail!(SecretsError::AlreadyExists(id.to_string()));
        }

        let output = self.run(&self.store_cmd, id, Some(data))?;
        if !output.success() {
            bail!(command_failed(DriverType::Shell, "store", id, &output));
        }

        debug!("Shell driver stored {}", id);
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Vec<u8>> {
        validate_key(id)?;

        let output = self.run(&self.lookup_cmd, id, None)?;
        if output.success() {
            return Ok(output.stdout);
        }

        if !self.is_listed(id)? {
            bail!(SecretsError::NotFound(id.to_string()));
        }
        bail!(command_failed(DriverType::Shell, "lookup", id, &output))
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_key(id)?;
        if !self.is_listed(id)? {
            bail!(SecretsError::NotFound(id.to_string()));
        }

        let output = self.run(&self.delete_cmd, id, None)?;
        if !output.success() {
            bail!(command_failed(DriverType::Shell, "delete", id, &output));
        }

        debug!("Shell driver deleted {}", id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        self.listed()
    }
}
