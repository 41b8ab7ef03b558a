//! Secrets manager - the entry point callers use
//!
//! Validates names, resolves or generates IDs, keeps the metadata store and
//! the drivers consistent. Mutations hold the exclusive metadata lock for
//! their whole duration; reads hold the shared lock.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use keeper_core::Config;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::driver::{driver_failure, open_driver, Driver, DriverSettings, DriverType};
use crate::error::SecretsError;
use crate::id::new_id;
use crate::secret::{Secret, SecretFilter, StoreOptions};
use crate::store::{MetadataStore, Txn};
use crate::validate::validate_name;

/// Draws allowed before giving up on finding an unused ID
const MAX_ID_ATTEMPTS: usize = 64;

/// Directory under the root used by the file driver when no path is given
const FILE_DRIVER_DIR: &str = "filedriver";

pub struct SecretsManager {
    root: PathBuf,
    store: MetadataStore,
    config: Config,
    settings: DriverSettings,
}

impl SecretsManager {
    /// Open the manager rooted at `root` with default configuration
    pub fn new(root: &Path) -> Result<Self> {
        Self::with_config(root, Config::default())
    }

    /// Open the manager rooted at `root`
    pub fn with_config(root: &Path, config: Config) -> Result<Self> {
        let store = MetadataStore::new(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            store,
            settings: DriverSettings::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Driver used when the caller does not pick one
    pub fn default_driver(&self) -> Result<DriverType> {
        self.config.default_driver.parse()
    }

    /// Store a new secret and return its ID.
    ///
    /// | replace | ignore_if_exists | name taken | outcome                         |
    /// |---------|------------------|------------|---------------------------------|
    /// | no      | no               | yes        | `NameInUse`                     |
    /// | yes     | no               | yes        | new ID, original `created_at`   |
    /// | yes     | yes              | any        | `ConflictingOptions`            |
    /// | no      | yes              | yes        | existing ID, nothing changes    |
    /// | any     | no               | no         | new ID                          |
    pub fn store(
        &self,
        name: &str,
        data: &[u8],
        driver: DriverType,
        options: StoreOptions,
    ) -> Result<String> {
        validate_name(name)?;
        if options.replace && options.ignore_if_exists {
            bail!(SecretsError::ConflictingOptions);
        }
        self.validate_data(data)?;

        let driver_options = self.driver_options(driver, &options.driver_options);
        let backend = open_driver(driver, &driver_options, &self.settings)?;

        let mut txn = self.store.write()?;
        let existing = txn.find_by_name(name).cloned();
        if let Some(existing) = &existing {
            if options.ignore_if_exists {
                debug!("Secret {} exists as {}, leaving it alone", name, existing.id);
                return Ok(existing.id.clone());
            }
            if !options.replace {
                bail!(SecretsError::NameInUse(name.to_string()));
            }
        }

        let id = unique_id(&txn)?;
        backend
            .store(&id, data)
            .map_err(|e| driver_failure(driver, "store", &id, e))
            .with_context(|| format!("Failed to store secret {}", name))?;

        let now = Utc::now();
        let secret = Secret {
            id: id.clone(),
            name: name.to_string(),
            driver,
            driver_options,
            metadata: options.metadata,
            labels: options.labels,
            created_at: existing.as_ref().map(|old| old.created_at).unwrap_or(now),
            updated_at: now,
        };

        let committed = match &existing {
            Some(old) => txn.replace(&old.id, secret).map(Some),
            None => txn.add(secret).map(|()| None),
        };

        match committed {
            Err(e) => {
                warn!("Metadata write for {} failed, removing stored data {}", name, id);
                if let Err(cleanup) = backend.delete(&id) {
                    bail!(SecretsError::Orphaned {
                        id,
                        driver: driver.as_str(),
                        context: format!("rollback after failed metadata write: {:#}", e),
                        reason: format!("{:#}", cleanup),
                    });
                }
                Err(e)
            }
            Ok(Some(old)) => {
                self.discard_replaced(&old, &id)?;
                info!("Replaced secret {} ({} -> {})", name, old.id, id);
                Ok(id)
            }
            Ok(None) => {
                info!("Stored secret {} as {} ({} driver)", name, id, driver);
                Ok(id)
            }
        }
    }

    /// Metadata for a secret, by name, ID or unique ID prefix
    pub fn lookup(&self, name_or_id: &str) -> Result<Secret> {
        let txn = self.store.read()?;
        Ok(txn.resolve(name_or_id)?.clone())
    }

    /// Metadata and bytes for a secret
    pub fn lookup_secret_data(&self, name_or_id: &str) -> Result<(Secret, Vec<u8>)> {
        let txn = self.store.read()?;
        let secret = txn.resolve(name_or_id)?.clone();

        let data = self
            .open(&secret)?
            .lookup(&secret.id)
            .map_err(|e| driver_failure(secret.driver, "lookup", &secret.id, e))
            .with_context(|| format!("Failed to read secret {}", secret.name))?;

        Ok((secret, data))
    }

    /// Delete a secret and its data, returning the removed ID.
    ///
    /// When the driver fails the record stays in place.
    pub fn delete(&self, name_or_id: &str) -> Result<String> {
        let mut txn = self.store.write()?;
        let secret = txn.resolve(name_or_id)?.clone();

        match self.open(&secret)?.delete(&secret.id) {
            Ok(()) => {}
            Err(e) if SecretsError::is_not_found(&e) => {
                warn!(
                    "Data for secret {} ({}) was already gone from the {} driver",
                    secret.name, secret.id, secret.driver
                );
            }
            Err(e) => {
                return Err(driver_failure(secret.driver, "delete", &secret.id, e))
                    .with_context(|| format!("Failed to delete secret {}", secret.name));
            }
        }

        txn.remove(&secret.id).with_context(|| {
            format!(
                "Data for secret {} ({}) was deleted but its record could not be removed",
                secret.name, secret.id
            )
        })?;

        info!("Deleted secret {} ({})", secret.name, secret.id);
        Ok(secret.id)
    }

    /// All secret records, oldest first
    pub fn list(&self) -> Result<Vec<Secret>> {
        self.store.all()
    }

    /// Records matching every filter
    pub fn list_filtered(&self, filters: &[SecretFilter]) -> Result<Vec<Secret>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|secret| filters.iter().all(|f| f.matches(secret)))
            .collect())
    }

    fn validate_data(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!(SecretsError::InvalidData(
                "secret data must not be empty".to_string()
            ));
        }
        if data.len() > self.config.max_secret_size {
            bail!(SecretsError::InvalidData(format!(
                "secret data is {} bytes, the limit is {}",
                data.len(),
                self.config.max_secret_size
            )));
        }
        Ok(())
    }

    /// Caller options plus defaults the driver needs
    fn driver_options(
        &self,
        driver: DriverType,
        given: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut options = given.clone();
        if driver == DriverType::File && !options.contains_key("path") {
            options.insert(
                "path".to_string(),
                self.root.join(FILE_DRIVER_DIR).to_string_lossy().to_string(),
            );
        }
        options
    }

    /// The driver owning a stored secret
    fn open(&self, secret: &Secret) -> Result<Box<dyn Driver>> {
        open_driver(secret.driver, &secret.driver_options, &self.settings)
    }

    /// Remove the data of a record that a replace just superseded.
    /// Runs while the caller still holds the exclusive metadata lock.
    fn discard_replaced(&self, old: &Secret, new_id: &str) -> Result<()> {
        let deleted = self
            .open(old)
            .and_then(|backend| backend.delete(&old.id));

        match deleted {
            Ok(()) => Ok(()),
            Err(e) if SecretsError::is_not_found(&e) => Ok(()),
            Err(e) => bail!(SecretsError::ReplacedWithOrphan {
                name: old.name.clone(),
                new_id: new_id.to_string(),
                old_id: old.id.clone(),
                driver: old.driver.as_str(),
                reason: format!("{:#}", e),
            }),
        }
    }
}

/// A fresh ID not used by any record
fn unique_id(txn: &Txn<'_>) -> Result<String> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = new_id();
        if !txn.contains_id(&id) {
            return Ok(id);
        }
        debug!("Generated ID {} is taken, drawing again", id);
    }
    bail!(
        "Failed to generate an unused secret ID after {} attempts",
        MAX_ID_ATTEMPTS
    )
}
