//! File driver - one owner-only file per secret ID

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{required_option, Driver, DriverType};
use crate::error::SecretsError;
use crate::validate::validate_key;

/// Stores each secret as `<path>/<id>`
pub struct FileDriver {
    root: PathBuf,
}

impl FileDriver {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Build from driver options (`path` is required)
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let path = required_option(options, DriverType::File, "path")?;
        Ok(Self::new(Path::new(path)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, id: &str) -> Result<PathBuf> {
        validate_key(id)?;
        Ok(self.root.join(id))
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create driver directory: {}", self.root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to secure {}", self.root.display()))?;
        }

        Ok(())
    }
}

impl Driver for FileDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::File
    }

    fn store(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.entry_path(id)?;
        self.ensure_root()?;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = match options.open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!(SecretsError::AlreadyExists(id.to_string()))
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create {}", path.display()))
            }
        };

        let written = file.write_all(data).and_then(|_| file.sync_all());
        if let Err(e) = written {
            // The file is ours (create_new); do not leave a truncated entry behind
            drop(file);
            fs::remove_file(&path).ok();
            return Err(e).with_context(|| format!("Failed to write {}", path.display()));
        }

        debug!("Stored {} bytes at {}", data.len(), path.display());
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!(SecretsError::NotFound(id.to_string()))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.entry_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!(SecretsError::NotFound(id.to_string()))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_key(&name).is_ok() {
                ids.push(name);
            }
        }

        ids.sort();
        Ok(ids)
    }
}
