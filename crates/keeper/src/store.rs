//! Metadata store
//!
//! All secret records live in one JSON file, `<root>/secrets.json`, guarded
//! by `<root>/secrets.lock`. Access goes through a [`Txn`]: opening one takes
//! the in-process mutex and then the file lock (shared for reads, exclusive
//! for writes), and reloads the records if another process wrote since this
//! handle last looked. Dropping the transaction releases both.

use anyhow::{anyhow, bail, Context, Result};
use keeper_core::{FileLock, LockGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::SecretsError;
use crate::id::looks_like_id;
use crate::secret::Secret;

const METADATA_FILE: &str = "secrets.json";
const LOCK_FILE: &str = "secrets.lock";

/// On-disk layout of the metadata file
#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    /// Records keyed by ID
    #[serde(default)]
    secrets: BTreeMap<String, Secret>,
}

struct State {
    lock: FileLock,
    records: Records,
    loaded: bool,
}

/// The persistent set of secret records
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl MetadataStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    /// The metadata file itself is created on first write.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create secrets directory: {}", root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to secure {}", root.display()))?;
        }

        let lock = FileLock::open(&root.join(LOCK_FILE))?;

        Ok(Self {
            path: root.join(METADATA_FILE),
            state: Mutex::new(State {
                lock,
                records: Records::default(),
                loaded: false,
            }),
        })
    }

    /// Path of the metadata file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a read-only transaction (shared lock)
    pub fn read(&self) -> Result<Txn<'_>> {
        self.begin(false)
    }

    /// Open a read-write transaction (exclusive lock)
    pub fn write(&self) -> Result<Txn<'_>> {
        self.begin(true)
    }

    fn begin(&self, writable: bool) -> Result<Txn<'_>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Metadata store mutex poisoned"))?;

        let guard = if writable {
            state.lock.lock_exclusive()?
        } else {
            state.lock.lock_shared()?
        };

        let modified = state.lock.modified()?;
        if modified || !state.loaded {
            state.records = load(&self.path)?;
            state.loaded = true;
            debug!(
                "Loaded {} secret records from {}",
                state.records.secrets.len(),
                self.path.display()
            );
        }

        Ok(Txn {
            _guard: guard,
            state,
            path: &self.path,
            writable,
        })
    }

    /// Add a record
    pub fn add(&self, secret: Secret) -> Result<()> {
        self.write()?.add(secret)
    }

    /// Remove the record with exactly this ID
    pub fn remove(&self, id: &str) -> Result<Secret> {
        self.write()?.remove(id)
    }

    /// Find a record by exact name
    pub fn find_by_name(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.read()?.find_by_name(name).cloned())
    }

    /// Find a record by ID, unique ID prefix, or (for non-ID input) name
    pub fn find_by_id(&self, input: &str) -> Result<Secret> {
        Ok(self.read()?.find_by_id(input)?.clone())
    }

    /// All records
    pub fn all(&self) -> Result<Vec<Secret>> {
        Ok(self.read()?.all())
    }
}

/// A locked view of the records. Mutations are persisted immediately.
pub struct Txn<'a> {
    _guard: LockGuard,
    state: MutexGuard<'a, State>,
    path: &'a Path,
    writable: bool,
}

impl Txn<'_> {
    /// All records, oldest first
    pub fn all(&self) -> Vec<Secret> {
        let mut secrets: Vec<Secret> = self.state.records.secrets.values().cloned().collect();
        secrets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        secrets
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.state.records.secrets.contains_key(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Secret> {
        self.state.records.secrets.values().find(|s| s.name == name)
    }

    /// Resolve an ID: exact match, then unique prefix; input that cannot be
    /// an ID at all falls back to an exact name match.
    pub fn find_by_id(&self, input: &str) -> Result<&Secret> {
        let secrets = &self.state.records.secrets;

        if let Some(secret) = secrets.get(input) {
            return Ok(secret);
        }

        if looks_like_id(input) {
            let mut matches = secrets
                .range(input.to_string()..)
                .take_while(|(id, _)| id.starts_with(input))
                .map(|(_, secret)| secret);

            return match (matches.next(), matches.count()) {
                (Some(secret), 0) => Ok(secret),
                (Some(_), more) => bail!(SecretsError::Ambiguous {
                    input: input.to_string(),
                    matches: more + 1,
                }),
                (None, _) => bail!(SecretsError::NotFound(input.to_string())),
            };
        }

        match self.find_by_name(input) {
            Some(secret) => Ok(secret),
            None => bail!(SecretsError::NotFound(input.to_string())),
        }
    }

    /// Resolve what a caller typed: exact name first, then [`find_by_id`](Self::find_by_id)
    pub fn resolve(&self, name_or_id: &str) -> Result<&Secret> {
        match self.find_by_name(name_or_id) {
            Some(secret) => Ok(secret),
            None => self.find_by_id(name_or_id),
        }
    }

    /// Add a record, enforcing ID and name uniqueness
    pub fn add(&mut self, secret: Secret) -> Result<()> {
        self.ensure_writable()?;
        if self.contains_id(&secret.id) {
            bail!(SecretsError::AlreadyExists(secret.id));
        }
        if self.find_by_name(&secret.name).is_some() {
            bail!(SecretsError::NameInUse(secret.name));
        }

        let id = secret.id.clone();
        self.state.records.secrets.insert(id.clone(), secret);
        if let Err(e) = self.persist() {
            self.state.records.secrets.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the record with exactly this ID
    pub fn remove(&mut self, id: &str) -> Result<Secret> {
        self.ensure_writable()?;
        let Some(removed) = self.state.records.secrets.remove(id) else {
            bail!(SecretsError::NotFound(id.to_string()));
        };

        if let Err(e) = self.persist() {
            self.state.records.secrets.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Swap the record `old_id` for `secret` in a single write
    pub fn replace(&mut self, old_id: &str, secret: Secret) -> Result<Secret> {
        self.ensure_writable()?;
        let Some(old) = self.state.records.secrets.remove(old_id) else {
            bail!(SecretsError::NotFound(old_id.to_string()));
        };

        let conflict = if self.contains_id(&secret.id) {
            Some(SecretsError::AlreadyExists(secret.id.clone()))
        } else if self.find_by_name(&secret.name).is_some() {
            Some(SecretsError::NameInUse(secret.name.clone()))
        } else {
            None
        };
        if let Some(conflict) = conflict {
            self.state.records.secrets.insert(old_id.to_string(), old);
            bail!(conflict);
        }

        let new_id = secret.id.clone();
        self.state.records.secrets.insert(new_id.clone(), secret);
        if let Err(e) = self.persist() {
            self.state.records.secrets.remove(&new_id);
            self.state.records.secrets.insert(old_id.to_string(), old);
            return Err(e);
        }
        Ok(old)
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            bail!("Metadata store transaction is read-only");
        }
        Ok(())
    }

    /// Write the records atomically and stamp the lock so other processes reload.
    ///
    /// The token is stamped before the rename: once the new file is in place
    /// nothing else can fail, so an error always means the old records stand.
    fn persist(&mut self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state.records)
            .context("Failed to serialize secret records")?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let written = file.write_all(json.as_bytes()).and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written {
            fs::remove_file(&tmp_path).ok();
            return Err(e).with_context(|| format!("Failed to write {}", tmp_path.display()));
        }

        if let Err(e) = self.state.lock.touch() {
            fs::remove_file(&tmp_path).ok();
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&tmp_path, self.path) {
            fs::remove_file(&tmp_path).ok();
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }

        debug!(
            "Persisted {} secret records to {}",
            self.state.records.secrets.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn load(path: &Path) -> Result<Records> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Records::default()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    if content.trim().is_empty() {
        return Ok(Records::default());
    }

    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
