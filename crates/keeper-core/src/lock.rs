//! Cross-process lock around the metadata file
//!
//! An advisory `flock` on a sidecar lock file serializes writers across
//! processes. Every writer stamps a fresh random token into the lock file
//! before releasing it, so a reader can tell whether someone else wrote since
//! it last looked and reload its in-memory copy.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const TOKEN_LEN: usize = 32;

/// Lock-specific errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to acquire {mode} lock on {path}: {source}")]
    Acquire {
        mode: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to access lock token in {path}: {source}")]
    Token {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock on {}: {}", self.path.display(), e);
        }
    }
}

/// A lock file shared between processes
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    /// Token this handle last wrote or observed
    last_token: Option<String>,
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`
    pub fn open(path: &Path) -> Result<Self, LockError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let file = options.open(path).map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            last_token: None,
        })
    }

    /// Block until an exclusive lock is held
    pub fn lock_exclusive(&self) -> Result<LockGuard, LockError> {
        let file = self.duplicate()?;
        FileExt::lock_exclusive(&file).map_err(|source| LockError::Acquire {
            mode: "exclusive",
            path: self.path.clone(),
            source,
        })?;
        Ok(LockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Block until a shared lock is held
    pub fn lock_shared(&self) -> Result<LockGuard, LockError> {
        let file = self.duplicate()?;
        FileExt::lock_shared(&file).map_err(|source| LockError::Acquire {
            mode: "shared",
            path: self.path.clone(),
            source,
        })?;
        Ok(LockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Report whether another writer touched the lock since this handle last
    /// looked, and remember the current token.
    ///
    /// Call only while holding a lock.
    pub fn modified(&mut self) -> Result<bool, LockError> {
        let current = self.read_token().map_err(|source| self.token_error(source))?;
        let changed = current != self.last_token;
        self.last_token = current;
        Ok(changed)
    }

    /// Record a write by stamping a fresh token.
    ///
    /// Call only while holding the exclusive lock.
    pub fn touch(&mut self) -> Result<(), LockError> {
        let token = crate::random_hex(TOKEN_LEN);
        self.write_token(&token)
            .map_err(|source| self.token_error(source))?;
        self.last_token = Some(token);
        Ok(())
    }

    fn duplicate(&self) -> Result<File, LockError> {
        self.file.try_clone().map_err(|source| LockError::Open {
            path: self.path.clone(),
            source,
        })
    }

    fn read_token(&self) -> io::Result<Option<String>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let token = content.trim();
        Ok(if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        })
    }

    fn write_token(&self, token: &str) -> io::Result<()> {
        let mut file = &self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(token.as_bytes())?;
        file.sync_data()
    }

    fn token_error(&self, source: io::Error) -> LockError {
        LockError::Token {
            path: self.path.clone(),
            source,
        }
    }
}
