//! Error taxonomy for the secrets manager and its drivers

use thiserror::Error;

/// Secrets-specific errors
///
/// Functions return `anyhow::Result`; these are raised with `bail!` and
/// recovered with `downcast_ref::<SecretsError>()`.
#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Invalid secret name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Secret name in use: {0}")]
    NameInUse(String),

    #[error("Replace and ignore-if-exists are mutually exclusive")]
    ConflictingOptions,

    #[error("No such secret: {0}")]
    NotFound(String),

    #[error("{input:?} matches {matches} secret IDs, use more characters")]
    Ambiguous { input: String, matches: usize },

    #[error("Secret data already exists for ID {0}")]
    AlreadyExists(String),

    #[error("Invalid secret data: {0}")]
    InvalidData(String),

    #[error("Unknown secrets driver: {0}")]
    UnknownDriver(String),

    #[error("Driver {driver} requires option {option:?}")]
    MissingDriverOption {
        driver: &'static str,
        option: &'static str,
    },

    #[error("{driver} driver failed to {op} {id}: {reason}")]
    Driver {
        driver: &'static str,
        op: &'static str,
        id: String,
        reason: String,
    },

    #[error("Secret {name} is now {new_id}, but old data {old_id} was left behind in the {driver} driver: {reason}")]
    ReplacedWithOrphan {
        name: String,
        new_id: String,
        old_id: String,
        driver: &'static str,
        reason: String,
    },

    #[error("Secret data for ID {id} left behind in the {driver} driver ({context}): {reason}")]
    Orphaned {
        id: String,
        driver: &'static str,
        context: String,
        reason: String,
    },
}

impl SecretsError {
    /// Recover the categorical error behind an `anyhow::Error`, if any
    pub fn of(err: &anyhow::Error) -> Option<&SecretsError> {
        err.downcast_ref::<SecretsError>()
    }

    /// Whether `err` is a `NotFound`
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::of(err), Some(SecretsError::NotFound(_)))
    }
}
