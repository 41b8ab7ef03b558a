//! keeper - Secrets manager for container tooling
//!
//! "A name you can remember, an ID that never lies."
//!
//! Secrets get a human name and an immutable random ID. The manager keeps a
//! single metadata file describing every secret and hands the raw bytes to a
//! pluggable driver:
//! - file: one owner-only file per ID on local disk
//! - pass: gpg-encrypted entries in a password-store style directory
//! - shell: four user-supplied commands, ID passed as `$SECRET_ID`
//!
//! Names are unique, IDs are unique, and a replace never destroys old data
//! before the new data is stored.

pub mod driver;
pub mod error;
pub mod id;
pub mod manager;
pub mod secret;
pub mod store;
pub mod validate;

pub use driver::{Driver, DriverSettings, DriverType};
pub use error::SecretsError;
pub use manager::SecretsManager;
pub use secret::{Secret, SecretFilter, StoreOptions};
pub use store::MetadataStore;
