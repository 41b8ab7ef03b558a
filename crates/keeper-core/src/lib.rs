//! keeper-core - Shared plumbing for keeper
//!
//! Standard paths, the configuration file, the cross-process metadata lock
//! and the subprocess runner used by the external-command drivers.

pub mod config;
pub mod lock;
pub mod paths;
pub mod process;

pub use config::Config;
pub use lock::{FileLock, LockError, LockGuard};
pub use paths::Paths;
pub use process::{Invocation, ProcessError, ProcessOutput};

/// Generate a random lowercase hex string of exactly `len` characters
pub fn random_hex(len: usize) -> String {
    use rand::RngCore;

    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut encoded = hex::encode(bytes);
    encoded.truncate(len);
    encoded
}
