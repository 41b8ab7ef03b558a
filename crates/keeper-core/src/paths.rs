//! Standard paths used by keeper

use std::path::PathBuf;

/// Standard keeper paths
pub struct Paths {
    /// Data directory (~/.local/share/keeper)
    pub data: PathBuf,
    /// Config directory (~/.config/keeper)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("keeper");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("keeper");

        Self { data, config }
    }

    /// Root directory of the secrets manager (metadata, lock, file driver data)
    pub fn secrets(&self) -> PathBuf {
        self.data.join("secrets")
    }

    /// Path of the configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }

    /// Default password-store root used by the pass driver
    pub fn password_store() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".password-store")
    }
}
