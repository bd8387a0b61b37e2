//! Configuration management for vaultcore

use crate::archive::DEFAULT_COMPRESSION_LEVEL;
pub use crate::crypto::MAX_CHUNK_SIZE;
use crate::crypto::{BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::staging::{StagingClass, StagingRoots};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Highest Deflate level
pub const MAX_COMPRESSION_LEVEL: i64 = 9;

/// Name of the record database below the data directory
pub const RECORD_DB_NAME: &str = "records.db";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Staging root overrides; unset roots live below the data directory
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Inbound plaintext uploads
    pub uploads_dir: Option<PathBuf>,

    /// Encrypted blobs (durable)
    pub encrypted_dir: Option<PathBuf>,

    /// Decrypted downloads
    pub decrypted_dir: Option<PathBuf>,

    /// Per-export decrypted copies and archives
    pub export_temp_dir: Option<PathBuf>,
}

/// Stream cipher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CipherConfig {
    /// Bytes moved per read/write, rounded up to whole cipher blocks
    pub chunk_size: usize,
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Export archive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Deflate level (0-9)
    pub compression_level: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultConfig {
    /// Base directory for the record database and default staging roots
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cipher: CipherConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultcore");

        VaultConfig {
            data_dir,
            storage: StorageConfig::default(),
            cipher: CipherConfig::default(),
            archive: ArchiveConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Default config file location (~/.config/vaultcore/config.json)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultcore")
            .join("config.json")
    }

    /// Configuration rooted at `data_dir` with everything else defaulted
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        VaultConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: VaultConfig = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self> {
        let mut config = VaultConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };

        if let Some(dir) = path_var("VAULT_DATA_DIR") {
            self.data_dir = dir;
        }

        // Staging roots
        if let Some(dir) = path_var("UPLOADS_DIR") {
            self.storage.uploads_dir = Some(dir);
        }
        if let Some(dir) = path_var("ENCRYPTED_DIR") {
            self.storage.encrypted_dir = Some(dir);
        }
        if let Some(dir) = path_var("DECRYPTED_DIR") {
            self.storage.decrypted_dir = Some(dir);
        }
        if let Some(dir) = path_var("TEMP_DECRYPTED_DIR") {
            self.storage.export_temp_dir = Some(dir);
        }

        // Cipher and archive settings
        if let Some(chunk_size) = lookup("VAULT_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<usize>() {
                self.cipher.chunk_size = size;
            }
        }

        if let Some(level) = lookup("VAULT_COMPRESSION_LEVEL") {
            if let Ok(level) = level.trim().parse::<i64>() {
                self.archive.compression_level = level;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Data directory is required".to_string(),
            ));
        }

        if self.cipher.chunk_size < BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Chunk size must be at least {} bytes",
                BLOCK_SIZE
            )));
        }

        if self.cipher.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Chunk size exceeds {} bytes",
                MAX_CHUNK_SIZE
            )));
        }

        if !(0..=MAX_COMPRESSION_LEVEL).contains(&self.archive.compression_level) {
            return Err(Error::InvalidConfig(format!(
                "Compression level must be between 0 and {}",
                MAX_COMPRESSION_LEVEL
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::InvalidConfig(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        // Purging a transient root must never reach encrypted blobs
        let roots = self.staging_roots();
        let distinct: HashSet<&Path> = StagingClass::ALL.iter().map(|c| roots.root(*c)).collect();
        if distinct.len() != StagingClass::ALL.len() {
            return Err(Error::InvalidConfig(
                "Staging directories must all be different".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective staging roots
    pub fn staging_roots(&self) -> StagingRoots {
        let defaults = StagingRoots::under(&self.data_dir);
        StagingRoots {
            uploads: self.storage.uploads_dir.clone().unwrap_or(defaults.uploads),
            encrypted: self.storage.encrypted_dir.clone().unwrap_or(defaults.encrypted),
            decrypted: self.storage.decrypted_dir.clone().unwrap_or(defaults.decrypted),
            export_temp: self.storage.export_temp_dir.clone().unwrap_or(defaults.export_temp),
        }
    }

    /// Location of the sled record database
    pub fn record_db_path(&self) -> PathBuf {
        self.data_dir.join(RECORD_DB_NAME)
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| Error::storage(&self.data_dir, e))?;

        let roots = self.staging_roots();
        for class in StagingClass::ALL {
            let root = roots.root(class);
            std::fs::create_dir_all(root).map_err(|e| Error::storage(root, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::with_data_dir("/var/lib/vaultcore");
        config.validate().unwrap();

        assert_eq!(config.cipher.chunk_size, 64 * 1024);
        assert_eq!(config.archive.compression_level, 9);
        assert_eq!(config.record_db_path(), PathBuf::from("/var/lib/vaultcore/records.db"));
        assert_eq!(config.staging_roots(), StagingRoots::under("/var/lib/vaultcore"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = VaultConfig::with_data_dir("/data");
        config.apply_overrides(lookup(&[
            ("VAULT_DATA_DIR", "/srv/vault"),
            ("ENCRYPTED_DIR", "/mnt/blobs"),
            ("TEMP_DECRYPTED_DIR", " /tmp/export "),
            ("VAULT_CHUNK_SIZE", "4096"),
            ("VAULT_COMPRESSION_LEVEL", "not-a-number"),
        ]));

        assert_eq!(config.data_dir, PathBuf::from("/srv/vault"));
        assert_eq!(config.cipher.chunk_size, 4096);
        assert_eq!(config.archive.compression_level, 9);

        let roots = config.staging_roots();
        assert_eq!(roots.uploads, PathBuf::from("/srv/vault/uploads"));
        assert_eq!(roots.encrypted, PathBuf::from("/mnt/blobs"));
        assert_eq!(roots.export_temp, PathBuf::from("/tmp/export"));
    }

    #[test]
    fn test_empty_override_ignored() {
        let mut config = VaultConfig::with_data_dir("/data");
        config.apply_overrides(lookup(&[("UPLOADS_DIR", "  ")]));
        assert_eq!(config.storage.uploads_dir, None);
    }

    #[test]
    fn test_validation() {
        let mut config = VaultConfig::with_data_dir("/data");
        config.cipher.chunk_size = 8;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = VaultConfig::with_data_dir("/data");
        config.archive.compression_level = 10;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = VaultConfig::with_data_dir("/data");
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = VaultConfig::with_data_dir("/data");
        config.storage.decrypted_dir = Some(PathBuf::from("/data/encrypted"));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let mut config = VaultConfig::with_data_dir(temp.path().join("data"));
        config.storage.uploads_dir = Some(temp.path().join("in"));
        config.archive.compression_level = 6;
        config.save(&path).unwrap();

        let loaded: VaultConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let config: VaultConfig = serde_json::from_str(r#"{"data_dir": "/data"}"#).unwrap();
        assert_eq!(config.cipher, CipherConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(VaultConfig::load(&path), Err(Error::Config(_))));
        assert!(matches!(
            VaultConfig::load(temp.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_ensure_directories() {
        let temp = TempDir::new().unwrap();
        let config = VaultConfig::with_data_dir(temp.path().join("data"));
        config.ensure_directories().unwrap();

        let roots = config.staging_roots();
        for class in StagingClass::ALL {
            assert!(roots.root(class).is_dir());
        }
    }
}
