//! Optional TOML configuration.
//!
//! Looked up at `--config PATH`, or `manitree.toml` in the tree root.
//! Command line flags override whatever is set here.

use crate::compression::CompressionFormat;
use crate::hashing::is_supported_hash;
use crate::profile::PROFILE_NAMES;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "manitree.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Config file not found: {0}")]
    Missing(PathBuf),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Unsupported hash in configuration: {0}")]
    UnsupportedHash(String),
    #[error("Unknown profile in configuration: {0}")]
    UnknownProfile(String),
    #[error("No hashes configured")]
    NoHashes,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub hashes: Vec<String>,
    pub profile: String,
    pub compress_watermark: Option<u64>,
    pub compress_format: CompressionFormat,
    pub sort: bool,
    pub allow_xdev: bool,
    pub openpgp: OpenPgpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hashes: vec!["BLAKE2B".to_string(), "SHA512".to_string()],
            profile: "default".to_string(),
            compress_watermark: None,
            compress_format: CompressionFormat::Gz,
            sort: false,
            allow_xdev: false,
            openpgp: OpenPgpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenPgpConfig {
    pub program: String,
    pub homedir: Option<PathBuf>,
    pub key: Option<String>,
    /// Unset keeps the top-level Manifest signed if it was.
    pub sign: Option<bool>,
    pub verify: bool,
}

impl Default for OpenPgpConfig {
    fn default() -> Self {
        OpenPgpConfig {
            program: "gpg".to_string(),
            homedir: None,
            key: None,
            sign: None,
            verify: true,
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration.
    ///
    /// An explicit path must exist. Otherwise `manitree.toml` in
    /// `tree_root` is used if present, and the defaults if not.
    pub fn load(explicit: Option<&Path>, tree_root: &Path) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => tree_root.join(CONFIG_FILENAME),
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if explicit.is_some() {
                    return Err(ConfigError::Missing(path));
                }
                return Ok(Self::default());
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ConfigError::PermissionDenied(path));
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        tracing::debug!("Loading configuration from {}", path.display());
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hashes.is_empty() {
            return Err(ConfigError::NoHashes);
        }
        if let Some(bad) = self.hashes.iter().find(|h| !is_supported_hash(h)) {
            return Err(ConfigError::UnsupportedHash(bad.clone()));
        }
        if !PROFILE_NAMES.contains(&self.profile.as_str()) {
            return Err(ConfigError::UnknownProfile(self.profile.clone()));
        }
        Ok(())
    }
}
