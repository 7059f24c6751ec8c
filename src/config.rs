use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::ScryptParams;
use crate::keyring;
use crate::{Error, Result};

/// Top-level configuration (loaded from fbe-unlock.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the encrypted data partition (default: /data)
    pub data_root: PathBuf,
    pub keys: KeysConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            keys: KeysConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Keys are hardware-wrapped inline-encryption keys
    pub wrapped_key_supported: bool,
    /// scrypt exponents for new envelopes, "N:r:p" (default: 15:3:1)
    pub scrypt_params: String,
    /// Contents encryption mode recorded for the device key
    pub contents_mode: String,
    /// Filenames encryption mode recorded for the device key
    pub filenames_mode: String,
    /// Kernel keyring holding installed keys
    pub keyring_name: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            wrapped_key_supported: false,
            scrypt_params: ScryptParams::default().to_string(),
            contents_mode: "aes-256-xts".into(),
            filenames_mode: "aes-256-heh".into(),
            keyring_name: "e4crypt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Behaviour switches that differ between platform releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub wrapped_key_supported: bool,
    pub scrypt_params: ScryptParams,
    pub contents_mode: String,
    pub filenames_mode: String,
    pub keyring_name: String,
}

impl Default for Capabilities {
    fn default() -> Self {
        let keys = KeysConfig::default();
        Self {
            wrapped_key_supported: keys.wrapped_key_supported,
            scrypt_params: ScryptParams::default(),
            contents_mode: keys.contents_mode,
            filenames_mode: keys.filenames_mode,
            keyring_name: keys.keyring_name,
        }
    }
}

impl Config {
    /// Parses a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Format(format!("parsing config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Format(e.to_string()))
    }

    /// Validated key settings; an unsupported contents mode is
    /// [`Error::Format`].
    pub fn capabilities(&self) -> Result<Capabilities> {
        keyring::contents_mode_id(&self.keys.contents_mode)?;
        Ok(Capabilities {
            wrapped_key_supported: self.keys.wrapped_key_supported,
            scrypt_params: self.keys.scrypt_params.parse()?,
            contents_mode: self.keys.contents_mode.clone(),
            filenames_mode: self.keys.filenames_mode.clone(),
            keyring_name: self.keys.keyring_name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.data_root, PathBuf::from("/data"));
        assert_eq!(config.capabilities().unwrap(), Capabilities::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            data_root = "/mnt/data"

            [keys]
            wrapped_key_supported = true
            scrypt_params = "11:3:1"
            "#,
        )
        .unwrap();

        let caps = config.capabilities().unwrap();
        assert_eq!(config.data_root, PathBuf::from("/mnt/data"));
        assert!(caps.wrapped_key_supported);
        assert_eq!(caps.scrypt_params, ScryptParams::new(11, 3, 1));
        assert_eq!(caps.keyring_name, "e4crypt");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn bad_scrypt_params_are_rejected() {
        let config = Config::from_toml("[keys]\nscrypt_params = \"fast\"\n").unwrap();
        assert!(config.capabilities().is_err());
    }

    #[test]
    fn non_xts_contents_mode_is_rejected() {
        let config = Config::from_toml("[keys]\ncontents_mode = \"adiantum\"\n").unwrap();
        let err = config.capabilities().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
        assert!(err.to_string().contains("adiantum"));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/fbe-unlock.toml")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }
}
