//! Configuration for herbtrack

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::LedgerError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("herbtrack")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Base URL embedded in scannable codes, e.g. `https://trace.example/scan/batch/{id}`
    #[serde(default = "default_scan_base_url")]
    pub scan_base_url: String,

    /// Currency recorded on new payments
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Public key id of the payment gateway (echoed to clients)
    #[serde(default)]
    pub gateway_key_id: String,

    /// Shared secret used to verify gateway signatures
    #[serde(default)]
    pub gateway_key_secret: String,
}

fn default_http_port() -> u16 {
    8095
}

fn default_scan_base_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_currency() -> String {
    "INR".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            scan_base_url: default_scan_base_url(),
            currency: default_currency(),
            gateway_key_id: String::new(),
            gateway_key_secret: String::new(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LedgerError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LedgerError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LedgerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.currency.trim().is_empty() {
            return Err(LedgerError::Config("currency must not be empty".into()));
        }
        if self.scan_base_url.trim().is_empty() {
            return Err(LedgerError::Config("scan_base_url must not be empty".into()));
        }
        Ok(())
    }

    /// Get ledger database path
    pub fn ledger_db_path(&self) -> PathBuf {
        self.storage_dir.join("ledger.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("http_port = 9000\n").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.currency, "INR");
        assert!(config.gateway_key_secret.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.scan_base_url = "https://trace.example".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.scan_base_url, "https://trace.example");
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_empty_currency_rejected() {
        let config = Config {
            currency: " ".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }
}
