use std::path::PathBuf;

use collar_crypto::prekey::{INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD};
use collar_crypto::HomeDirectory;
use serde::Deserialize;

/// Keytool configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct KeytoolConfig {
    /// Directory holding one key store per server.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// Server whose key store to operate on.
    #[serde(default = "default_server")]
    pub server: String,

    /// Device id advertised in published bundles.
    #[serde(default = "default_device_id")]
    pub device_id: u32,

    /// One-time prekeys generated per batch.
    #[serde(default = "default_prekey_batch")]
    pub prekey_batch: u32,

    /// Replenish when fewer one-time prekeys than this remain.
    #[serde(default = "default_replenish_threshold")]
    pub replenish_threshold: u32,
}

fn default_home() -> PathBuf {
    HomeDirectory::default_root().unwrap_or_else(|| PathBuf::from(".collar"))
}

fn default_server() -> String {
    "localhost".into()
}

fn default_device_id() -> u32 {
    collar_protocol::DEFAULT_DEVICE_ID
}

fn default_prekey_batch() -> u32 {
    INITIAL_PREKEY_COUNT
}

fn default_replenish_threshold() -> u32 {
    PREKEY_REPLENISH_THRESHOLD
}

impl Default for KeytoolConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            server: default_server(),
            device_id: default_device_id(),
            prekey_batch: default_prekey_batch(),
            replenish_threshold: default_replenish_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = KeytoolConfig::default();
        assert_eq!(config.server, "localhost");
        assert_eq!(config.device_id, 1);
        assert_eq!(config.prekey_batch, 100);
        assert_eq!(config.replenish_threshold, 10);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            home = "/var/lib/collar"
            server = "api.collarmc.com"
            prekey_batch = 250
        "#;
        let config: KeytoolConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.home, PathBuf::from("/var/lib/collar"));
        assert_eq!(config.server, "api.collarmc.com");
        assert_eq!(config.prekey_batch, 250);
        assert_eq!(config.replenish_threshold, 10);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: KeytoolConfig = toml::from_str("").unwrap();
        assert_eq!(config.server, "localhost");
        assert_eq!(config.device_id, 1);
    }
}
