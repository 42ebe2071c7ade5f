use serde::Deserialize;

use polysession_crypto::{DEFAULT_KDF_ITERATIONS, INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD};

/// Key tool configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct KeyToolConfig {
    /// Encrypted key store file.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Device id this installation publishes its bundle under.
    #[serde(default = "default_device_id")]
    pub device_id: u32,

    /// One-time prekeys generated by `init`.
    #[serde(default = "default_initial_prekey_count")]
    pub initial_prekey_count: u32,

    /// `replenish` tops up only when fewer prekeys than this remain.
    #[serde(default = "default_prekey_replenish_threshold")]
    pub prekey_replenish_threshold: u32,

    /// Prekeys generated per replenish.
    #[serde(default = "default_prekey_batch_size")]
    pub prekey_batch_size: u32,

    /// Signed prekeys kept after a rotation, the new one included.
    #[serde(default = "default_signed_prekeys_to_keep")]
    pub signed_prekeys_to_keep: usize,

    /// PBKDF2 iterations for newly written store files.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_store_path() -> String {
    "polysession.keys".into()
}

fn default_device_id() -> u32 {
    1
}

fn default_initial_prekey_count() -> u32 {
    INITIAL_PREKEY_COUNT
}

fn default_prekey_replenish_threshold() -> u32 {
    PREKEY_REPLENISH_THRESHOLD
}

fn default_prekey_batch_size() -> u32 {
    INITIAL_PREKEY_COUNT
}

fn default_signed_prekeys_to_keep() -> usize {
    2
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

impl Default for KeyToolConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            device_id: default_device_id(),
            initial_prekey_count: default_initial_prekey_count(),
            prekey_replenish_threshold: default_prekey_replenish_threshold(),
            prekey_batch_size: default_prekey_batch_size(),
            signed_prekeys_to_keep: default_signed_prekeys_to_keep(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = KeyToolConfig::default();
        assert_eq!(config.store_path, "polysession.keys");
        assert_eq!(config.device_id, 1);
        assert_eq!(config.initial_prekey_count, 100);
        assert_eq!(config.prekey_replenish_threshold, 10);
        assert_eq!(config.prekey_batch_size, 100);
        assert_eq!(config.signed_prekeys_to_keep, 2);
        assert_eq!(config.kdf_iterations, 600_000);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            store_path = "/var/lib/polysession/alice.keys"
            device_id = 4711
            prekey_batch_size = 50
        "#;
        let config: KeyToolConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_path, "/var/lib/polysession/alice.keys");
        assert_eq!(config.device_id, 4711);
        assert_eq!(config.prekey_batch_size, 50);
        assert_eq!(config.initial_prekey_count, 100);
    }

    #[test]
    fn empty_toml_is_default() {
        let config: KeyToolConfig = toml::from_str("").unwrap();
        assert_eq!(config.kdf_iterations, DEFAULT_KDF_ITERATIONS);
    }
}
