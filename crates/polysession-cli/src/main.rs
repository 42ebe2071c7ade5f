use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

mod config;
mod output;

use config::KeyToolConfig;
use output::{BundleView, PreKeyView};
use polysession_crypto::{
    fingerprint, EncryptedFileBackend, KeyLifecycleManager, KeyMaterialStore, PublicPreKey,
};

#[derive(Parser)]
#[command(name = "polysession", about = "Signal key material for multi-device sessions")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the encrypted key store, overrides config
    #[arg(long)]
    store: Option<String>,

    /// Device id published with the bundle, overrides config
    #[arg(long)]
    device_id: Option<u32>,

    /// Key store password
    #[arg(long, env = "POLYSESSION_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate identity, registration id, prekeys and a signed prekey
    Init {
        /// Replace an existing identity. Peers will see an identity change.
        #[arg(long)]
        force: bool,
    },
    /// Print the publishable bundle as JSON
    Bundle,
    /// List unconsumed one-time prekeys as JSON
    Prekeys,
    /// Generate more one-time prekeys if the pool runs low
    Replenish {
        /// Replenish regardless of the threshold
        #[arg(long)]
        force: bool,
    },
    /// Generate a new signed prekey and prune old ones
    RotateSigned,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polysession=info,polysession_crypto=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", config_path))?
    } else {
        KeyToolConfig::default()
    };

    // CLI overrides
    if let Some(store) = args.store {
        config.store_path = store;
    }
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }

    let password = args
        .password
        .context("store password required: set POLYSESSION_PASSWORD or pass --password")?;

    let backend = EncryptedFileBackend::open(&config.store_path, &password, config.kdf_iterations)
        .with_context(|| format!("failed to open key store: {}", config.store_path))?;
    let store = KeyMaterialStore::open(Arc::new(backend));
    let keys = KeyLifecycleManager::new(store.clone());

    match args.command {
        Command::Init { force } => init(&keys, &config, force)?,
        Command::Bundle => {
            let bundle = keys.local_bundle().context("store is not initialised")?;
            print_json(&BundleView::new(config.device_id, &bundle))?;
        }
        Command::Prekeys => print_json(&available_pre_keys(&keys)?)?,
        Command::Replenish { force } => {
            let threshold = if force {
                u32::MAX
            } else {
                config.prekey_replenish_threshold
            };
            let generated = keys.replenish_pre_keys(threshold, config.prekey_batch_size)?;
            info!(generated = generated.len(), "prekey pool checked");
            let views = generated
                .iter()
                .map(|record| PublicPreKey::from_record(record).map(|pk| PreKeyView::from(&pk)))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&views)?;
        }
        Command::RotateSigned => {
            keys.rotate_signed_pre_key()
                .context("signed prekey rotation failed")?;
            let pruned = keys.prune_signed_pre_keys(config.signed_prekeys_to_keep)?;
            info!(
                current = ?store.current_signed_pre_key_id()?,
                pruned = pruned.len(),
                "signed prekey rotated"
            );
        }
    }

    store
        .close()
        .with_context(|| format!("failed to write key store: {}", config.store_path))?;
    Ok(())
}

fn init(keys: &KeyLifecycleManager, config: &KeyToolConfig, force: bool) -> Result<()> {
    if keys.store().identity_key_pair()?.is_some() && !force {
        bail!(
            "{} already holds an identity; pass --force to replace it",
            config.store_path
        );
    }

    let identity = keys.generate_identity()?;
    let registration_id = keys.generate_registration_id()?;
    keys.generate_pre_keys(keys.next_pre_key_id()?, config.initial_prekey_count)?;
    keys.rotate_signed_pre_key()?;

    info!(
        store = %config.store_path,
        device_id = config.device_id,
        registration_id,
        "key store initialised"
    );
    println!("{}", fingerprint(identity.identity_key()));
    Ok(())
}

fn available_pre_keys(keys: &KeyLifecycleManager) -> Result<Vec<PreKeyView>> {
    keys.list_available_pre_keys()?
        .iter()
        .map(|record| Ok(PreKeyView::from(&PublicPreKey::from_record(record)?)))
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyLifecycleManager {
        KeyLifecycleManager::new(KeyMaterialStore::in_memory())
    }

    #[test]
    fn init_populates_store_and_refuses_rerun() {
        let keys = manager();
        let config = KeyToolConfig {
            initial_prekey_count: 5,
            ..KeyToolConfig::default()
        };

        init(&keys, &config, false).unwrap();
        assert_eq!(available_pre_keys(&keys).unwrap().len(), 5);
        assert_eq!(keys.store().current_signed_pre_key_id().unwrap(), Some(1));
        let first = keys.local_bundle().unwrap();

        assert!(init(&keys, &config, false).is_err());

        init(&keys, &config, true).unwrap();
        let second = keys.local_bundle().unwrap();
        assert_ne!(first.identity_key, second.identity_key);
        assert_eq!(second.signed_pre_key_id, 2);
        // The second batch continues after the first.
        let ids: Vec<u32> = available_pre_keys(&keys).unwrap().iter().map(|pk| pk.id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn args_parse_subcommands() {
        let args = Args::try_parse_from([
            "polysession",
            "--store",
            "alice.keys",
            "--password",
            "pw",
            "replenish",
            "--force",
        ])
        .unwrap();
        assert_eq!(args.store.as_deref(), Some("alice.keys"));
        assert!(matches!(args.command, Command::Replenish { force: true }));
    }
}
