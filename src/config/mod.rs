//! Configuration Management Module
//!
//! This module handles loading and validating configuration for the witness service.
//! Configuration includes the watched chain, contract addresses, the witness key,
//! polling parameters, the relayer endpoint and the store connection.
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed with `WITNESS_` (e.g. `WITNESS_PRIVATE_KEY`),
//! which take precedence over the file.

use anyhow::Context;
use ethereum_types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::address::parse_address;
use crate::error::{WitnessError, WitnessResult};
use crate::transfer::ChainKind;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "WITNESS";

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_PATH_ENV: &str = "WITNESS_CONFIG_PATH";

// ============================================================================
// CONFIGURATION STRUCTURES
// ============================================================================

/// Main configuration structure containing all service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chain the cashier lives on: "ethereum" or "iotex"
    #[serde(default = "default_chain")]
    pub chain: ChainKind,
    /// RPC endpoint of the source chain
    #[serde(default)]
    pub client_url: String,
    /// Witness secp256k1 private key (hex)
    #[serde(default)]
    pub private_key: String,
    /// Validator contract on the destination chain
    #[serde(default)]
    pub validator_contract_address: String,
    /// Cashier contract on the source chain
    #[serde(default)]
    pub cashier_contract_address: String,
    /// First block to scan when no cursor has been persisted yet
    #[serde(default = "default_start_block_height")]
    pub start_block_height: u64,
    /// Maximum number of blocks scanned per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Polling interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum relayer settlement lookups per cycle
    #[serde(default = "default_settlement_checks_per_cycle")]
    pub settlement_checks_per_cycle: u32,
    /// Blocks an event must be buried under; chain default when absent
    #[serde(default)]
    pub confirmation_depth: Option<u64>,
    /// Timeout for chain and relayer requests in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Relayer base URL
    #[serde(default)]
    pub relayer_url: String,
    /// Optional webhook receiving operator alerts
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    /// Store connection string (e.g. "sqlite://witness.db")
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Name of the transfers table
    #[serde(default = "default_transfer_table_name")]
    pub transfer_table_name: String,
    /// Name of the token pairs table
    #[serde(default = "default_token_pair_table_name")]
    pub token_pair_table_name: String,
}

fn default_chain() -> ChainKind {
    ChainKind::Ethereum
}

fn default_start_block_height() -> u64 {
    9_305_000
}

fn default_batch_size() -> u64 {
    100
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_settlement_checks_per_cycle() -> u32 {
    50
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_database_url() -> String {
    "sqlite://witness.db".to_string()
}

fn default_transfer_table_name() -> String {
    "transfers".to_string()
}

fn default_token_pair_table_name() -> String {
    "token_pairs".to_string()
}

// ============================================================================
// CONFIGURATION LOADING AND MANAGEMENT
// ============================================================================

impl Config {
    /// Loads configuration from the file named by `WITNESS_CONFIG_PATH` (if any)
    /// and `WITNESS_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new), ENV_PREFIX)
    }

    /// Loads configuration from an optional TOML file overlaid with environment
    /// variables using the given prefix, then validates it.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional config file; a missing file is skipped so env-only
    ///   deployments work
    /// * `env_prefix` - Prefix of the overriding environment variables
    ///
    /// # Returns
    ///
    /// - `Ok(Config)` - Successfully loaded and validated configuration
    /// - `Err(anyhow::Error)` - Parse failure or invalid values
    pub fn load_from(path: Option<&Path>, env_prefix: &str) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                warn!(
                    "Configuration file '{}' not found, using defaults and environment only \
                    (template: config/witness.template.toml)",
                    path.display()
                );
            }
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix(env_prefix));

        let config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Addresses and the private key are checked when the components are built;
    /// this only rejects values that can never work.
    pub fn validate(&self) -> WitnessResult<()> {
        if self.batch_size == 0 {
            return Err(WitnessError::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.interval_ms == 0 {
            return Err(WitnessError::Configuration(
                "interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.settlement_checks_per_cycle == 0 {
            return Err(WitnessError::Configuration(
                "settlement_checks_per_cycle must be greater than zero".to_string(),
            ));
        }
        check_url("client_url", &self.client_url)?;
        check_url("relayer_url", &self.relayer_url)?;
        if let Some(ref webhook) = self.alert_webhook_url {
            if !webhook.is_empty() {
                check_url("alert_webhook_url", webhook)?;
            }
        }
        if self.database_url.is_empty() {
            return Err(WitnessError::Configuration(
                "database_url must be set".to_string(),
            ));
        }
        check_table_name("transfer_table_name", &self.transfer_table_name)?;
        check_table_name("token_pair_table_name", &self.token_pair_table_name)?;
        if self.transfer_table_name == self.token_pair_table_name {
            return Err(WitnessError::Configuration(
                "transfer and token pair tables must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Confirmation depth, falling back to the chain default.
    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
            .unwrap_or_else(|| self.chain.default_confirmation_depth())
    }

    pub fn cashier_address(&self) -> WitnessResult<Address> {
        parse_address(&self.cashier_contract_address)
    }

    pub fn validator_address(&self) -> WitnessResult<Address> {
        parse_address(&self.validator_contract_address)
    }

    /// Webhook URL if alerting is configured.
    pub fn alert_webhook(&self) -> Option<&str> {
        self.alert_webhook_url
            .as_deref()
            .filter(|url| !url.is_empty())
    }
}

fn check_url(field: &str, value: &str) -> WitnessResult<()> {
    if value.is_empty() {
        return Err(WitnessError::Configuration(format!("{} must be set", field)));
    }
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| WitnessError::Configuration(format!("{} '{}' is not a URL: {}", field, value, e)))
}

// Table names are interpolated into SQL, so only plain identifiers are accepted.
fn check_table_name(field: &str, value: &str) -> WitnessResult<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(WitnessError::Configuration(format!(
            "{} '{}' must be a non-empty identifier",
            field, value
        )));
    }
    Ok(())
}
