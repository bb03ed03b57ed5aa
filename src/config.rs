//! Configuration management for the swap daemon
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub swapper: SwapperConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub network: NetworkConfig,
    pub watchdog: WatchdogConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapperConfig {
    /// Cool-down between retries of a transiently failing phase
    pub retry_interval_secs: u64,
    /// Unbounded when absent
    pub max_retries: Option<u32>,
    pub request_buffer: usize,
    pub owner_address_wait_secs: i64,
    pub swap_details_wait_secs: i64,
    pub requestor_expiry_secs: i64,
    pub responder_safety_margin_secs: i64,
}

impl Default for SwapperConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            max_retries: None,
            request_buffer: 64,
            owner_address_wait_secs: 24 * 3600,
            swap_details_wait_secs: 24 * 3600,
            requestor_expiry_secs: 48 * 3600,
            responder_safety_margin_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Signalling service shared with counterparties
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChainConfig {
    Utxo(UtxoChainConfig),
    Account(AccountChainConfig),
}

impl ChainConfig {
    pub fn priority_code(&self) -> u32 {
        match self {
            ChainConfig::Utxo(c) => c.priority_code,
            ChainConfig::Account(c) => c.priority_code,
        }
    }

    /// Environment variable holding this chain's signing key
    pub fn private_key_env(&self) -> &str {
        match self {
            ChainConfig::Utxo(c) => &c.private_key_env,
            ChainConfig::Account(c) => &c.private_key_env,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtxoChainConfig {
    pub priority_code: u32,
    pub network: bitcoin::Network,
    /// Esplora REST endpoint
    pub api_url: String,
    #[serde(default = "default_fee_sats")]
    pub fee_sats: u64,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountChainConfig {
    pub priority_code: u32,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Node gas price when absent
    pub gas_price_gwei: Option<u64>,
    /// Receipts are available as soon as the send call returns
    #[serde(default)]
    pub instant_receipts: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub private_key_env: String,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_fee_sats() -> u64 {
    10_000
}

fn default_min_confirmations() -> u32 {
    1
}

fn default_gas_limit() -> u64 {
    3_000_000
}

impl Settings {
    /// Load settings from the file named by `SWAPPER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAPPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chains.len() < 2 {
            anyhow::bail!("At least two chains must be configured");
        }

        let mut priorities = HashSet::new();
        for (name, chain) in &self.chains {
            if !priorities.insert(chain.priority_code()) {
                anyhow::bail!(
                    "Chain {} reuses priority code {}",
                    name,
                    chain.priority_code()
                );
            }
            if let ChainConfig::Account(account) = chain {
                if account.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if account.contract_address.is_empty() {
                    anyhow::bail!("Chain {} has no contract address", name);
                }
            }
        }

        if self.swapper.retry_interval_secs == 0 {
            tracing::warn!("retry_interval_secs is 0 - failing phases will spin");
        }

        Ok(())
    }

    /// Chain tags sorted by priority code
    pub fn chain_tags(&self) -> Vec<&String> {
        let mut tags: Vec<_> = self.chains.keys().collect();
        tags.sort_by_key(|tag| self.chains[*tag].priority_code());
        tags
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
