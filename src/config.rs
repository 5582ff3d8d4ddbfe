//! Configuration management for the bridge orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{BridgeError, BridgeResult};
use crate::transfer::parse_amount;

use ethers::types::U256;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: Option<DatabaseConfig>,
    pub chains: ChainsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub instance_id: String,
    /// Reconciliation cadence per direction
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Status aggregation cadence
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Recoverable failures tolerated before a transfer is failed
    pub max_retries: u32,
    /// Upper bound on any single chain adapter call
    pub adapter_timeout_ms: u64,
    /// Reconciliation attempts running at once per direction
    #[serde(default = "default_max_concurrent_attempts")]
    pub max_concurrent_attempts: usize,
    /// Ceiling on any fee the bridge subsidises (decimal string)
    pub max_fee_subsidy: String,
    /// Fee recorded on direct transfer requests (decimal string)
    #[serde(default = "default_fee")]
    pub default_fee: String,
    /// Capacity of the chain event channel feeding the ingestor
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Delay before a failed chain subscription is restarted
    #[serde(default = "default_listener_restart")]
    pub listener_restart_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_status_interval() -> u64 {
    300
}

fn default_max_concurrent_attempts() -> usize {
    16
}

fn default_fee() -> String {
    "0".to_string()
}

fn default_event_buffer() -> usize {
    10_000
}

fn default_listener_restart() -> u64 {
    5
}

impl OrchestratorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn listener_restart(&self) -> Duration {
        Duration::from_secs(self.listener_restart_secs)
    }

    /// Maximum fee subsidy as an integer
    pub fn max_fee(&self) -> BridgeResult<U256> {
        parse_amount(&self.max_fee_subsidy).ok_or_else(|| {
            BridgeError::Config(format!(
                "max_fee_subsidy {:?} is not an unsigned integer",
                self.max_fee_subsidy
            ))
        })
    }

    /// Default direct-transfer fee as an integer
    pub fn default_fee(&self) -> BridgeResult<U256> {
        parse_amount(&self.default_fee).ok_or_else(|| {
            BridgeError::Config(format!(
                "default_fee {:?} is not an unsigned integer",
                self.default_fee
            ))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainsConfig {
    pub ethereum: EthereumConfig,
    pub aleo: AleoConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    pub network: String,
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    pub token_address: String,
    pub confirmation_blocks: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum block span per log query
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// First block to scan; defaults to the head at startup
    pub start_block: Option<u64>,
    /// Name of the environment variable holding the operator key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AleoConfig {
    pub network: String,
    pub gateway_url: String,
    pub bridge_program_id: String,
    pub token_program_id: String,
    pub confirmation_blocks: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    pub start_height: Option<u64>,
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_max_block_range() -> u64 {
    1_000
}

impl Settings {
    /// Load settings from the file named by `BRIDGE_CONFIG`
    pub fn load() -> BridgeResult<Self> {
        let config_path = env::var("BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> BridgeResult<Self> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(raw: &str) -> BridgeResult<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw)?;

        let settings: Settings = toml::from_str(&config_str)
            .map_err(|e| BridgeError::Config(format!("Failed to parse configuration: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> BridgeResult<()> {
        let orchestrator = &self.orchestrator;
        if orchestrator.reconcile_interval_secs == 0 || orchestrator.status_interval_secs == 0 {
            return Err(BridgeError::Config(
                "reconcile and status intervals must be non-zero".to_string(),
            ));
        }
        if orchestrator.adapter_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "adapter_timeout_ms must be non-zero".to_string(),
            ));
        }
        if orchestrator.max_concurrent_attempts == 0 || orchestrator.event_buffer == 0 {
            return Err(BridgeError::Config(
                "max_concurrent_attempts and event_buffer must be non-zero".to_string(),
            ));
        }
        orchestrator.max_fee()?;
        orchestrator.default_fee()?;

        let ethereum = &self.chains.ethereum;
        if ethereum.rpc_urls.iter().all(|url| url.trim().is_empty()) {
            return Err(BridgeError::Config(
                "Ethereum has no RPC URLs configured".to_string(),
            ));
        }
        if ethereum.bridge_address.is_empty() || ethereum.token_address.is_empty() {
            return Err(BridgeError::Config(
                "Ethereum bridge and token addresses are required".to_string(),
            ));
        }
        if ethereum.max_block_range == 0 {
            return Err(BridgeError::Config(
                "Ethereum max_block_range must be non-zero".to_string(),
            ));
        }

        let aleo = &self.chains.aleo;
        if aleo.gateway_url.trim().is_empty() {
            return Err(BridgeError::Config(
                "Aleo gateway URL is not configured".to_string(),
            ));
        }
        if aleo.bridge_program_id.is_empty() {
            return Err(BridgeError::Config(
                "Aleo bridge program id is required".to_string(),
            ));
        }

        if let Some(database) = &self.database {
            if database.url.is_empty() {
                return Err(BridgeError::Config("Database URL is empty".to_string()));
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> BridgeResult<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| BridgeError::Internal(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
