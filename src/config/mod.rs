use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "vaultwatch.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint - overridden by env RPC_URL
    #[serde(default)]
    pub rpc_url: String,
    /// Vault factory contract - overridden by env FACTORY_ADDRESS
    #[serde(default)]
    pub factory_address: String,
    /// Hub contract used to resolve deposit-token metadata - overridden by env HUB_ADDRESS
    #[serde(default)]
    pub hub_address: String,
    /// Explicit backfill start height. When unset, backfill covers
    /// `monitor.backfill_window_blocks` below the head.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Maximum block span per eth_getLogs request.
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Height advance between full-status sweeps.
    #[serde(default = "default_sweep_interval_blocks")]
    pub sweep_interval_blocks: u64,
    /// Cold-start backfill window (~two weeks of blocks).
    #[serde(default = "default_backfill_window_blocks")]
    pub backfill_window_blocks: u64,
    /// Utilization percentage at or above which a vault counts as filled.
    #[serde(default = "default_fill_threshold_pct")]
    pub fill_threshold_pct: f64,
    /// Vaults inspected concurrently per sweep batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Telegram bot token - loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub telegram_bot_token: String,
    /// Telegram chat id - loaded from env TELEGRAM_CHAT_ID
    #[serde(default)]
    pub telegram_chat_id: String,
    /// Optional JSON-lines file sink.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_true")]
    pub startup_message: bool,
    /// Answer `/vaults` commands in the configured chat.
    #[serde(default = "default_true")]
    pub commands: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// HTTP bind address for the live-vault API. Empty disables it.
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_chunk_size() -> u64 {
    10_000
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_sweep_interval_blocks() -> u64 {
    120
}
fn default_backfill_window_blocks() -> u64 {
    100_800
}
fn default_fill_threshold_pct() -> f64 {
    98.0
}
fn default_batch_size() -> usize {
    5
}
fn default_state_path() -> String {
    "vaultwatch-state.json".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    30
}
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            factory_address: String::new(),
            hub_address: String::new(),
            start_block: None,
            log_chunk_size: default_log_chunk_size(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            sweep_interval_blocks: default_sweep_interval_blocks(),
            backfill_window_blocks: default_backfill_window_blocks(),
            fill_threshold_pct: default_fill_threshold_pct(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            file_path: None,
            startup_message: true,
            commands: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl QueryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Load `$VAULTWATCH_CONFIG` (default `vaultwatch.toml`) if it exists,
    /// otherwise fall back to environment-only config.
    pub fn discover() -> Result<Self, ConfigError> {
        let path = std::env::var("VAULTWATCH_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::from_env())
        }
    }

    /// Config with defaults everywhere, populated from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Config {
            chain: ChainConfig::default(),
            monitor: MonitorConfig::default(),
            state: StateConfig::default(),
            notify: NotifyConfig::default(),
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.apply_env();
        config
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env(&mut self) {
        // Secrets and endpoints come from the environment when present
        if let Ok(url) = std::env::var("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(addr) = std::env::var("FACTORY_ADDRESS") {
            self.chain.factory_address = addr;
        }
        if let Ok(addr) = std::env::var("HUB_ADDRESS") {
            self.chain.hub_address = addr;
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.notify.telegram_bot_token = token;
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notify.telegram_chat_id = chat;
        }
        if let Ok(path) = std::env::var("STATE_PATH") {
            self.state.path = path;
        }
    }

    /// Check required settings and return the parsed contract addresses
    /// as `(factory, hub)`.
    pub fn validate(&self) -> Result<(Address, Address), ConfigError> {
        if self.chain.rpc_url.is_empty() {
            return Err(ConfigError::Missing("chain.rpc_url / RPC_URL".to_string()));
        }
        let pct = self.monitor.fill_threshold_pct;
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(ConfigError::Invalid {
                field: "monitor.fill_threshold_pct".to_string(),
                reason: format!("{pct} is outside (0, 100]"),
            });
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.poll_interval_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let factory = parse_address("chain.factory_address", &self.chain.factory_address)?;
        let hub = parse_address("chain.hub_address", &self.chain.hub_address)?;
        Ok((factory, hub))
    }

    pub fn has_telegram(&self) -> bool {
        !self.notify.telegram_bot_token.is_empty() && !self.notify.telegram_chat_id.is_empty()
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Missing(field.to_string()));
    }
    Address::from_str(value.trim()).map_err(|_| ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse(
            r#"
            [chain]
            rpc_url = "http://localhost:8545"
            factory_address = "0x1111111111111111111111111111111111111111"
            hub_address = "0x2222222222222222222222222222222222222222"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.sweep_interval_blocks, 120);
        assert_eq!(config.monitor.backfill_window_blocks, 100_800);
        assert_eq!(config.monitor.batch_size, 5);
        assert_eq!(config.monitor.fill_threshold_pct, 98.0);
        assert_eq!(config.query.cache_ttl_secs, 30);
        assert_eq!(config.chain.log_chunk_size, 10_000);
        assert!(config.chain.start_block.is_none());

        let (factory, hub) = config.validate().unwrap();
        assert_ne!(factory, hub);
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = Config::parse(
            r#"
            [chain]
            rpc_url = "http://localhost:8545"
            factory_address = "not-an-address"
            hub_address = "0x2222222222222222222222222222222222222222"
            "#,
        )
        .unwrap();

        match config.validate() {
            Err(ConfigError::InvalidAddress { field, .. }) => {
                assert_eq!(field, "chain.factory_address")
            }
            other => panic!("expected InvalidAddress, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_settings() {
        let base = r#"
            [chain]
            rpc_url = "http://localhost:8545"
            factory_address = "0x1111111111111111111111111111111111111111"
            hub_address = "0x2222222222222222222222222222222222222222"
        "#;
        for (section, field) in [
            ("fill_threshold_pct = 0.0", "monitor.fill_threshold_pct"),
            ("fill_threshold_pct = 120.0", "monitor.fill_threshold_pct"),
            ("poll_interval_secs = 0", "monitor.poll_interval_secs"),
        ] {
            let config = Config::parse(&format!("{base}\n[monitor]\n{section}\n")).unwrap();
            match config.validate() {
                Err(ConfigError::Invalid { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected Invalid for {section}, got {:?}", other),
            }
        }

        let config = Config::parse(&format!("{base}\n[monitor]\nfill_threshold_pct = 100.0\n")).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_rpc_url() {
        let config = Config::parse("").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }
}
