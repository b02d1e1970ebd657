//! Configuration management with validation and defaults
//!
//! All monetary settings are minor currency units. Rates are basis points.
//! Values load from an optional TOML file, then `WAGER_LEDGER_*` environment
//! overrides, then validation.

use crate::errors::{ConfigurationError, LedgerResult};
use crate::money::Amount;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete ledger node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub storage: StorageConfig,
    pub cashier: CashierConfig,
    pub bonus: BonusConfig,
    pub casino: CasinoConfig,
    pub commission: CommissionConfig,
    pub matches: MatchConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Storage configuration with optimization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: usize,
    pub compression_type: CompressionType,
    /// fsync every committed unit of work
    pub sync_writes: bool,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/ledger_data".to_string(),
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            compression_type: CompressionType::Lz4,
            sync_writes: true,
            clear_on_start: false,
        }
    }
}

/// Deposit and withdrawal limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CashierConfig {
    /// Decimal places between major and minor units
    pub minor_unit_digits: u32,
    pub min_deposit: Amount,
    pub max_deposit: Amount,
    pub min_withdraw: Amount,
    pub max_withdraw: Amount,
}

impl Default for CashierConfig {
    fn default() -> Self {
        Self {
            minor_unit_digits: 2,
            min_deposit: 100_00,
            max_deposit: 25_000_00,
            min_withdraw: 500_00,
            max_withdraw: 25_000_00,
        }
    }
}

/// Bonus eligibility and wagering requirements
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusConfig {
    /// Required turnover = bonus amount * multiplier
    pub turnover_multiplier: i64,
    pub validity_days: i64,
    /// Offset of the business day from UTC, used for the daily grant cap
    pub utc_offset_minutes: i32,
    /// Share of a winning stake that still counts as turnover
    pub win_turnover_bps: i64,

    pub first_deposit_min: Amount,
    pub first_deposit_max: Amount,
    pub first_deposit_percent: i64,
    pub first_deposit_max_bonus: Amount,

    pub daily_min_amount: Amount,
    pub daily_max_amount: Amount,
    pub daily_limit: u32,

    pub referral_reward_amount: Amount,
    pub referral_min_deposit: Amount,
    pub referral_min_turnover: Amount,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            turnover_multiplier: 10,
            validity_days: 7,
            utc_offset_minutes: 0,
            win_turnover_bps: 50,

            first_deposit_min: 300_00,
            first_deposit_max: 10_000_00,
            first_deposit_percent: 100,
            first_deposit_max_bonus: 500_00,

            daily_min_amount: 5_00,
            daily_max_amount: 50_00,
            daily_limit: 2,

            referral_reward_amount: 100_00,
            referral_min_deposit: 500_00,
            referral_min_turnover: 1_000_00,
        }
    }
}

/// How a provider reports game outcomes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Provider pushes an authoritative session balance; the last snapshot wins
    Immediate,
    /// Provider streams bet/win pairs that are summed on settlement
    Batch,
}

/// Casino provider integration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CasinoConfig {
    pub provider_url: String,
    pub currency_code: String,
    pub return_url: String,
    pub callback_url: String,
    pub default_mode: SettlementMode,
    pub min_launch_balance: Amount,
    pub launch_timeout_ms: u64,
    /// Playing sessions older than this with no spins are purged on the launch error path
    pub stale_launch_secs: i64,
    /// Sessions idle longer than this are force-settled by the sweeper
    pub abandon_after_secs: i64,
    pub sweep_interval_secs: u64,
}

impl CasinoConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

impl Default for CasinoConfig {
    fn default() -> Self {
        Self {
            provider_url: "http://127.0.0.1:9000/game/launch".to_string(),
            currency_code: "BDT".to_string(),
            return_url: "http://127.0.0.1:8080/casino/return".to_string(),
            callback_url: "http://127.0.0.1:8080/casino/callback".to_string(),
            default_mode: SettlementMode::Batch,
            min_launch_balance: 10_00,
            launch_timeout_ms: 10_000,
            stale_launch_secs: 300,
            abandon_after_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Referral commission terms for sub-agents
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    pub rate_bps: i64,
    pub cooldown_days: i64,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            rate_bps: 900,
            cooldown_days: 7,
        }
    }
}

/// Peer match pot settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub fee_bps: i64,
    pub max_players: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fee_bps: 250,
            max_players: 6,
        }
    }
}

/// HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Shared secret for provider callbacks and the match engine; unset disables the check
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            api_key: None,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset
    pub log_filter: String,
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "wager_ledger=info,tower_http=info".to_string(),
            enable_metrics: true,
        }
    }
}

impl LedgerConfig {
    /// Configuration for local development: throwaway database, short sweeps
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/ledger_dev".to_string(),
                sync_writes: false,
                clear_on_start: true,
                ..Default::default()
            },
            casino: CasinoConfig {
                sweep_interval_secs: 10,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_filter: "wager_ledger=debug,tower_http=debug".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configuration for production deployment with persistence
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                write_buffer_size_mb: 128,
                max_write_buffer_number: 6,
                sync_writes: true,
                clear_on_start: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired(
                "storage.data_directory".to_string(),
            ));
        }

        let c = &self.cashier;
        if c.minor_unit_digits > 6 {
            return Err(invalid("cashier.minor_unit_digits", c.minor_unit_digits, "at most 6"));
        }
        if c.min_deposit <= 0 || c.max_deposit < c.min_deposit {
            return Err(invalid("cashier.max_deposit", c.max_deposit, "must be >= min_deposit > 0"));
        }
        if c.min_withdraw <= 0 || c.max_withdraw < c.min_withdraw {
            return Err(invalid("cashier.max_withdraw", c.max_withdraw, "must be >= min_withdraw > 0"));
        }

        let b = &self.bonus;
        if b.turnover_multiplier < 1 {
            return Err(invalid("bonus.turnover_multiplier", b.turnover_multiplier, "must be >= 1"));
        }
        if b.validity_days < 1 {
            return Err(invalid("bonus.validity_days", b.validity_days, "must be >= 1"));
        }
        if !(0..=BASIS_POINTS_MAX).contains(&b.win_turnover_bps) {
            return Err(invalid("bonus.win_turnover_bps", b.win_turnover_bps, "must be within 0..=10000"));
        }
        if b.first_deposit_max < b.first_deposit_min {
            return Err(invalid("bonus.first_deposit_max", b.first_deposit_max, "must be >= first_deposit_min"));
        }
        if b.daily_min_amount <= 0 || b.daily_max_amount < b.daily_min_amount {
            return Err(invalid("bonus.daily_max_amount", b.daily_max_amount, "must be >= daily_min_amount > 0"));
        }
        if b.referral_reward_amount <= 0 {
            return Err(invalid("bonus.referral_reward_amount", b.referral_reward_amount, "must be > 0"));
        }

        if self.casino.launch_timeout_ms == 0 {
            return Err(invalid("casino.launch_timeout_ms", 0, "must be > 0"));
        }
        if self.casino.abandon_after_secs < self.casino.stale_launch_secs {
            return Err(ConfigurationError::ValidationFailed(
                "casino.abandon_after_secs must not be shorter than stale_launch_secs".to_string(),
            ));
        }

        if !(0..=BASIS_POINTS_MAX).contains(&self.commission.rate_bps) {
            return Err(invalid("commission.rate_bps", self.commission.rate_bps, "must be within 0..=10000"));
        }
        if !(0..BASIS_POINTS_MAX).contains(&self.matches.fee_bps) {
            return Err(invalid("matches.fee_bps", self.matches.fee_bps, "must be within 0..10000"));
        }
        if self.matches.max_players < 2 {
            return Err(invalid("matches.max_players", self.matches.max_players, "must be >= 2"));
        }

        if self.api.port == 0 {
            return Err(invalid("api.port", 0, "port cannot be zero"));
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.casino.sweep_interval_secs.max(1))
    }
}

const BASIS_POINTS_MAX: i64 = crate::money::BASIS_POINTS;

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> LedgerResult<LedgerConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => LedgerConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> LedgerResult<LedgerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into()
        })
    }

    fn apply_env_overrides(&self, config: &mut LedgerConfig) -> LedgerResult<()> {
        if let Ok(dir) = env::var("WAGER_LEDGER_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(host) = env::var("WAGER_LEDGER_API_HOST") {
            config.api.host = host;
        }
        if let Ok(port) = env::var("WAGER_LEDGER_API_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "WAGER_LEDGER_API_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(key) = env::var("WAGER_LEDGER_API_KEY") {
            config.api.api_key = Some(key);
        }
        if let Ok(url) = env::var("WAGER_LEDGER_PROVIDER_URL") {
            config.casino.provider_url = url;
        }
        if let Ok(timeout) = env::var("WAGER_LEDGER_LAUNCH_TIMEOUT_MS") {
            config.casino.launch_timeout_ms =
                timeout.parse().map_err(|_| ConfigurationError::InvalidValue {
                    field: "WAGER_LEDGER_LAUNCH_TIMEOUT_MS".to_string(),
                    value: timeout,
                    reason: "Invalid timeout value".to_string(),
                })?;
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &LedgerConfig, path: &str) -> LedgerResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}
