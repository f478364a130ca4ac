use std::collections::HashMap;
use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".into(), "ETHUSDT".into(), "BNBUSDT".into()]
}

fn default_large_order_window_minutes() -> u64 {
    5
}

fn default_large_order_threshold_usd() -> f64 {
    2_000_000.0
}

fn default_large_order_cooldown_minutes() -> u64 {
    10
}

fn default_single_thresholds() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("BTCUSDT".into(), 50.0);
    m.insert("ETHUSDT".into(), 2000.0);
    m
}

fn default_taker_cumulative_window_seconds() -> u64 {
    60
}

fn default_taker_cumulative_threshold_usd() -> f64 {
    1_000_000.0
}

fn default_taker_cumulative_min_orders() -> usize {
    5
}

fn default_taker_cooldown_single() -> u64 {
    60
}

fn default_taker_cooldown_cumulative() -> u64 {
    300
}

fn default_rate_limit_per_minute() -> usize {
    12
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_base_backoff_seconds() -> u64 {
    2
}

fn default_max_backoff_seconds() -> u64 {
    300
}

fn default_critical_threshold() -> u32 {
    3
}

fn default_price_cache_ttl_seconds() -> u64 {
    60
}

fn default_sink_retry_delay_seconds() -> u64 {
    10
}

fn default_shutdown_drain_seconds() -> u64 {
    5
}

fn default_binance_rest_base_url() -> String {
    "https://api.binance.com".into()
}

/// Top-level configuration, loaded from TOML. Every field that spec.md §6
/// gives a default gets a `#[serde(default = "...")]` matching that value,
/// mirroring the teacher's `AppConfig`/`GeneralConfig` pattern.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub large_order: LargeOrderConfig,
    #[serde(default)]
    pub taker: TakerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub recovery: RecoveryConfigToml,
    #[serde(default)]
    pub price_cache: PriceCacheConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_binance_rest_base_url")]
    pub binance_rest_base_url: String,
    #[serde(default)]
    pub archive_enabled: bool,
    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
            binance_rest_base_url: default_binance_rest_base_url(),
            archive_enabled: false,
            shutdown_drain_seconds: default_shutdown_drain_seconds(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LargeOrderConfig {
    #[serde(default = "default_large_order_window_minutes")]
    pub window_minutes: u64,
    #[serde(default = "default_large_order_threshold_usd")]
    pub threshold_usd: f64,
    #[serde(default = "default_large_order_cooldown_minutes")]
    pub cooldown_minutes: u64,
    /// When empty, every configured symbol is monitored.
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for LargeOrderConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_large_order_window_minutes(),
            threshold_usd: default_large_order_threshold_usd(),
            cooldown_minutes: default_large_order_cooldown_minutes(),
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TakerConfig {
    #[serde(default = "default_single_thresholds")]
    pub single_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub cumulative: TakerCumulativeConfig,
    #[serde(default)]
    pub cooldown: TakerCooldownConfig,
}

impl Default for TakerConfig {
    fn default() -> Self {
        Self {
            single_thresholds: default_single_thresholds(),
            cumulative: TakerCumulativeConfig::default(),
            cooldown: TakerCooldownConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TakerCumulativeConfig {
    #[serde(default = "default_taker_cumulative_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_taker_cumulative_threshold_usd")]
    pub threshold_usd: f64,
    #[serde(default = "default_taker_cumulative_min_orders")]
    pub min_orders: usize,
}

impl Default for TakerCumulativeConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_taker_cumulative_window_seconds(),
            threshold_usd: default_taker_cumulative_threshold_usd(),
            min_orders: default_taker_cumulative_min_orders(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TakerCooldownConfig {
    #[serde(default = "default_taker_cooldown_single")]
    pub single: u64,
    #[serde(default = "default_taker_cooldown_cumulative")]
    pub cumulative: u64,
}

impl Default for TakerCooldownConfig {
    fn default() -> Self {
        Self {
            single: default_taker_cooldown_single(),
            cumulative: default_taker_cooldown_cumulative(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,
    #[serde(default = "default_sink_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub reset_on_dispatch: bool,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit_per_minute(),
            retry_delay_seconds: default_sink_retry_delay_seconds(),
            reset_on_dispatch: true,
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecoveryConfigToml {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_base_backoff_seconds")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,
}

impl Default for RecoveryConfigToml {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_backoff_seconds: default_base_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceCacheConfig {
    #[serde(default = "default_price_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_price_cache_ttl_seconds(),
        }
    }
}

pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_symbols_non_empty(config)?;
    validate_windows_non_zero(config)?;
    validate_thresholds_positive(config)?;
    Ok(())
}

fn validate_symbols_non_empty(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.symbols.is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "symbols: at least one monitored symbol is required".into(),
        }));
    }
    Ok(())
}

/// "A window of 0 is rejected" (spec.md boundary behaviour).
fn validate_windows_non_zero(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.large_order.window_minutes == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "large_order.window_minutes must be > 0".into(),
        }));
    }
    if config.taker.cumulative.window_seconds == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "taker.cumulative.window_seconds must be > 0".into(),
        }));
    }
    Ok(())
}

fn validate_thresholds_positive(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.large_order.threshold_usd <= 0.0 {
        return Err(Report::new(ConfigError::Validation {
            field: "large_order.threshold_usd must be > 0".into(),
        }));
    }
    if config.taker.cumulative.threshold_usd <= 0.0 {
        return Err(Report::new(ConfigError::Validation {
            field: "taker.cumulative.threshold_usd must be > 0".into(),
        }));
    }
    for (symbol, threshold) in &config.taker.single_thresholds {
        if *threshold <= 0.0 {
            return Err(Report::new(ConfigError::Validation {
                field: format!("taker.single_thresholds[{symbol}] must be > 0"),
            }));
        }
    }
    Ok(())
}
