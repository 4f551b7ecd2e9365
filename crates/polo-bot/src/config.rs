//! Configuration for polo-bot.
//!
//! Supports loading from a TOML file with environment variable overrides
//! for credentials and connection strings. Durations are configured in
//! whole seconds (or milliseconds where noted) and exposed as `Duration`
//! through accessors.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use polo_common::Currency;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BotConfig {
    /// Fiat-like currencies paths must start and end in.
    pub primary_currencies: Vec<Currency>,

    /// Per-currency amounts never committed to trading.
    pub fixed_reserve: HashMap<Currency, Decimal>,

    /// Smallest amount worth starting a path with; also the give-up
    /// threshold below which an unprofitable intent is unfilled instead of
    /// re-planned.
    pub min_trade_amount: Decimal,

    /// Seconds between balance ticks of the top-level trader loop.
    pub path_find_interval_secs: u64,

    /// Longest a delayed step may run before it is re-planned.
    pub profit_timeout_min: u64,

    /// Seconds between profitability checks of a running delayed step.
    pub profit_check_interval_secs: u64,

    /// Seconds a disabled market stays out of path enumeration.
    pub blacklist_ttl_secs: u64,

    /// Longest candidate chain the path finder will emit.
    pub max_path_length: usize,

    /// Instant-executor retry tuning.
    pub instant: InstantRetryConfig,

    /// Logging level: trace, debug, info, warn, error.
    pub log_level: String,

    /// Admin HTTP port; served by the ops sidecar, logged here.
    pub http_port: u16,

    /// Postgres DSN for the durability journal. Overridden by
    /// `DATABASE_URL`.
    pub database_url: Option<String>,

    /// Exchange API credentials. Overridden by `POLO_API_KEY` /
    /// `POLO_API_SECRET`.
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            primary_currencies: vec![Currency::from("USDT"), Currency::from("USDC")],
            fixed_reserve: HashMap::new(),
            min_trade_amount: Decimal::ONE,
            path_find_interval_secs: 30,
            profit_timeout_min: 40,
            profit_check_interval_secs: 2,
            blacklist_ttl_secs: 3600,
            max_path_length: 4,
            instant: InstantRetryConfig::default(),
            log_level: "info".to_string(),
            http_port: 8080,
            database_url: None,
            api_key: None,
            api_secret: None,
        }
    }
}

/// Retry tuning for the fill-or-kill instant executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstantRetryConfig {
    /// Delay after the book moved out from under a fill-or-kill order.
    pub unable_to_fill_delay_ms: u64,
    /// Delay after a transient `TransactionFailed`.
    pub transaction_failed_delay_ms: u64,
    /// Delay after `MaxOrdersExceeded`.
    pub max_orders_delay_ms: u64,
    /// Delay after a network failure.
    pub network_delay_ms: u64,
    /// Attempts before `NotEnoughCrypto` aborts the step.
    pub not_enough_crypto_retries: u32,
    /// Attempts before an empty book aborts the step.
    pub order_book_empty_retries: u32,
}

impl Default for InstantRetryConfig {
    fn default() -> Self {
        Self {
            unable_to_fill_delay_ms: 100,
            transaction_failed_delay_ms: 500,
            max_orders_delay_ms: 1500,
            network_delay_ms: 2000,
            not_enough_crypto_retries: 3,
            order_book_empty_retries: 5,
        }
    }
}

impl BotConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: BotConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply credential and connection overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(key) = std::env::var("POLO_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("POLO_API_SECRET") {
            self.api_secret = Some(secret);
        }
        if let Ok(port) = std::env::var("HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.http_port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_currencies.is_empty() {
            bail!("at least one primary currency is required");
        }
        if self.min_trade_amount <= Decimal::ZERO {
            bail!("min_trade_amount must be positive");
        }
        if self.max_path_length < 2 {
            bail!("max_path_length must be at least 2");
        }
        if self.profit_check_interval_secs == 0 {
            bail!("profit_check_interval_secs must be positive");
        }
        for (currency, reserve) in &self.fixed_reserve {
            if *reserve < Decimal::ZERO {
                bail!("fixed_reserve for {currency} must not be negative");
            }
        }
        Ok(())
    }

    pub fn path_find_interval(&self) -> Duration {
        Duration::from_secs(self.path_find_interval_secs)
    }

    pub fn profit_timeout(&self) -> Duration {
        Duration::from_secs(self.profit_timeout_min * 60)
    }

    pub fn profit_check_interval(&self) -> Duration {
        Duration::from_secs(self.profit_check_interval_secs)
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl_secs)
    }

    pub fn is_primary(&self, currency: &Currency) -> bool {
        self.primary_currencies.contains(currency)
    }

    pub fn reserve_for(&self, currency: &Currency) -> Decimal {
        self.fixed_reserve
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.profit_timeout(), Duration::from_secs(40 * 60));
        assert_eq!(config.profit_check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            primary_currencies = ["USDT"]
            min_trade_amount = "2.5"
            path_find_interval_secs = 10
            blacklist_ttl_secs = 600

            [fixed_reserve]
            USDT = "100"

            [instant]
            not_enough_crypto_retries = 5
        "#;
        let config: BotConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.primary_currencies, vec![Currency::from("USDT")]);
        assert_eq!(config.min_trade_amount, dec!(2.5));
        assert_eq!(config.reserve_for(&Currency::from("USDT")), dec!(100));
        assert_eq!(config.instant.not_enough_crypto_retries, 5);
        // Unset sections fall back to defaults.
        assert_eq!(config.instant.network_delay_ms, 2000);
        assert_eq!(config.profit_timeout_min, 40);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = "unknown_knob = 1";
        assert!(toml::from_str::<BotConfig>(raw).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BotConfig::default();
        config.primary_currencies.clear();
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.min_trade_amount = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config
            .fixed_reserve
            .insert(Currency::from("BTC"), dec!(-1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_primary() {
        let config = BotConfig::default();
        assert!(config.is_primary(&Currency::from("USDT")));
        assert!(!config.is_primary(&Currency::from("BTC")));
    }
}
