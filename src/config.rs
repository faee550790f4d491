//! Configuration management for the sportsbook engine.
//! Supports environment variables and default values for runtime, odds,
//! betting and settlement parameters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub odds: OddsConfig,
    pub betting: BettingConfig,
    pub settlement: SettlementConfig,
}

/// Actor-runtime parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds an entity may sit idle before deactivation (default: 300)
    pub idle_deactivation_secs: u64,

    /// Default deadline applied to entity calls, in seconds (default: 30)
    pub call_timeout_secs: u64,

    /// Topic prefix for published domain events (default: "sportsbook")
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsConfig {
    /// Volatility window in hours (default: 1.0)
    pub volatility_window_hours: f64,

    /// Score at which a market auto-suspends (default: 50.0)
    pub volatility_suspend_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BettingConfig {
    /// House fee applied to cash-outs; user receives value * (1 - fee)
    /// (default: 0.05)
    pub cashout_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Settlement attempts per bet before compensation (default: 3)
    pub max_attempts: u32,

    /// Concurrent sagas in a batch run (default: 8)
    pub batch_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_deactivation_secs: 300,
            call_timeout_secs: 30,
            topic_prefix: "sportsbook".to_string(),
        }
    }
}

impl Default for OddsConfig {
    fn default() -> Self {
        Self { volatility_window_hours: 1.0, volatility_suspend_threshold: 50.0 }
    }
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self { cashout_fee: Decimal::new(5, 2) }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self { max_attempts: 3, batch_concurrency: 8 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            odds: OddsConfig::default(),
            betting: BettingConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(v) = env::var("ENGINE_IDLE_DEACTIVATION_SECS") {
            config.runtime.idle_deactivation_secs =
                v.parse().unwrap_or(config.runtime.idle_deactivation_secs);
        }
        if let Ok(v) = env::var("ENGINE_CALL_TIMEOUT_SECS") {
            config.runtime.call_timeout_secs =
                v.parse().unwrap_or(config.runtime.call_timeout_secs);
        }
        if let Ok(v) = env::var("EVENT_TOPIC_PREFIX") {
            if !v.is_empty() {
                config.runtime.topic_prefix = v;
            }
        }
        if let Ok(v) = env::var("ODDS_VOLATILITY_WINDOW_HOURS") {
            config.odds.volatility_window_hours =
                v.parse().unwrap_or(config.odds.volatility_window_hours);
        }
        if let Ok(v) = env::var("ODDS_VOLATILITY_SUSPEND_THRESHOLD") {
            config.odds.volatility_suspend_threshold =
                v.parse().unwrap_or(config.odds.volatility_suspend_threshold);
        }
        if let Ok(v) = env::var("BET_CASHOUT_FEE") {
            config.betting.cashout_fee =
                Decimal::from_str(&v).unwrap_or(config.betting.cashout_fee);
        }
        if let Ok(v) = env::var("SAGA_MAX_ATTEMPTS") {
            config.settlement.max_attempts = v.parse().unwrap_or(config.settlement.max_attempts);
        }
        if let Ok(v) = env::var("SETTLEMENT_BATCH_CONCURRENCY") {
            config.settlement.batch_concurrency =
                v.parse().unwrap_or(config.settlement.batch_concurrency);
        }

        config.validate();
        config
    }

    /// Clamp out-of-range values back to defaults rather than failing startup.
    fn validate(&mut self) {
        if self.runtime.idle_deactivation_secs == 0 {
            warn!("invalid idle_deactivation_secs: 0, using default");
            self.runtime.idle_deactivation_secs = 300;
        }
        if self.runtime.call_timeout_secs == 0 {
            warn!("invalid call_timeout_secs: 0, using default");
            self.runtime.call_timeout_secs = 30;
        }
        if self.odds.volatility_window_hours <= 0.0 {
            warn!(
                value = self.odds.volatility_window_hours,
                "invalid volatility_window_hours, using default"
            );
            self.odds.volatility_window_hours = 1.0;
        }
        if self.odds.volatility_suspend_threshold <= 0.0 {
            warn!(
                value = self.odds.volatility_suspend_threshold,
                "invalid volatility_suspend_threshold, using default"
            );
            self.odds.volatility_suspend_threshold = 50.0;
        }
        if self.betting.cashout_fee < Decimal::ZERO || self.betting.cashout_fee >= Decimal::ONE {
            warn!(fee = %self.betting.cashout_fee, "invalid cashout_fee, using default");
            self.betting.cashout_fee = Decimal::new(5, 2);
        }
        if self.settlement.max_attempts == 0 {
            warn!("invalid max_attempts: 0, using default");
            self.settlement.max_attempts = 3;
        }
        if self.settlement.batch_concurrency == 0 {
            warn!("invalid batch_concurrency: 0, using default");
            self.settlement.batch_concurrency = 8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.runtime.idle_deactivation_secs, 300);
        assert_eq!(config.settlement.max_attempts, 3);
        assert_eq!(config.betting.cashout_fee, Decimal::new(5, 2));
        assert_eq!(config.odds.volatility_suspend_threshold, 50.0);
    }

    #[test]
    fn validate_restores_defaults_for_nonsense() {
        let mut config = Config::default();
        config.betting.cashout_fee = Decimal::from(2);
        config.settlement.max_attempts = 0;
        config.odds.volatility_window_hours = -1.0;
        config.validate();
        assert_eq!(config.betting.cashout_fee, Decimal::new(5, 2));
        assert_eq!(config.settlement.max_attempts, 3);
        assert_eq!(config.odds.volatility_window_hours, 1.0);
    }
}
