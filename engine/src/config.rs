//! Configuration management for the stockpay engine.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::retry::RetryPolicy;
use crate::types::Money;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reservation, quote and ledger settings
    pub engine: EngineConfig,
    /// Payment gateway settings
    pub gateway: GatewayConfig,
    /// Background tasks and logging
    pub runtime: RuntimeConfig,
}

/// Reservation, quote and ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Basket lifetime in seconds, refreshed on every added item (default: 15 minutes)
    pub basket_ttl_secs: u64,
    /// How long a payment quote stays payable in seconds (default: 2 hours)
    pub quote_window_secs: u64,
    /// Smallest accepted balance top-up in minor units (default: 5.00)
    pub min_refill_cents: u64,
    /// How long settlement nonces are remembered in seconds (default: 24 hours)
    pub dedup_window_secs: u64,
}

/// Payment gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Retries after the first failed invoice request (default: 3)
    pub max_retries: usize,
    /// First backoff delay in milliseconds (default: 200)
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds (default: 5000)
    pub max_backoff_ms: u64,
}

/// Background tasks and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Reaper interval in seconds (default: 60)
    pub reaper_interval_secs: u64,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
    /// Log filter (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            basket_ttl_secs: 15 * 60,
            quote_window_secs: 2 * 60 * 60,
            min_refill_cents: 500,
            dedup_window_secs: 24 * 60 * 60,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: 60,
            shutdown_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            engine: EngineConfig {
                basket_ttl_secs: env_or("BASKET_TTL_SECS", defaults.engine.basket_ttl_secs),
                quote_window_secs: env_or("QUOTE_WINDOW_SECS", defaults.engine.quote_window_secs),
                min_refill_cents: env_or("MIN_REFILL_CENTS", defaults.engine.min_refill_cents),
                dedup_window_secs: env_or("DEDUP_WINDOW_SECS", defaults.engine.dedup_window_secs),
            },
            gateway: GatewayConfig {
                max_retries: env_or("GATEWAY_MAX_RETRIES", defaults.gateway.max_retries),
                initial_backoff_ms: env_or(
                    "GATEWAY_RETRY_INITIAL_MS",
                    defaults.gateway.initial_backoff_ms,
                ),
                max_backoff_ms: env_or("GATEWAY_RETRY_MAX_MS", defaults.gateway.max_backoff_ms),
            },
            runtime: RuntimeConfig {
                reaper_interval_secs: env_or(
                    "REAPER_INTERVAL_SECS",
                    defaults.runtime.reaper_interval_secs,
                ),
                shutdown_timeout_secs: env_or(
                    "SHUTDOWN_TIMEOUT_SECS",
                    defaults.runtime.shutdown_timeout_secs,
                ),
                log_level: env::var("RUST_LOG").unwrap_or(defaults.runtime.log_level),
            },
        }
    }
}

impl EngineConfig {
    /// Basket lifetime
    #[must_use]
    pub fn basket_ttl(&self) -> TimeDelta {
        seconds(self.basket_ttl_secs)
    }

    /// Quote window of a payment intent
    #[must_use]
    pub fn quote_window(&self) -> TimeDelta {
        seconds(self.quote_window_secs)
    }

    /// Settlement nonce retention
    #[must_use]
    pub fn dedup_window(&self) -> TimeDelta {
        seconds(self.dedup_window_secs)
    }

    /// Smallest accepted top-up
    #[must_use]
    pub const fn min_refill(&self) -> Money {
        Money::from_cents(self.min_refill_cents)
    }
}

impl GatewayConfig {
    /// Backoff policy for invoice requests
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .build()
    }
}

impl RuntimeConfig {
    /// Reaper tick
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Shutdown grace period
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
