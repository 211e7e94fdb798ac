//! Configuration module for billing-engine.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub pricing: PricingConfig,
    pub compensation: CompensationConfig,
    pub dispatcher: DispatcherConfig,
    pub consistency: ConsistencyConfig,
}

/// Fallback pricing used when a model has no effective pricing entries.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Price per 1K input tokens.
    pub default_input_price: Decimal,
    /// Price per 1K output tokens.
    pub default_output_price: Decimal,
    pub default_multiplier: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct CompensationConfig {
    pub max_attempts: u32,
    pub retry_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub charge_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    pub balance_tolerance: Decimal,
    pub look_back_hours: i64,
    pub auto_fix: bool,
    pub interval_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_input_price: dec!(0.001),
            default_output_price: dec!(0.002),
            default_multiplier: dec!(1.5),
            currency: "USD".to_string(),
        }
    }
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval_secs: 300,
        }
    }
}

impl CompensationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 1024,
            charge_timeout_secs: 30,
        }
    }
}

impl DispatcherConfig {
    pub fn charge_timeout(&self) -> Duration {
        Duration::from_secs(self.charge_timeout_secs)
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            balance_tolerance: dec!(0.00000001),
            look_back_hours: 24,
            auto_fix: false,
            interval_secs: 3600,
        }
    }
}

impl ConsistencyConfig {
    pub fn look_back(&self) -> chrono::Duration {
        chrono::Duration::hours(self.look_back_hours)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "billing-engine".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            pricing: PricingConfig::default(),
            compensation: CompensationConfig::default(),
            dispatcher: DispatcherConfig::default(),
            consistency: ConsistencyConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let pricing = PricingConfig::default();
        let compensation = CompensationConfig::default();
        let dispatcher = DispatcherConfig::default();
        let consistency = ConsistencyConfig::default();

        let config = Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "billing-engine".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            pricing: PricingConfig {
                default_input_price: env_parse("BILLING_DEFAULT_INPUT_PRICE")
                    .unwrap_or(pricing.default_input_price),
                default_output_price: env_parse("BILLING_DEFAULT_OUTPUT_PRICE")
                    .unwrap_or(pricing.default_output_price),
                default_multiplier: env_parse("BILLING_DEFAULT_MULTIPLIER")
                    .unwrap_or(pricing.default_multiplier),
                currency: env::var("BILLING_CURRENCY").unwrap_or(pricing.currency),
            },
            compensation: CompensationConfig {
                max_attempts: env_parse("BILLING_COMPENSATION_MAX_ATTEMPTS")
                    .unwrap_or(compensation.max_attempts),
                retry_interval_secs: env_parse("BILLING_COMPENSATION_RETRY_INTERVAL_SECS")
                    .unwrap_or(compensation.retry_interval_secs),
            },
            dispatcher: DispatcherConfig {
                worker_count: env_parse("BILLING_DISPATCH_WORKERS")
                    .unwrap_or(dispatcher.worker_count),
                queue_size: env_parse("BILLING_DISPATCH_QUEUE_SIZE")
                    .unwrap_or(dispatcher.queue_size),
                charge_timeout_secs: env_parse("BILLING_CHARGE_TIMEOUT_SECS")
                    .unwrap_or(dispatcher.charge_timeout_secs),
            },
            consistency: ConsistencyConfig {
                balance_tolerance: env_parse("BILLING_BALANCE_TOLERANCE")
                    .unwrap_or(consistency.balance_tolerance),
                look_back_hours: env_parse("BILLING_CONSISTENCY_LOOK_BACK_HOURS")
                    .unwrap_or(consistency.look_back_hours),
                auto_fix: env_parse("BILLING_CONSISTENCY_AUTO_FIX")
                    .unwrap_or(consistency.auto_fix),
                interval_secs: env_parse("BILLING_CONSISTENCY_INTERVAL_SECS")
                    .unwrap_or(consistency.interval_secs),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.compensation.max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_COMPENSATION_MAX_ATTEMPTS must be at least 1"
            )));
        }
        if self.dispatcher.worker_count == 0 || self.dispatcher.queue_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Dispatcher needs at least one worker and a non-empty queue"
            )));
        }
        if self.consistency.balance_tolerance.is_sign_negative() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_BALANCE_TOLERANCE must not be negative"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_gateway_pricing() {
        let config = BillingConfig::default();
        assert_eq!(config.pricing.default_input_price, dec!(0.001));
        assert_eq!(config.pricing.default_output_price, dec!(0.002));
        assert_eq!(config.pricing.default_multiplier, dec!(1.5));
        assert_eq!(config.compensation.max_attempts, 3);
        assert_eq!(config.compensation.retry_interval(), Duration::from_secs(300));
        assert_eq!(config.dispatcher.charge_timeout(), Duration::from_secs(30));
        assert_eq!(config.consistency.balance_tolerance, dec!(0.00000001));
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        env::set_var("BILLING_COMPENSATION_MAX_ATTEMPTS", "5");
        env::set_var("BILLING_DEFAULT_MULTIPLIER", "2");
        env::set_var("BILLING_DISPATCH_WORKERS", "not-a-number");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.compensation.max_attempts, 5);
        assert_eq!(config.pricing.default_multiplier, dec!(2));
        assert_eq!(config.dispatcher.worker_count, 4);

        env::remove_var("BILLING_COMPENSATION_MAX_ATTEMPTS");
        env::remove_var("BILLING_DEFAULT_MULTIPLIER");
        env::remove_var("BILLING_DISPATCH_WORKERS");
    }

    #[test]
    #[serial]
    fn zero_attempts_rejected() {
        env::set_var("BILLING_COMPENSATION_MAX_ATTEMPTS", "0");
        let result = BillingConfig::from_env();
        env::remove_var("BILLING_COMPENSATION_MAX_ATTEMPTS");
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
