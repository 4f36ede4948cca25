use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub ledger: LedgerConfig,
    pub settlement: SettlementConfig,
    pub claims: ClaimsConfig,
    pub notification_webhook_url: Option<String>,
}

/// External ledger connection and the admin signing identity
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub admin_private_key: String,
    pub dispatch_contract: String,
}

/// Settlement engine tuning
#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_batch_size: usize,
    pub concurrency: usize,
    pub max_retries: i32,
    pub retry_base_delay_secs: i64,
    pub processing_timeout_secs: i64,
    pub cycle_deadline_secs: u64,
    pub gas_per_recipient: u64,
    pub base_gas: u64,
    pub balance_safety_percent: u64,
    pub confirm_initial_secs: u64,
    pub confirm_attempts: u32,
    pub reconcile_lookback_blocks: u64,
    pub reconcile_claim_limit: i64,
    pub refund_batch_limit: i64,
    pub nonce_abandon_after_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClaimsConfig {
    pub max_in_flight_per_user: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_batch_size: 50,
            concurrency: 3,
            max_retries: 3,
            retry_base_delay_secs: 60,
            processing_timeout_secs: 1800,
            cycle_deadline_secs: 900,
            gas_per_recipient: 65_000,
            base_gas: 50_000,
            balance_safety_percent: 80,
            confirm_initial_secs: 10,
            confirm_attempts: 5,
            reconcile_lookback_blocks: 2000,
            reconcile_claim_limit: 100,
            refund_batch_limit: 100,
            nonce_abandon_after_secs: 3600,
        }
    }
}

impl SettlementConfig {
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn confirm_initial_interval(&self) -> Duration {
        Duration::from_secs(self.confirm_initial_secs)
    }

    pub fn nonce_abandon_after(&self) -> Duration {
        Duration::from_secs(self.nonce_abandon_after_secs)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SettlementConfig::default();

        let settlement = SettlementConfig {
            enabled: env_or("SETTLEMENT_ENABLED", defaults.enabled)?,
            interval_secs: env_or("SETTLEMENT_INTERVAL_SECS", defaults.interval_secs)?,
            max_batch_size: env_or("SETTLEMENT_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            concurrency: env_or("SETTLEMENT_CONCURRENCY", defaults.concurrency)?,
            max_retries: env_or("SETTLEMENT_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_secs: env_or(
                "SETTLEMENT_RETRY_BASE_DELAY_SECS",
                defaults.retry_base_delay_secs,
            )?,
            processing_timeout_secs: env_or(
                "SETTLEMENT_PROCESSING_TIMEOUT_SECS",
                defaults.processing_timeout_secs,
            )?,
            cycle_deadline_secs: env_or(
                "SETTLEMENT_CYCLE_DEADLINE_SECS",
                defaults.cycle_deadline_secs,
            )?,
            gas_per_recipient: env_or("SETTLEMENT_GAS_PER_RECIPIENT", defaults.gas_per_recipient)?,
            base_gas: env_or("SETTLEMENT_BASE_GAS", defaults.base_gas)?,
            balance_safety_percent: env_or(
                "SETTLEMENT_BALANCE_SAFETY_PERCENT",
                defaults.balance_safety_percent,
            )?,
            confirm_initial_secs: env_or(
                "SETTLEMENT_CONFIRM_INITIAL_SECS",
                defaults.confirm_initial_secs,
            )?,
            confirm_attempts: env_or("SETTLEMENT_CONFIRM_ATTEMPTS", defaults.confirm_attempts)?,
            reconcile_lookback_blocks: env_or(
                "SETTLEMENT_RECONCILE_LOOKBACK_BLOCKS",
                defaults.reconcile_lookback_blocks,
            )?,
            reconcile_claim_limit: env_or(
                "SETTLEMENT_RECONCILE_CLAIM_LIMIT",
                defaults.reconcile_claim_limit,
            )?,
            refund_batch_limit: env_or(
                "SETTLEMENT_REFUND_BATCH_LIMIT",
                defaults.refund_batch_limit,
            )?,
            nonce_abandon_after_secs: env_or(
                "SETTLEMENT_NONCE_ABANDON_AFTER_SECS",
                defaults.nonce_abandon_after_secs,
            )?,
        };
        settlement.validate()?;

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/rewards".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            ledger: LedgerConfig {
                rpc_url: std::env::var("LEDGER_RPC_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
                admin_private_key: std::env::var("ADMIN_PRIVATE_KEY")
                    .map_err(|_| ConfigError::NotFound("ADMIN_PRIVATE_KEY".to_string()))?,
                dispatch_contract: std::env::var("DISPATCH_CONTRACT_ADDRESS").map_err(|_| {
                    ConfigError::NotFound("DISPATCH_CONTRACT_ADDRESS".to_string())
                })?,
            },
            settlement,
            claims: ClaimsConfig {
                max_in_flight_per_user: env_or("CLAIMS_MAX_IN_FLIGHT_PER_USER", 3)?,
            },
            notification_webhook_url: std::env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

impl SettlementConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "SETTLEMENT_MAX_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Message(
                "SETTLEMENT_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.balance_safety_percent == 0 || self.balance_safety_percent > 100 {
            return Err(ConfigError::Message(
                "SETTLEMENT_BALANCE_SAFETY_PERCENT must be within 1..=100".to_string(),
            ));
        }
        if self.confirm_attempts == 0 {
            return Err(ConfigError::Message(
                "SETTLEMENT_CONFIRM_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Message(format!("{}: {}", key, e))),
        _ => Ok(default),
    }
}
