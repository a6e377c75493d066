//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// `json` or `pretty`; production defaults to json
    pub log_format: Option<String>,

    /// Currency for wallets opened without one
    pub default_currency: String,

    pub bus_partitions: usize,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Attempts to find a transaction that may not be created yet
    pub not_found_retry_attempts: u32,

    /// Upper bound on one reconciliation or handler call
    pub operation_timeout: Duration,

    pub ledger_repair_interval: Duration,
    pub balance_audit_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any name -> value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());
        let log_format = lookup("LOG_FORMAT");

        let default_currency = lookup("DEFAULT_CURRENCY").unwrap_or_else(|| "USD".to_string());
        if default_currency.len() != 3 || !default_currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigError::InvalidValue("DEFAULT_CURRENCY"));
        }

        let bus_partitions: usize = parse_or(&lookup, "BUS_PARTITIONS", 8)?;
        if bus_partitions == 0 {
            return Err(ConfigError::InvalidValue("BUS_PARTITIONS"));
        }

        let retry_max_attempts: u32 = parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 5)?;
        if retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("RETRY_MAX_ATTEMPTS"));
        }

        let retry_base_delay = Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 50)?);
        let retry_max_delay = Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 2000)?);
        if retry_max_delay < retry_base_delay {
            return Err(ConfigError::InvalidValue("RETRY_MAX_DELAY_MS"));
        }

        let operation_timeout = Duration::from_millis(parse_or(&lookup, "OPERATION_TIMEOUT_MS", 5000)?);
        if operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("OPERATION_TIMEOUT_MS"));
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            host,
            port: parse_or(&lookup, "PORT", 3000)?,
            environment,
            log_format,
            default_currency,
            bus_partitions,
            retry_max_attempts,
            retry_base_delay,
            retry_max_delay,
            not_found_retry_attempts: parse_or(&lookup, "NOT_FOUND_RETRY_ATTEMPTS", 4)?,
            operation_timeout,
            ledger_repair_interval: Duration::from_secs(parse_or(
                &lookup,
                "LEDGER_REPAIR_INTERVAL_SECS",
                60,
            )?),
            balance_audit_interval: Duration::from_secs(parse_or(
                &lookup,
                "BALANCE_AUDIT_INTERVAL_SECS",
                300,
            )?),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Whether logs are emitted as JSON lines
    pub fn json_logs(&self) -> bool {
        match self.log_format.as_deref() {
            Some(format) => format.eq_ignore_ascii_case("json"),
            None => self.is_production(),
        }
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        None => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/wallets")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.bus_partitions, 8);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_base_delay, Duration::from_millis(50));
        assert_eq!(config.not_found_retry_attempts, 4);
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.balance_audit_interval, Duration::from_secs(300));
        assert_eq!(config.default_currency, "USD");
        assert!(!config.json_logs());
    }

    #[test]
    fn test_missing_database_url() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnv("DATABASE_URL"))));
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("PORT", "http", "PORT"),
            ("BUS_PARTITIONS", "0", "BUS_PARTITIONS"),
            ("DEFAULT_CURRENCY", "usd", "DEFAULT_CURRENCY"),
            ("RETRY_MAX_DELAY_MS", "10", "RETRY_MAX_DELAY_MS"),
        ];
        for (name, value, expected) in cases {
            let result = load(&[("DATABASE_URL", "postgres://x"), (name, value)]);
            match result {
                Err(ConfigError::InvalidValue(got)) => assert_eq!(got, expected),
                other => panic!("{}={} gave {:?}", name, value, other),
            }
        }
    }

    #[test]
    fn test_production_logs_json_unless_overridden() {
        let config = load(&[("DATABASE_URL", "postgres://x"), ("ENVIRONMENT", "production")]).unwrap();
        assert!(config.is_production());
        assert!(config.json_logs());

        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("ENVIRONMENT", "production"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();
        assert!(!config.json_logs());
    }
}
