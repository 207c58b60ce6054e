use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    pub capital: CapitalConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// REST API endpoint for order placement and queries
    pub rest_url: String,
    /// Timeout applied to every broker call (milliseconds)
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_broker_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Interval between status-verifier poll cycles (seconds)
    #[serde(default = "default_verify_interval")]
    pub verify_interval_secs: u64,
    /// Grace period before an unacknowledged placement counts as failed (seconds)
    #[serde(default = "default_placement_grace")]
    pub placement_grace_secs: u64,
    /// Age after which a non-terminal order is considered stale (hours)
    #[serde(default = "default_stale_after")]
    pub stale_after_hours: u64,
    /// Retention window for terminal orders before archival (days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_verify_interval() -> u64 {
    1800 // 30 minutes
}

fn default_placement_grace() -> u64 {
    120
}

fn default_stale_after() -> u64 {
    24
}

fn default_retention_days() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_interval_secs: default_verify_interval(),
            placement_grace_secs: default_placement_grace(),
            stale_after_hours: default_stale_after(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    /// Capital allocated per trade; quantity is recomputed from this and the
    /// current quote on every retry
    pub per_trade: Decimal,
}

/// Trading session boundaries used for expiry math
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Session open, "HH:MM" (exchange local time, stored as UTC here)
    #[serde(default = "default_session_open")]
    pub open: String,
    /// Session close, "HH:MM"
    #[serde(default = "default_session_close")]
    pub close: String,
}

fn default_session_open() -> String {
    "09:15".to_string()
}

fn default_session_close() -> String {
    "15:30".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: default_session_open(),
            close: default_session_close(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Enable dry run mode (simulated broker, in-memory store)
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationConfig {
    /// Webhook URL for lifecycle notifications (disabled when unset)
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files (stdout only when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("engine.verify_interval_secs", 1800)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("STEWARD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (STEWARD_BROKER__REST_URL, etc.)
            .add_source(
                Environment::with_prefix("STEWARD")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.capital.per_trade <= Decimal::ZERO {
            errors.push("capital.per_trade must be positive".to_string());
        }

        if self.engine.verify_interval_secs == 0 {
            errors.push("engine.verify_interval_secs must be positive".to_string());
        }

        if self.engine.stale_after_hours == 0 {
            errors.push("engine.stale_after_hours must be positive".to_string());
        }

        if crate::hours::parse_session_time(&self.session.open).is_none() {
            errors.push(format!("session.open is not HH:MM: {}", self.session.open));
        }

        if crate::hours::parse_session_time(&self.session.close).is_none() {
            errors.push(format!("session.close is not HH:MM: {}", self.session.close));
        }

        if self.broker.timeout_ms == 0 {
            errors.push("broker.timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> AppConfig {
        AppConfig {
            broker: BrokerConfig {
                rest_url: "https://broker.example.com/api".to_string(),
                timeout_ms: 10_000,
            },
            engine: EngineConfig::default(),
            capital: CapitalConfig {
                per_trade: dec!(25000),
            },
            session: SessionConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/steward".to_string(),
                max_connections: 5,
            },
            dry_run: DryRunConfig { enabled: true },
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_capital() {
        let mut config = base_config();
        config.capital.per_trade = dec!(0);
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("per_trade")));
    }

    #[test]
    fn test_rejects_bad_session_time() {
        let mut config = base_config();
        config.session.close = "half past three".to_string();
        assert!(config.validate().is_err());
    }
}
