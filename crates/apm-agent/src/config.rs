// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use apm_harvest::data_sender::Label;
use apm_harvest::harvest_service::{HarvestConfig, HarvestMode};
use apm_harvest::http_sender::DEFAULT_COLLECTOR_HOST;
use apm_transaction::config::TransactionConfig;
use serde::{Deserialize, Deserializer};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_APP_NAME: &str = "My Application";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodicStrategy {
    /// Milliseconds between harvests.
    pub interval: u64,
}

/// When accumulated data is harvested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Every 60 seconds after a 30 second delay, or after every transaction
    /// in serverless mode.
    #[default]
    Default,
    /// After every finished transaction.
    End,
    /// On a fixed interval in milliseconds.
    Periodically(PeriodicStrategy),
}

impl FlushStrategy {
    /// Lenient: anything unrecognised is [`FlushStrategy::Default`].
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value == "end" {
            return FlushStrategy::End;
        }
        let mut split_value = value.split(',');
        let strategy = split_value.next();
        let interval: Option<u64> = split_value.next().and_then(|v| v.trim().parse().ok());
        match (strategy, interval) {
            (Some("periodically"), Some(interval)) => {
                FlushStrategy::Periodically(PeriodicStrategy { interval })
            }
            (Some("default"), _) => FlushStrategy::Default,
            (Some(strategy), _) => {
                debug!("Invalid flush interval: {}, using default", strategy);
                FlushStrategy::Default
            }
            _ => {
                debug!("Invalid flush strategy: {}, using default", value);
                FlushStrategy::Default
            }
        }
    }
}

impl<'de> Deserialize<'de> for FlushStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(FlushStrategy::parse(&value))
    }
}

/// Agent configuration, read from `APM_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// The first name is the application's; the rest are rollups.
    pub app_names: Vec<String>,
    pub license_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub https_proxy: Option<String>,
    pub log_level: String,
    pub serverless: bool,
    pub sync_startup: bool,
    pub high_security: bool,
    pub labels: Vec<Label>,
    pub flush_strategy: FlushStrategy,
    pub transaction: TransactionConfig,
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_names: vec![DEFAULT_APP_NAME.to_string()],
            license_key: None,
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: 443,
            https_proxy: None,
            log_level: "info".to_string(),
            serverless: false,
            sync_startup: false,
            high_security: false,
            labels: Vec::new(),
            flush_strategy: FlushStrategy::Default,
            transaction: TransactionConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

fn env_value(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    env_value(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Parse { name, value })
        })
        .transpose()
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_value(name) {
        None => Ok(default),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Parse { name, value }),
        },
    }
}

fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

/// Parses `key:value` pairs separated by semicolons.
pub fn parse_labels(value: &str) -> Result<Vec<Label>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => Ok(Label {
                label_type: key.trim().to_string(),
                label_value: value.trim().to_string(),
            }),
            _ => Err(ConfigError::Parse {
                name: "APM_LABELS",
                value: pair.to_string(),
            }),
        })
        .collect()
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let app_names = env_value("APM_APP_NAME")
            .map(|names| {
                names
                    .split(';')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.app_names);
        let labels = env_value("APM_LABELS")
            .map(|labels| parse_labels(&labels))
            .transpose()?
            .unwrap_or_default();
        let flush_strategy = env_value("APM_FLUSH_STRATEGY")
            .map(|value| FlushStrategy::parse(&value.to_lowercase()))
            .unwrap_or_default();

        let tx = defaults.transaction;
        let transaction = TransactionConfig {
            max_segments: env_parse("APM_SEGMENT_LIMIT")?.unwrap_or(tx.max_segments),
            max_tokens: env_parse("APM_TOKEN_LIMIT")?.unwrap_or(tx.max_tokens),
            max_stack_traces: env_parse("APM_MAX_STACK_TRACES")?.unwrap_or(tx.max_stack_traces),
            max_explain_plans: env_parse("APM_MAX_EXPLAIN_PLANS")?
                .unwrap_or(tx.max_explain_plans),
            transaction_size_limit: env_parse::<usize>("APM_TRANSACTION_SIZE_LIMIT")?
                .map_or(tx.transaction_size_limit, |kib| kib * 1024),
            segment_timeout: env_secs("APM_SEGMENT_TIMEOUT")?.unwrap_or(tx.segment_timeout),
            token_timeout: env_secs("APM_TOKEN_TIMEOUT")?.unwrap_or(tx.token_timeout),
            ..tx
        };

        let config = Self {
            app_names,
            license_key: env_value("APM_LICENSE_KEY"),
            host: env_value("APM_HOST").unwrap_or(defaults.host),
            port: env_parse("APM_PORT")?.unwrap_or(defaults.port),
            https_proxy: env_value("APM_PROXY_HTTPS").or_else(|| env_value("HTTPS_PROXY")),
            log_level: env_value("APM_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            serverless: env_bool("APM_SERVERLESS_MODE_ENABLED", defaults.serverless)?,
            sync_startup: env_bool("APM_SYNC_STARTUP", defaults.sync_startup)?,
            high_security: env_bool("APM_HIGH_SECURITY", defaults.high_security)?,
            labels,
            flush_strategy,
            transaction,
            shutdown_timeout: defaults.shutdown_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn app_name(&self) -> &str {
        self.app_names
            .first()
            .map_or(DEFAULT_APP_NAME, String::as_str)
    }

    /// Whether data is harvested after every transaction instead of on a schedule.
    pub fn harvests_immediately(&self) -> bool {
        match self.flush_strategy {
            FlushStrategy::End => true,
            FlushStrategy::Periodically(_) => false,
            FlushStrategy::Default => self.serverless,
        }
    }

    pub fn harvest_config(&self) -> HarvestConfig {
        let defaults = HarvestConfig::default();
        if self.harvests_immediately() {
            return HarvestConfig {
                mode: HarvestMode::Serverless,
                ..defaults
            };
        }
        match self.flush_strategy {
            FlushStrategy::Periodically(PeriodicStrategy { interval }) => {
                let period = Duration::from_millis(interval);
                HarvestConfig {
                    mode: HarvestMode::Periodic,
                    initial_delay: period,
                    reporting_period: period,
                    min_harvest_interval: period.mul_f64(11.0 / 12.0),
                }
            }
            _ => defaults,
        }
    }

    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            immediate_harvest: self.harvests_immediately(),
            ..self.transaction.clone()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_names.iter().all(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "APM_APP_NAME must contain at least one name".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("APM_HOST cannot be empty".to_string()));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if let FlushStrategy::Periodically(PeriodicStrategy { interval: 0 }) = self.flush_strategy
        {
            return Err(ConfigError::Invalid(
                "APM_FLUSH_STRATEGY interval must be greater than 0".to_string(),
            ));
        }
        self.transaction
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
