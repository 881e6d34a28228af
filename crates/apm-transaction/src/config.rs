// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransactionError;
use std::time::Duration;

pub const DEFAULT_SEGMENT_LIMIT: usize = 3000;
pub const DEFAULT_TOKEN_LIMIT: usize = 3000;
pub const DEFAULT_MAX_STACK_TRACES: usize = 20;
pub const DEFAULT_MAX_EXPLAIN_PLANS: usize = 20;
/// In bytes.
pub const DEFAULT_TRANSACTION_SIZE_LIMIT: usize = 2000 * 1024;
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Limits and timeouts applied to every transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    pub max_segments: usize,
    pub max_tokens: usize,
    pub max_stack_traces: usize,
    pub max_explain_plans: usize,
    pub transaction_size_limit: usize,
    pub segment_timeout: Duration,
    pub token_timeout: Duration,
    pub thread_cpu_time_enabled: bool,
    /// Harvest right after each transaction finishes instead of on a schedule.
    pub immediate_harvest: bool,
    pub expiration_check_interval: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_SEGMENT_LIMIT,
            max_tokens: DEFAULT_TOKEN_LIMIT,
            max_stack_traces: DEFAULT_MAX_STACK_TRACES,
            max_explain_plans: DEFAULT_MAX_EXPLAIN_PLANS,
            transaction_size_limit: DEFAULT_TRANSACTION_SIZE_LIMIT,
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
            thread_cpu_time_enabled: true,
            immediate_harvest: false,
            expiration_check_interval: DEFAULT_EXPIRATION_CHECK_INTERVAL,
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.segment_timeout.is_zero() {
            return Err(TransactionError::InvalidConfig(
                "segment_timeout must be positive".to_string(),
            ));
        }
        if self.token_timeout.is_zero() {
            return Err(TransactionError::InvalidConfig(
                "token_timeout must be positive".to_string(),
            ));
        }
        if self.expiration_check_interval.is_zero() {
            return Err(TransactionError::InvalidConfig(
                "expiration_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransactionConfig::default();
        assert_eq!(config.max_segments, 3000);
        assert_eq!(config.max_tokens, 3000);
        assert_eq!(config.transaction_size_limit, 2_048_000);
        assert_eq!(config.segment_timeout, Duration::from_secs(600));
        assert_eq!(config.token_timeout, Duration::from_secs(180));
        assert!(!config.immediate_harvest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let config = TransactionConfig {
            token_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransactionError::InvalidConfig(msg)) if msg.contains("token_timeout")
        ));

        let config = TransactionConfig {
            segment_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
