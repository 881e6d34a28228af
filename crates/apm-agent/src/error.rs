// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_transaction::error::TransactionError;

/// Invalid or unparsable agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not parse {name}: {value}")]
    Parse { name: &'static str, value: String },
}

/// Errors that can occur when starting or stopping the agent services
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Failed to create collector client: {0}")]
    Sender(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("Agent services already stopped")]
    AlreadyStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Parse {
            name: "APM_SEGMENT_LIMIT",
            value: "many".to_string(),
        };
        assert_eq!(error.to_string(), "Could not parse APM_SEGMENT_LIMIT: many");

        let error = AgentError::from(ConfigError::Invalid("app name is empty".to_string()));
        assert_eq!(error.to_string(), "Invalid configuration: app name is empty");
    }
}
