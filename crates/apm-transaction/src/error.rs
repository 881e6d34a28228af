// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::transaction::TransactionId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Invalid transaction configuration: {0}")]
    InvalidConfig(String),

    #[error("Live reference count of transaction {0} would go negative")]
    CountUnderflow(TransactionId),

    #[error("Activity {activity} is not running in transaction {transaction}")]
    UnknownActivity {
        transaction: TransactionId,
        activity: u32,
    },

    #[error("Transaction {0} could not be reported: {1}")]
    Report(TransactionId, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransactionError::InvalidConfig("token_timeout must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid transaction configuration: token_timeout must be positive"
        );

        let err = TransactionError::UnknownActivity {
            transaction: TransactionId(7),
            activity: 3,
        };
        assert_eq!(err.to_string(), "Activity 3 is not running in transaction 7");
    }
}
