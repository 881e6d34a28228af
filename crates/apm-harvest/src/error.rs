// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Statuses the collector is expected to recover from.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// An unexpected status returned by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct HttpError {
    pub status: u16,
    pub message: String,
    pub retryable: bool,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retryable: RETRYABLE_STATUSES.contains(&status),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == 503
    }
}

/// Failure of a single call to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("{0}")]
    Http(HttpError),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("Force restart requested: {0}")]
    ForceRestart(String),
    #[error("Force disconnect requested: {0}")]
    ForceDisconnect(String),
    #[error("Invalid license key: {0}")]
    LicenseInvalid(String),
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),
    #[error("Payload exceeds the maximum size: {0}")]
    InternalLimitExceeded(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl SendError {
    /// Whether data rejected with this error should be kept for the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Http(http) if http.is_retryable())
    }
}

impl From<HttpError> for SendError {
    fn from(error: HttpError) -> Self {
        SendError::Http(error)
    }
}

/// Failure of the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Missing the following connection parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),
    #[error("Reporting for {0} has been shut down")]
    ShutDown(String),
    #[error(transparent)]
    Send(#[from] SendError),
}
