// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::metric_names::{
    DISPATCHER, OTHER_TRANSACTION, OTHER_TRANSACTION_ALL, OTHER_TRANSACTION_TOTAL_TIME,
    QUEUE_TIME, URI_WEB_TRANSACTION, WEB_TRANSACTION, WEB_TRANSACTION_TOTAL_TIME,
};
use crate::stats::TransactionStats;
use serde::Serialize;
use std::time::Duration;

/// Entry point description carried by a span that can begin a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherSpec {
    WebRequest {
        uri: String,
        queue_time: Option<Duration>,
    },
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKind {
    Web,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatcher {
    spec: DispatcherSpec,
}

impl Dispatcher {
    pub fn new(spec: DispatcherSpec) -> Self {
        Self { spec }
    }

    pub fn kind(&self) -> DispatcherKind {
        match self.spec {
            DispatcherSpec::WebRequest { .. } => DispatcherKind::Web,
            DispatcherSpec::Other => DispatcherKind::Other,
        }
    }

    pub fn is_web(&self) -> bool {
        self.kind() == DispatcherKind::Web
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.spec {
            DispatcherSpec::WebRequest { uri, .. } => Some(uri),
            DispatcherSpec::Other => None,
        }
    }

    pub fn queue_time(&self) -> Duration {
        match &self.spec {
            DispatcherSpec::WebRequest { queue_time, .. } => queue_time.unwrap_or_default(),
            DispatcherSpec::Other => Duration::ZERO,
        }
    }

    /// Name used when nothing better has been set.
    pub fn default_name(&self, root_metric_name: &str) -> String {
        match &self.spec {
            DispatcherSpec::WebRequest { uri, .. } => {
                let uri = if uri.starts_with('/') {
                    uri.clone()
                } else {
                    format!("/{uri}")
                };
                format!("{URI_WEB_TRANSACTION}{uri}")
            }
            DispatcherSpec::Other => {
                format!("{OTHER_TRANSACTION}/{}", root_metric_name.trim_start_matches('/'))
            }
        }
    }

    /// Records the transaction rollup metrics into `stats`.
    pub fn transaction_finished(
        &self,
        name: &str,
        stats: &mut TransactionStats,
        response_time: Duration,
        total_time: Duration,
    ) {
        let unscoped = stats.unscoped_mut();
        match &self.spec {
            DispatcherSpec::WebRequest { queue_time, .. } => {
                unscoped.record_response_time(name, response_time, response_time);
                unscoped.record_response_time(WEB_TRANSACTION, response_time, response_time);
                unscoped.record_response_time(DISPATCHER, response_time, response_time);
                let suffix = name.strip_prefix(WEB_TRANSACTION).unwrap_or(name);
                unscoped.record_response_time(WEB_TRANSACTION_TOTAL_TIME, total_time, total_time);
                unscoped.record_response_time(
                    &format!("{WEB_TRANSACTION_TOTAL_TIME}{suffix}"),
                    total_time,
                    total_time,
                );
                if let Some(queue_time) = queue_time.filter(|q| !q.is_zero()) {
                    unscoped.record_response_time(QUEUE_TIME, queue_time, queue_time);
                }
            }
            DispatcherSpec::Other => {
                unscoped.record_response_time(name, response_time, response_time);
                unscoped.record_response_time(OTHER_TRANSACTION_ALL, response_time, response_time);
                let suffix = name.strip_prefix(OTHER_TRANSACTION).unwrap_or(name);
                unscoped.record_response_time(OTHER_TRANSACTION_TOTAL_TIME, total_time, total_time);
                unscoped.record_response_time(
                    &format!("{OTHER_TRANSACTION_TOTAL_TIME}{suffix}"),
                    total_time,
                    total_time,
                );
            }
        }
    }
}
