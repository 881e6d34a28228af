// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted collector used in place of the HTTP sender

use apm_harvest::data_sender::{DataSender, Event, ServerConfig, StartupOptions};
use apm_harvest::error::SendError;
use apm_transaction::stats::MetricData;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const CONNECT: &str = "connect";
pub const METRIC_DATA: &str = "metric_data";
pub const ERROR_DATA: &str = "error_data";
pub const TRANSACTION_SAMPLE_DATA: &str = "transaction_sample_data";
pub const SQL_TRACE_DATA: &str = "sql_trace_data";
pub const SHUTDOWN: &str = "shutdown";

/// One request received by the mock collector.
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum Call {
    Connect(StartupOptions),
    MetricData { names: Vec<String>, counts: Vec<u64> },
    Events {
        endpoint: &'static str,
        reservoir_size: usize,
        seen: usize,
        count: usize,
    },
    Items { method: &'static str, count: usize },
    CommitAndFlush,
    Shutdown,
}

impl Call {
    fn method(&self) -> &'static str {
        match self {
            Call::Connect(_) => CONNECT,
            Call::MetricData { .. } => METRIC_DATA,
            Call::Events { endpoint, .. } => endpoint,
            Call::Items { method, .. } => method,
            Call::CommitAndFlush => "commit_and_flush",
            Call::Shutdown => SHUTDOWN,
        }
    }
}

/// Answers every request with the next scripted result for its method,
/// or with success once the script for that method runs out.
#[derive(Default)]
pub struct MockDataSender {
    calls: Mutex<Vec<Call>>,
    connect_results: Mutex<VecDeque<Result<ServerConfig, SendError>>>,
    results: Mutex<HashMap<&'static str, VecDeque<Result<(), SendError>>>>,
    server_config: Mutex<Option<ServerConfig>>,
}

#[allow(dead_code)]
impl MockDataSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_config(config: ServerConfig) -> Self {
        let sender = Self::default();
        *sender.server_config.lock().unwrap() = Some(config);
        sender
    }

    pub fn script(&self, method: &'static str, result: Result<(), SendError>) {
        self.results
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(result);
    }

    pub fn script_connect(&self, result: Result<ServerConfig, SendError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method() == method)
            .count()
    }

    /// Batch sizes received on an event endpoint, in order.
    pub fn event_counts(&self, endpoint: &str) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::Events {
                    endpoint: e, count, ..
                } if *e == endpoint => Some(*count),
                _ => None,
            })
            .collect()
    }

    pub fn metric_names(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::MetricData { names, .. } => Some(names.clone()),
                _ => None,
            })
            .collect()
    }

    /// Call count of metric `name` in each metric post, 0 where it was absent.
    pub fn metric_call_counts(&self, name: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                Call::MetricData { names, counts } => Some(
                    names
                        .iter()
                        .zip(counts)
                        .filter(|(metric, _)| metric.as_str() == name)
                        .map(|(_, count)| *count)
                        .sum(),
                ),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) -> Result<(), SendError> {
        let method = call.method();
        self.calls.lock().unwrap().push(call);
        self.results
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait::async_trait]
impl DataSender for MockDataSender {
    async fn connect(&self, options: &StartupOptions) -> Result<ServerConfig, SendError> {
        self.calls.lock().unwrap().push(Call::Connect(options.clone()));
        if let Some(result) = self.connect_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(self
            .server_config
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(super::helpers::server_config))
    }

    async fn send_metric_data(
        &self,
        _begin_ms: u64,
        _end_ms: u64,
        data: &[MetricData],
    ) -> Result<(), SendError> {
        self.record(Call::MetricData {
            names: data.iter().map(|metric| metric.name.to_string()).collect(),
            counts: data.iter().map(|metric| metric.stats.call_count()).collect(),
        })
    }

    async fn send_analytics_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.record(Call::Events {
            endpoint: apm_harvest::data_sender::ANALYTIC_EVENT_DATA,
            reservoir_size,
            seen,
            count: events.len(),
        })
    }

    async fn send_error_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.record(Call::Events {
            endpoint: apm_harvest::data_sender::ERROR_EVENT_DATA,
            reservoir_size,
            seen,
            count: events.len(),
        })
    }

    async fn send_span_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.record(Call::Events {
            endpoint: apm_harvest::data_sender::SPAN_EVENT_DATA,
            reservoir_size,
            seen,
            count: events.len(),
        })
    }

    async fn send_log_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.record(Call::Events {
            endpoint: apm_harvest::data_sender::LOG_EVENT_DATA,
            reservoir_size,
            seen,
            count: events.len(),
        })
    }

    async fn send_custom_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.record(Call::Events {
            endpoint: apm_harvest::data_sender::CUSTOM_EVENT_DATA,
            reservoir_size,
            seen,
            count: events.len(),
        })
    }

    async fn send_error_data(&self, errors: &[Value]) -> Result<(), SendError> {
        self.record(Call::Items {
            method: ERROR_DATA,
            count: errors.len(),
        })
    }

    async fn send_transaction_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        self.record(Call::Items {
            method: TRANSACTION_SAMPLE_DATA,
            count: traces.len(),
        })
    }

    async fn send_sql_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        self.record(Call::Items {
            method: SQL_TRACE_DATA,
            count: traces.len(),
        })
    }

    async fn commit_and_flush(&self) -> Result<(), SendError> {
        self.record(Call::CommitAndFlush)
    }

    async fn shutdown(&self, _timestamp_ms: u64) -> Result<(), SendError> {
        self.record(Call::Shutdown)
    }
}
