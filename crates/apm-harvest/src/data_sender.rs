// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collector contract and the payloads exchanged through it.

use crate::error::SendError;
use apm_transaction::stats::MetricData;
use async_trait::async_trait;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const ANALYTIC_EVENT_DATA: &str = "analytic_event_data";
pub const ERROR_EVENT_DATA: &str = "error_event_data";
pub const SPAN_EVENT_DATA: &str = "span_event_data";
pub const LOG_EVENT_DATA: &str = "log_event_data";
pub const CUSTOM_EVENT_DATA: &str = "custom_event_data";

/// One sampled event: intrinsics, user attributes and agent attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub priority: f32,
    pub intrinsics: Map<String, Value>,
    pub user_attributes: Map<String, Value>,
    pub agent_attributes: Map<String, Value>,
}

impl Event {
    pub fn new(priority: f32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

// Events go over the wire as `[intrinsics, user, agent]`.
impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.intrinsics)?;
        tuple.serialize_element(&self.user_attributes)?;
        tuple.serialize_element(&self.agent_attributes)?;
        tuple.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub label_type: String,
    pub label_value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventHarvestLimits {
    pub harvest_limits: HashMap<String, usize>,
}

/// What the agent tells the collector about itself on connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupOptions {
    pub pid: u32,
    pub language: String,
    pub agent_version: String,
    pub host: String,
    pub app_name: Vec<String>,
    pub identifier: String,
    pub labels: Vec<Label>,
    pub settings: Value,
    pub high_security: bool,
    pub event_harvest_config: EventHarvestLimits,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectorMessage {
    pub message: String,
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventHarvestConfig {
    pub report_period_ms: Option<u64>,
    #[serde(default)]
    pub harvest_limits: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpanEventHarvestConfig {
    pub report_period_ms: Option<u64>,
    pub harvest_limit: Option<u64>,
}

/// What the collector assigns on connect.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub agent_run_id: Option<Value>,
    pub entity_guid: Option<String>,
    pub collect_errors: Option<bool>,
    pub collect_traces: Option<bool>,
    pub data_report_period: Option<u64>,
    pub sampling_target: Option<u64>,
    #[serde(default)]
    pub messages: Vec<CollectorMessage>,
    pub event_harvest_config: Option<EventHarvestConfig>,
    pub span_event_harvest_config: Option<SpanEventHarvestConfig>,
    #[serde(default)]
    pub transaction_name_rules: Vec<Value>,
    #[serde(default)]
    pub metric_name_rules: Vec<Value>,
    pub max_payload_size_in_bytes: Option<usize>,
    #[serde(default)]
    pub request_headers_map: HashMap<String, String>,
}

impl ServerConfig {
    /// The run id as the collector expects it back in query strings.
    pub fn run_id(&self) -> Option<String> {
        match self.agent_run_id.as_ref()? {
            Value::String(id) => Some(id.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Parameters a reporting agent cannot run without.
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.collect_errors.is_none() {
            missing.push("collect_errors");
        }
        if self.collect_traces.is_none() {
            missing.push("collect_traces");
        }
        if self.data_report_period.is_none() {
            missing.push("data_report_period");
        }
        missing
    }
}

/// Talks to the collector on behalf of one application.
///
/// Implementations map collector responses to [`SendError`] variants; the
/// retry policy lives with the caller.
#[async_trait]
pub trait DataSender: Send + Sync {
    async fn connect(&self, options: &StartupOptions) -> Result<ServerConfig, SendError>;

    async fn send_metric_data(
        &self,
        begin_ms: u64,
        end_ms: u64,
        data: &[MetricData],
    ) -> Result<(), SendError>;

    async fn send_analytics_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError>;

    async fn send_error_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError>;

    async fn send_span_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError>;

    async fn send_log_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError>;

    async fn send_custom_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError>;

    async fn send_error_data(&self, errors: &[Value]) -> Result<(), SendError>;

    async fn send_transaction_trace_data(&self, traces: &[Value]) -> Result<(), SendError>;

    async fn send_sql_trace_data(&self, traces: &[Value]) -> Result<(), SendError>;

    /// Pushes out anything buffered during this harvest.
    async fn commit_and_flush(&self) -> Result<(), SendError>;

    async fn shutdown(&self, timestamp_ms: u64) -> Result<(), SendError>;
}

/// Creates the sender used by a newly created application.
pub trait DataSenderFactory: Send + Sync {
    fn create(&self, app_name: &str) -> Arc<dyn DataSender>;
}
