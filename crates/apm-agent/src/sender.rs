// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector senders available to the agent.

use crate::config::AgentConfig;
use crate::error::AgentError;
use apm_harvest::data_sender::{DataSender, Event, ServerConfig, StartupOptions};
use apm_harvest::error::SendError;
use apm_harvest::http_sender::{HttpDataSender, HttpSenderConfig};
use apm_transaction::stats::MetricData;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes every payload summary to the log instead of a collector. Used
/// when no license key is configured.
#[derive(Debug, Default)]
pub struct LoggingDataSender {
    connects: AtomicU64,
}

impl LoggingDataSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self, endpoint: &str, reservoir_size: usize, seen: usize, events: &[Event]) {
        debug!(
            "{endpoint}: {} events (reservoir size {reservoir_size}, seen {seen})",
            events.len()
        );
    }
}

#[async_trait::async_trait]
impl DataSender for LoggingDataSender {
    async fn connect(&self, options: &StartupOptions) -> Result<ServerConfig, SendError> {
        let run = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "No license key configured, reporting {} to the log",
            options.app_name.join(";")
        );
        Ok(ServerConfig {
            agent_run_id: Some(json!(format!("local-{run}"))),
            collect_errors: Some(true),
            collect_traces: Some(true),
            data_report_period: Some(60),
            ..ServerConfig::default()
        })
    }

    async fn send_metric_data(
        &self,
        begin_ms: u64,
        end_ms: u64,
        data: &[MetricData],
    ) -> Result<(), SendError> {
        info!(
            "metric_data: {} timeslices for [{begin_ms}, {end_ms}]",
            data.len()
        );
        for metric in data {
            debug!(
                "  {}{} count={} total={:.6}",
                metric.name,
                metric
                    .scope
                    .map(|scope| format!(" (scope {scope})"))
                    .unwrap_or_default(),
                metric.stats.call_count(),
                metric.stats.total()
            );
        }
        Ok(())
    }

    async fn send_analytics_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.events("analytic_event_data", reservoir_size, seen, events);
        Ok(())
    }

    async fn send_error_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.events("error_event_data", reservoir_size, seen, events);
        Ok(())
    }

    async fn send_span_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.events("span_event_data", reservoir_size, seen, events);
        Ok(())
    }

    async fn send_log_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.events("log_event_data", reservoir_size, seen, events);
        Ok(())
    }

    async fn send_custom_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.events("custom_event_data", reservoir_size, seen, events);
        Ok(())
    }

    async fn send_error_data(&self, errors: &[Value]) -> Result<(), SendError> {
        debug!("error_data: {} traced errors", errors.len());
        Ok(())
    }

    async fn send_transaction_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        debug!("transaction_sample_data: {} traces", traces.len());
        Ok(())
    }

    async fn send_sql_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        debug!("sql_trace_data: {} traces", traces.len());
        Ok(())
    }

    async fn commit_and_flush(&self) -> Result<(), SendError> {
        Ok(())
    }

    async fn shutdown(&self, timestamp_ms: u64) -> Result<(), SendError> {
        debug!("shutdown at {timestamp_ms}");
        Ok(())
    }
}

/// The collector sender for `config`: HTTP with a license key, the log otherwise.
pub fn data_sender(config: &AgentConfig) -> Result<Arc<dyn DataSender>, AgentError> {
    let Some(license_key) = config.license_key.clone() else {
        return Ok(Arc::new(LoggingDataSender::new()));
    };
    let sender = HttpDataSender::new(HttpSenderConfig {
        host: config.host.clone(),
        port: config.port,
        license_key,
        https_proxy: config.https_proxy.clone(),
        high_security: config.high_security,
        ..HttpSenderConfig::default()
    })
    .map_err(|e| AgentError::Sender(e.to_string()))?;
    Ok(Arc::new(sender))
}
