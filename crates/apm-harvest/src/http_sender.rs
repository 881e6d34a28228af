// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`DataSender`] over the collector's JSON protocol.

use crate::data_sender::{
    DataSender, Event, ServerConfig, StartupOptions, ANALYTIC_EVENT_DATA, CUSTOM_EVENT_DATA,
    ERROR_EVENT_DATA, LOG_EVENT_DATA, SPAN_EVENT_DATA,
};
use crate::error::{HttpError, SendError};
use apm_transaction::stats::MetricData;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const PROTOCOL_VERSION: u32 = 17;
pub const DEFAULT_COLLECTOR_HOST: &str = "collector.newrelic.com";
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1_000_000;

const PRECONNECT: &str = "preconnect";
const CONNECT: &str = "connect";
const METRIC_DATA: &str = "metric_data";
const ERROR_DATA: &str = "error_data";
const TRANSACTION_SAMPLE_DATA: &str = "transaction_sample_data";
const SQL_TRACE_DATA: &str = "sql_trace_data";
const SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSenderConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub license_key: String,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub high_security: bool,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: 443,
            secure: true,
            license_key: String::new(),
            https_proxy: None,
            timeout: Duration::from_secs(120),
            high_security: false,
        }
    }
}

#[derive(Debug)]
struct Session {
    redirect_host: Option<String>,
    run_id: Option<String>,
    request_headers: HashMap<String, String>,
    max_payload_size: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            redirect_host: None,
            run_id: None,
            request_headers: HashMap::new(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

pub struct HttpDataSender {
    config: HttpSenderConfig,
    client: reqwest::Client,
    session: RwLock<Session>,
}

impl std::fmt::Debug for HttpDataSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDataSender")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl HttpDataSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            config,
            session: RwLock::new(Session::default()),
        })
    }

    fn session(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        #[allow(clippy::expect_used)]
        self.session.read().expect("lock poisoned")
    }

    fn session_mut(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        #[allow(clippy::expect_used)]
        self.session.write().expect("lock poisoned")
    }

    fn url(&self, host: &str, method: &str, run_id: Option<&str>) -> String {
        let scheme = if self.config.secure { "https" } else { "http" };
        let mut url = format!(
            "{scheme}://{host}:{}/agent_listener/invoke_raw_method?method={method}&license_key={}&marshal_format=json&protocol_version={PROTOCOL_VERSION}",
            self.config.port, self.config.license_key
        );
        if let Some(run_id) = run_id {
            url.push_str("&run_id=");
            url.push_str(run_id);
        }
        url
    }

    async fn invoke_run_id(&self, method: &str, params: Value) -> Result<Option<Value>, SendError> {
        let (host, run_id) = {
            let session = self.session();
            (
                session
                    .redirect_host
                    .clone()
                    .unwrap_or_else(|| self.config.host.clone()),
                session.run_id.clone(),
            )
        };
        let Some(run_id) = run_id else {
            return Err(SendError::Transport(format!(
                "No agent run id available for {method}"
            )));
        };
        self.invoke(&host, method, Some(&run_id), params).await
    }

    async fn invoke(
        &self,
        host: &str,
        method: &str,
        run_id: Option<&str>,
        params: Value,
    ) -> Result<Option<Value>, SendError> {
        let body = serde_json::to_vec(&params)
            .map_err(|e| SendError::Transport(format!("Unable to serialize {method}: {e}")))?;

        let (max_payload_size, headers) = {
            let session = self.session();
            (session.max_payload_size, session.request_headers.clone())
        };
        // Error traces are halved by the caller instead.
        if body.len() > max_payload_size && method != ERROR_DATA {
            let msg = format!(
                "Payload of size {} exceeded maximum size {max_payload_size} for {method} method",
                body.len()
            );
            warn!("{msg}");
            return Err(SendError::InternalLimitExceeded(msg));
        }

        let mut request = self
            .client
            .post(self.url(host, method, run_id))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                SendError::HostUnreachable(host.to_string())
            } else {
                SendError::Transport(format!("Remote {method} call failed: {e}"))
            }
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            debug!("Connection http status code: {status} for {method}");
            return Err(status_to_error(status, &text));
        }
        if text.is_empty() {
            trace!("Response was empty ({method})");
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(mut response) => Ok(response
                .get_mut("return_value")
                .map(Value::take)
                .filter(|value| !value.is_null())),
            Err(e) => {
                warn!("Error parsing response JSON({method}): {e}");
                Err(SendError::InvalidResponse(format!(
                    "Error parsing response JSON({method}): {e}"
                )))
            }
        }
    }

    async fn send_events(
        &self,
        method: &str,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        let run_id = self.session().run_id.clone();
        self.invoke_run_id(
            method,
            json!([
                run_id,
                { "reservoir_size": reservoir_size, "events_seen": seen },
                events
            ]),
        )
        .await
        .map(|_| ())
    }
}

fn status_to_error(status: StatusCode, body: &str) -> SendError {
    match status {
        StatusCode::UNAUTHORIZED => SendError::LicenseInvalid(exception_message(body)),
        StatusCode::CONFLICT => SendError::ForceRestart(exception_message(body)),
        StatusCode::GONE => SendError::ForceDisconnect(exception_message(body)),
        StatusCode::PAYLOAD_TOO_LARGE => SendError::PayloadTooLarge(exception_message(body)),
        status => SendError::Http(HttpError::new(
            status.as_u16(),
            status
                .canonical_reason()
                .unwrap_or("Unexpected status")
                .to_string(),
        )),
    }
}

/// The collector's `exception.message`, or the raw body when there is none.
fn exception_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("exception")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

fn metric_payload(data: &[MetricData]) -> Vec<Value> {
    data.iter()
        .map(|metric| {
            let mut spec = json!({ "name": metric.name.as_str() });
            if let Some(scope) = metric.scope {
                spec["scope"] = json!(scope.as_str());
            }
            let stats = &metric.stats;
            json!([
                spec,
                [
                    stats.call_count(),
                    stats.total(),
                    stats.total_exclusive(),
                    stats.min(),
                    stats.max(),
                    stats.sum_of_squares()
                ]
            ])
        })
        .collect()
}

#[async_trait]
impl DataSender for HttpDataSender {
    async fn connect(&self, options: &StartupOptions) -> Result<ServerConfig, SendError> {
        let original_host = self.config.host.clone();
        let preconnect = self
            .invoke(
                &original_host,
                PRECONNECT,
                None,
                json!([{ "high_security": self.config.high_security }]),
            )
            .await?;
        let host = preconnect
            .as_ref()
            .and_then(|value| value.get("redirect_host"))
            .and_then(Value::as_str)
            .map_or(original_host, str::to_string);
        info!("Collector redirection to {host}:{}", self.config.port);

        let response = self
            .invoke(&host, CONNECT, None, json!([options]))
            .await?
            .ok_or_else(|| {
                SendError::InvalidResponse("Expected a map of connection data, got nothing".to_string())
            })?;
        if !response.is_object() {
            return Err(SendError::InvalidResponse(format!(
                "Expected a map of connection data, got {response}"
            )));
        }
        let server_config: ServerConfig = serde_json::from_value(response)
            .map_err(|e| SendError::InvalidResponse(format!("Invalid connection data: {e}")))?;
        let Some(run_id) = server_config.run_id() else {
            return Err(SendError::InvalidResponse(
                "Missing agent_run_id connection parameter".to_string(),
            ));
        };

        let mut session = self.session_mut();
        if let Some(max_payload_size) = server_config.max_payload_size_in_bytes {
            info!("Max payload size is {max_payload_size} bytes");
            session.max_payload_size = max_payload_size;
        }
        if server_config.request_headers_map.is_empty() {
            debug!("Did not receive request headers on connect");
        }
        session.request_headers = server_config.request_headers_map.clone();
        session.redirect_host = Some(host);
        session.run_id = Some(run_id);
        Ok(server_config)
    }

    async fn send_metric_data(
        &self,
        begin_ms: u64,
        end_ms: u64,
        data: &[MetricData],
    ) -> Result<(), SendError> {
        let run_id = self.session().run_id.clone();
        self.invoke_run_id(
            METRIC_DATA,
            json!([run_id, begin_ms / 1000, end_ms / 1000, metric_payload(data)]),
        )
        .await
        .map(|_| ())
    }

    async fn send_analytics_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(ANALYTIC_EVENT_DATA, reservoir_size, seen, events)
            .await
    }

    async fn send_error_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(ERROR_EVENT_DATA, reservoir_size, seen, events)
            .await
    }

    async fn send_span_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(SPAN_EVENT_DATA, reservoir_size, seen, events)
            .await
    }

    async fn send_log_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(LOG_EVENT_DATA, reservoir_size, seen, events)
            .await
    }

    async fn send_custom_events(
        &self,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(CUSTOM_EVENT_DATA, reservoir_size, seen, events)
            .await
    }

    async fn send_error_data(&self, errors: &[Value]) -> Result<(), SendError> {
        let run_id = self.session().run_id.clone();
        self.invoke_run_id(ERROR_DATA, json!([run_id, errors]))
            .await
            .map(|_| ())
    }

    async fn send_transaction_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        let run_id = self.session().run_id.clone();
        self.invoke_run_id(TRANSACTION_SAMPLE_DATA, json!([run_id, traces]))
            .await
            .map(|_| ())
    }

    async fn send_sql_trace_data(&self, traces: &[Value]) -> Result<(), SendError> {
        self.invoke_run_id(SQL_TRACE_DATA, json!([traces]))
            .await
            .map(|_| ())
    }

    async fn commit_and_flush(&self) -> Result<(), SendError> {
        Ok(())
    }

    async fn shutdown(&self, timestamp_ms: u64) -> Result<(), SendError> {
        let result = self
            .invoke_run_id(SHUTDOWN, json!([timestamp_ms]))
            .await
            .map(|_| ());
        self.session_mut().run_id = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_transaction::stats::StatsEngine;
    use apm_transaction::naming::NoOpNormalizer;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;

    fn sender_for(server: &ServerGuard) -> HttpDataSender {
        let address = server.host_with_port();
        let (host, port) = address.rsplit_once(':').unwrap();
        HttpDataSender::new(HttpSenderConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            secure: false,
            license_key: "mock-license-key".to_string(),
            https_proxy: None,
            timeout: Duration::from_secs(5),
            high_security: false,
        })
        .unwrap()
    }

    fn method(name: &str) -> Matcher {
        Matcher::UrlEncoded("method".to_string(), name.to_string())
    }

    fn options() -> StartupOptions {
        StartupOptions {
            pid: 1,
            language: "rust".to_string(),
            agent_version: "0.1.0".to_string(),
            host: "test-host".to_string(),
            app_name: vec!["app".to_string()],
            identifier: "rust:app".to_string(),
            labels: Vec::new(),
            settings: json!({}),
            high_security: false,
            event_harvest_config: Default::default(),
            metadata: HashMap::new(),
        }
    }

    async fn connected(server: &mut ServerGuard) -> HttpDataSender {
        server
            .mock("POST", "/agent_listener/invoke_raw_method")
            .match_query(method(PRECONNECT))
            .with_status(200)
            .with_body(r#"{"return_value": {"redirect_host": "127.0.0.1"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/agent_listener/invoke_raw_method")
            .match_query(method(CONNECT))
            .with_status(200)
            .with_body(
                r#"{"return_value": {"agent_run_id": "run-7", "collect_errors": true, "collect_traces": true, "data_report_period": 60}}"#,
            )
            .create_async()
            .await;
        let sender = sender_for(server);
        sender.connect(&options()).await.unwrap();
        sender
    }

    #[tokio::test]
    async fn connect_follows_redirect_and_stores_run_id() {
        let mut server = Server::new_async().await;
        let sender = connected(&mut server).await;

        let metrics = server
            .mock("POST", "/agent_listener/invoke_raw_method")
            .match_query(Matcher::AllOf(vec![
                method(METRIC_DATA),
                Matcher::UrlEncoded("run_id".to_string(), "run-7".to_string()),
                Matcher::UrlEncoded("license_key".to_string(), "mock-license-key".to_string()),
                Matcher::UrlEncoded("protocol_version".to_string(), "17".to_string()),
            ]))
            .match_header("Content-Type", "application/json")
            .with_status(202)
            .create_async()
            .await;

        let mut engine = StatsEngine::default();
        engine.unscoped_mut().get_stats("Custom/metric").increment_call_count(2);
        let data = engine.metric_data(&NoOpNormalizer);
        sender.send_metric_data(0, 60_000, &data).await.unwrap();
        metrics.assert_async().await;
    }

    #[tokio::test]
    async fn statuses_map_to_collector_signals() {
        let mut server = Server::new_async().await;
        let sender = connected(&mut server).await;

        let cases = [
            (409, SendError::ForceRestart("restart now".to_string())),
            (410, SendError::ForceDisconnect("restart now".to_string())),
            (401, SendError::LicenseInvalid("restart now".to_string())),
            (413, SendError::PayloadTooLarge("restart now".to_string())),
            (503, SendError::Http(HttpError::new(503, "Service Unavailable"))),
        ];
        for (status, expected) in cases {
            let mock = server
                .mock("POST", "/agent_listener/invoke_raw_method")
                .match_query(method(ERROR_DATA))
                .with_status(status)
                .with_body(r#"{"exception": {"message": "restart now"}}"#)
                .create_async()
                .await;
            let result = sender.send_error_data(&[json!({"error": 1})]).await;
            assert_eq!(result, Err(expected), "status {status}");
            mock.remove_async().await;
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_locally() {
        let mut server = Server::new_async().await;
        let sender = connected(&mut server).await;
        sender.session_mut().max_payload_size = 16;

        let events = vec![Event::new(1.0); 10];
        let result = sender.send_analytics_events(10, 10, &events).await;
        assert!(matches!(result, Err(SendError::InternalLimitExceeded(_))));
    }

    #[tokio::test]
    async fn send_without_run_id_fails() {
        let server = Server::new_async().await;
        let sender = sender_for(&server);
        let result = sender.send_sql_trace_data(&[]).await;
        assert!(matches!(result, Err(SendError::Transport(_))));
    }

    #[tokio::test]
    async fn connect_without_run_id_is_invalid() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/agent_listener/invoke_raw_method")
            .match_query(method(PRECONNECT))
            .with_status(200)
            .with_body(r#"{"return_value": {"redirect_host": "127.0.0.1"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/agent_listener/invoke_raw_method")
            .match_query(method(CONNECT))
            .with_status(200)
            .with_body(r#"{"return_value": {"collect_errors": true}}"#)
            .create_async()
            .await;
        let sender = sender_for(&server);
        let result = sender.connect(&options()).await;
        assert!(matches!(result, Err(SendError::InvalidResponse(_))));
    }

    #[test]
    fn exception_message_falls_back_to_body() {
        assert_eq!(exception_message("plain text"), "plain text");
        assert_eq!(
            exception_message(r#"{"exception": {"message": "bad key"}}"#),
            "bad key"
        );
    }
}
