// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection state and collector reporting for one application.

use crate::data_sender::{
    DataSender, Event, EventHarvestLimits, Label, ServerConfig, StartupOptions,
    ANALYTIC_EVENT_DATA, CUSTOM_EVENT_DATA, ERROR_EVENT_DATA, LOG_EVENT_DATA, SPAN_EVENT_DATA,
};
use crate::error::{ConnectError, SendError};
use crate::metric_names::{
    SUPPORTABILITY_METRIC_HARVEST_COUNT, SUPPORTABILITY_METRIC_HARVEST_INTERVAL,
    SUPPORTABILITY_METRIC_HARVEST_TRANSMIT,
};
use apm_transaction::naming::NormalizerRegistry;
use apm_transaction::stats::{StatsEngine, StatsService, StatsWork};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SERVERLESS_RUN_TOKEN: &str = "serverless-run-token";
pub const SERVERLESS_HOST: &str = "serverless";

/// Consecutive 503 responses logged quietly before one warning.
const QUIET_503_RESPONSES: u32 = 5;

/// Notified when an application gains or loses its collector connection.
///
/// `connected` runs before `launch` returns, so dependent services can start
/// their own schedules with the negotiated configuration.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, rpm: &Arc<RpmService>, config: &ServerConfig);

    fn disconnected(&self, _rpm: &RpmService) {}
}

/// Supplies the per-endpoint sample limits advertised on connect.
pub trait HarvestLimitsSource: Send + Sync {
    fn event_harvest_limits(&self, app_name: &str) -> HashMap<String, usize>;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpmServiceConfig {
    /// The first name is the application's; the rest are rollups.
    pub app_names: Vec<String>,
    pub is_main_app: bool,
    pub serverless: bool,
    pub high_security: bool,
    pub collector_host: String,
    pub collector_port: u16,
    pub hostname: String,
    pub agent_version: String,
    pub labels: Vec<Label>,
    pub settings: Value,
}

impl RpmServiceConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_names: vec![app_name.into()],
            is_main_app: true,
            serverless: false,
            high_security: false,
            collector_host: crate::http_sender::DEFAULT_COLLECTOR_HOST.to_string(),
            collector_port: 443,
            hostname: String::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            labels: Vec::new(),
            settings: Value::Object(serde_json::Map::new()),
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected: bool,
    has_ever_connected: bool,
    connected_at_ms: Option<u64>,
    entity_guid: Option<String>,
    run_token: Option<String>,
    server_config: Option<Arc<ServerConfig>>,
    last_report_time_ms: u64,
    retry_count: u32,
}

/// The kinds of event batch the collector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Analytics,
    Error,
    Span,
    Log,
    Custom,
}

impl EventKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            EventKind::Analytics => ANALYTIC_EVENT_DATA,
            EventKind::Error => ERROR_EVENT_DATA,
            EventKind::Span => SPAN_EVENT_DATA,
            EventKind::Log => LOG_EVENT_DATA,
            EventKind::Custom => CUSTOM_EVENT_DATA,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Batch<'a> {
    Events {
        kind: EventKind,
        reservoir_size: usize,
        seen: usize,
        events: &'a [Event],
    },
    Errors(&'a [Value]),
    TransactionTraces(&'a [Value]),
    SqlTraces(&'a [Value]),
}

impl<'a> Batch<'a> {
    fn len(&self) -> usize {
        match self {
            Batch::Events { events, .. } => events.len(),
            Batch::Errors(items) | Batch::TransactionTraces(items) | Batch::SqlTraces(items) => {
                items.len()
            }
        }
    }

    fn truncated(self, len: usize) -> Batch<'a> {
        match self {
            Batch::Events {
                kind,
                reservoir_size,
                seen,
                events,
            } => Batch::Events {
                kind,
                reservoir_size,
                seen,
                events: &events[..len.min(events.len())],
            },
            Batch::Errors(items) => Batch::Errors(&items[..len.min(items.len())]),
            Batch::TransactionTraces(items) => {
                Batch::TransactionTraces(&items[..len.min(items.len())])
            }
            Batch::SqlTraces(items) => Batch::SqlTraces(&items[..len.min(items.len())]),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Batch::Events { kind, .. } => kind.endpoint(),
            Batch::Errors(_) => "error data",
            Batch::TransactionTraces(_) => "transaction traces",
            Batch::SqlTraces(_) => "sql traces",
        }
    }
}

fn into_send_error(error: ConnectError) -> SendError {
    match error {
        ConnectError::Send(error) => error,
        other => SendError::Transport(other.to_string()),
    }
}

fn log_collector_message(level: &str, message: &str) {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" | "SEVERE" => error!("{message}"),
        "WARN" | "WARNING" => warn!("{message}"),
        "INFO" => info!("{message}"),
        _ => debug!("{message}"),
    }
}

/// The connection manager of one application: handshake, reconnects and
/// the per-datatype send wrappers that turn collector signals into retry
/// decisions.
pub struct RpmService {
    config: RpmServiceConfig,
    sender: Arc<dyn DataSender>,
    stats: Arc<StatsService>,
    normalizers: Arc<NormalizerRegistry>,
    state: Mutex<ConnectionState>,
    consecutive_503: AtomicU32,
    launching: tokio::sync::Mutex<()>,
    connect_requested: Notify,
    shut_down: CancellationToken,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    limits: RwLock<Option<Arc<dyn HarvestLimitsSource>>>,
}

impl std::fmt::Debug for RpmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpmService")
            .field("app_name", &self.app_name())
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl RpmService {
    pub fn new(
        config: RpmServiceConfig,
        sender: Arc<dyn DataSender>,
        stats: Arc<StatsService>,
        normalizers: Arc<NormalizerRegistry>,
    ) -> Self {
        Self {
            config,
            sender,
            stats,
            normalizers,
            state: Mutex::new(ConnectionState::default()),
            consecutive_503: AtomicU32::new(0),
            launching: tokio::sync::Mutex::new(()),
            connect_requested: Notify::new(),
            shut_down: CancellationToken::new(),
            listeners: RwLock::new(Vec::new()),
            limits: RwLock::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    pub fn app_name(&self) -> &str {
        self.config
            .app_names
            .first()
            .map_or(self.stats.default_app(), String::as_str)
    }

    pub fn is_main_app(&self) -> bool {
        self.config.is_main_app
    }

    pub fn is_serverless(&self) -> bool {
        self.config.serverless
    }

    pub fn host_string(&self) -> String {
        if self.config.serverless {
            SERVERLESS_HOST.to_string()
        } else {
            format!("{}:{}", self.config.collector_host, self.config.collector_port)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn has_ever_connected(&self) -> bool {
        self.state().has_ever_connected
    }

    pub fn connection_timestamp_ms(&self) -> Option<u64> {
        self.state().connected_at_ms
    }

    pub fn entity_guid(&self) -> Option<String> {
        self.state().entity_guid.clone()
    }

    pub fn run_token(&self) -> Option<String> {
        self.state().run_token.clone()
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.state().server_config.clone()
    }

    /// Harvests in a row that kept their data for a later attempt.
    pub fn retry_count(&self) -> u32 {
        self.state().retry_count
    }

    pub fn last_report_time_ms(&self) -> u64 {
        self.state().last_report_time_ms
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.is_cancelled()
    }

    /// Cancelled once reporting for this application has stopped for good.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shut_down.clone()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        #[allow(clippy::expect_used)]
        self.listeners.write().expect("lock poisoned").push(listener);
    }

    pub fn set_harvest_limits_source(&self, source: Arc<dyn HarvestLimitsSource>) {
        #[allow(clippy::expect_used)]
        let mut limits = self.limits.write().expect("lock poisoned");
        *limits = Some(source);
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        #[allow(clippy::expect_used)]
        self.listeners.read().expect("lock poisoned").clone()
    }

    /// Asks the connection service to attempt a connect right away.
    pub fn request_connect(&self) {
        self.connect_requested.notify_one();
    }

    /// Resolves after the next [`RpmService::request_connect`].
    pub async fn connect_requested(&self) {
        self.connect_requested.notified().await;
    }

    pub fn startup_options(&self) -> StartupOptions {
        let harvest_limits = {
            #[allow(clippy::expect_used)]
            let limits = self.limits.read().expect("lock poisoned");
            limits
                .as_ref()
                .map(|source| source.event_harvest_limits(self.app_name()))
                .unwrap_or_default()
        };
        StartupOptions {
            pid: std::process::id(),
            language: "rust".to_string(),
            agent_version: self.config.agent_version.clone(),
            host: self.config.hostname.clone(),
            app_name: self.config.app_names.clone(),
            identifier: format!("rust:{}", self.config.app_names.join(";")),
            labels: self.config.labels.clone(),
            settings: self.config.settings.clone(),
            high_security: self.config.high_security,
            event_harvest_config: EventHarvestLimits { harvest_limits },
            metadata: HashMap::new(),
        }
    }

    /// Connects unless already connected. Connection listeners have run by
    /// the time this returns `Ok`.
    pub async fn launch(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.is_shut_down() {
            return Err(ConnectError::ShutDown(self.app_name().to_string()));
        }
        let _launching = self.launching.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let server_config = match self.do_connect().await {
            Ok(server_config) => server_config,
            Err(ConnectError::Send(SendError::LicenseInvalid(msg))) => {
                error!("Invalid license key, the agent is no longer reporting information.");
                self.shutdown();
                return Err(SendError::LicenseInvalid(msg).into());
            }
            Err(ConnectError::Send(SendError::ForceDisconnect(msg))) => {
                error!(
                    "Received a ForceDisconnectException: {msg}. The agent is no longer reporting information."
                );
                self.shutdown();
                return Err(SendError::ForceDisconnect(msg).into());
            }
            Err(e) => return Err(e),
        };

        info!("Agent {} connected to {}", self.app_name(), self.host_string());
        for message in &server_config.messages {
            log_collector_message(&message.level, &message.message);
        }

        let server_config = Arc::new(server_config);
        {
            let now = now_ms();
            let mut state = self.state();
            state.connected = true;
            state.has_ever_connected = true;
            state.connected_at_ms = Some(now);
            state.entity_guid = server_config.entity_guid.clone();
            state.run_token = if self.config.serverless {
                Some(SERVERLESS_RUN_TOKEN.to_string())
            } else {
                server_config.run_id()
            };
            state.server_config = Some(Arc::clone(&server_config));
            if state.last_report_time_ms == 0 {
                state.last_report_time_ms = now;
            }
        }

        for listener in self.listeners() {
            listener.connected(self, &server_config);
        }
        Ok(())
    }

    async fn do_connect(&self) -> Result<ServerConfig, ConnectError> {
        if self.config.serverless {
            return Ok(ServerConfig::default());
        }
        let server_config = self.sender.connect(&self.startup_options()).await?;
        let missing = server_config.missing_parameters();
        if !missing.is_empty() {
            return Err(ConnectError::MissingParameters(missing));
        }
        Ok(server_config)
    }

    fn mark_disconnected(&self) -> bool {
        let mut state = self.state();
        std::mem::replace(&mut state.connected, false)
    }

    fn notify_disconnected(&self) {
        for listener in self.listeners() {
            listener.disconnected(self);
        }
    }

    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.sender.shutdown(now_ms()).await {
            debug!("Error sending shutdown for {}: {e}", self.app_name());
        }
        if self.mark_disconnected() {
            self.notify_disconnected();
        }
    }

    /// Disconnects and connects again before returning.
    pub async fn reconnect_sync(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.disconnect().await;
        self.launch().await
    }

    /// Disconnects and leaves the next connect to the connection service.
    pub async fn reconnect_async(&self) {
        self.disconnect().await;
        self.request_connect();
    }

    pub async fn reconnect(&self) {
        info!("{} is reconnecting", self.app_name());
        self.reconnect_async().await;
    }

    /// Stops reporting for this application. No further connect is attempted.
    pub fn shutdown(&self) {
        self.shut_down.cancel();
        if self.mark_disconnected() {
            self.notify_disconnected();
        }
    }

    /// Sends the engine's metrics. The engine is cleared unless the data
    /// should be resent in the next cycle.
    pub async fn harvest(self: &Arc<Self>, engine: &mut StatsEngine) {
        if !self.is_connected() {
            debug!("Trying to re-establish connection to {}", self.host_string());
            if let Err(e) = self.launch().await {
                debug!("Unable to connect {} before harvest: {e}", self.app_name());
            }
        }
        if !self.is_connected() {
            return;
        }

        let normalizer = self.normalizers.metric_normalizer(self.app_name());
        let data = engine.metric_data(normalizer.as_ref());
        let begin_ms = self.last_report_time_ms();
        let now = now_ms();
        let started = Instant::now();

        let mut report_interval = Duration::ZERO;
        let result = match self.send_metric_data_sync_restart(begin_ms, now, &data).await {
            Ok(()) => self.sender.commit_and_flush().await,
            Err(e) => Err(e),
        };
        let retry = match result {
            Ok(()) => {
                report_interval = Duration::from_millis(now.saturating_sub(begin_ms));
                let previous_retries = {
                    let mut state = self.state();
                    state.last_report_time_ms = now;
                    state.retry_count
                };
                self.consecutive_503.store(0, Ordering::Relaxed);
                if previous_retries > 0 {
                    info!("Successfully reconnected to the collector.");
                }
                debug!("Reported {} timeslices for {}", data.len(), self.app_name());
                false
            }
            Err(e) => self.should_retry_metric_data(e, data.len()).await,
        };
        let transmit = started.elapsed();

        if retry {
            self.state().retry_count += 1;
            return;
        }
        self.state().retry_count = 0;
        engine.clear();

        let app = self.app_name();
        if !report_interval.is_zero() {
            self.stats.do_stats_work(
                app,
                StatsWork::record_response_time(SUPPORTABILITY_METRIC_HARVEST_INTERVAL, report_interval),
            );
        }
        self.stats.do_stats_work(
            app,
            StatsWork::record_response_time(SUPPORTABILITY_METRIC_HARVEST_TRANSMIT, transmit),
        );
        self.stats.do_stats_work(
            app,
            StatsWork::increment_counter(SUPPORTABILITY_METRIC_HARVEST_COUNT, data.len() as u64),
        );
    }

    async fn send_metric_data_sync_restart(
        self: &Arc<Self>,
        begin_ms: u64,
        end_ms: u64,
        data: &[apm_transaction::stats::MetricData],
    ) -> Result<(), SendError> {
        match self.sender.send_metric_data(begin_ms, end_ms, data).await {
            Err(SendError::ForceRestart(msg)) => {
                self.log_force_restart(&msg);
                self.reconnect_sync().await.map_err(into_send_error)?;
                self.sender.send_metric_data(begin_ms, end_ms, data).await
            }
            other => other,
        }
    }

    async fn should_retry_metric_data(&self, error: SendError, timeslices: usize) -> bool {
        match error {
            SendError::InternalLimitExceeded(_) => {
                error!(
                    "The metric data post was too large. {timeslices} timeslices will not be resent"
                );
                false
            }
            SendError::InvalidResponse(_) => {
                error!(
                    "An invalid response was received while sending metric data. This data will not be resent."
                );
                false
            }
            SendError::Http(http) => {
                if http.is_unavailable() {
                    self.handle_503();
                } else if http.is_retryable() {
                    info!(
                        "An error occurred posting metric data - {}. This data will be resent later.",
                        http.message
                    );
                } else {
                    error!(
                        "An error occurred posting metric data - {}. {timeslices} timeslices will not be resent.",
                        http.message
                    );
                }
                http.is_retryable()
            }
            SendError::PayloadTooLarge(msg) => {
                error!(
                    "An error occurred posting metric data - {msg}. {timeslices} timeslices will not be resent."
                );
                false
            }
            SendError::ForceRestart(msg) => {
                self.log_force_restart(&msg);
                self.reconnect_async().await;
                true
            }
            SendError::ForceDisconnect(msg) => {
                error!(
                    "Received a ForceDisconnectException: {msg}. The agent is no longer reporting information."
                );
                self.shutdown();
                false
            }
            SendError::LicenseInvalid(_) => {
                error!("Invalid license key, the agent is no longer reporting information.");
                self.shutdown();
                false
            }
            SendError::HostUnreachable(host) => {
                info!(
                    "A connection error occurred contacting {host}. Please check your network / proxy settings."
                );
                true
            }
            error @ SendError::Transport(_) => {
                let msg = error.to_string().to_lowercase();
                info!("An unexpected error occurred sending metric data: {error}");
                !(msg.contains("json") && msg.contains("parse"))
            }
        }
    }

    fn handle_503(&self) {
        let msg = "A 503 (Unavailable) response was received while sending metric data. The agent will continue to aggregate data and report it in the next time period.";
        if self.consecutive_503.fetch_add(1, Ordering::Relaxed) == QUIET_503_RESPONSES {
            warn!("{msg}");
        } else {
            debug!("{msg}");
        }
    }

    fn log_force_restart(&self, msg: &str) {
        warn!(
            "Received a ForceRestartException: {msg}. The agent will attempt to reconnect for data reporting."
        );
    }

    async fn dispatch(&self, batch: Batch<'_>) -> Result<(), SendError> {
        match batch {
            Batch::Events {
                kind,
                reservoir_size,
                seen,
                events,
            } => match kind {
                EventKind::Analytics => {
                    self.sender
                        .send_analytics_events(reservoir_size, seen, events)
                        .await
                }
                EventKind::Error => {
                    self.sender
                        .send_error_events(reservoir_size, seen, events)
                        .await
                }
                EventKind::Span => {
                    self.sender
                        .send_span_events(reservoir_size, seen, events)
                        .await
                }
                EventKind::Log => self.sender.send_log_events(reservoir_size, seen, events).await,
                EventKind::Custom => {
                    self.sender
                        .send_custom_events(reservoir_size, seen, events)
                        .await
                }
            },
            Batch::Errors(errors) => self.sender.send_error_data(errors).await,
            Batch::TransactionTraces(traces) => self.sender.send_transaction_trace_data(traces).await,
            Batch::SqlTraces(traces) => self.sender.send_sql_trace_data(traces).await,
        }
    }

    /// Sends once; a forced restart reconnects synchronously and sends once more.
    async fn dispatch_sync_restart(self: &Arc<Self>, batch: Batch<'_>) -> Result<(), SendError> {
        match self.dispatch(batch).await {
            Err(SendError::ForceRestart(msg)) => {
                self.log_force_restart(&msg);
                self.reconnect_sync().await.map_err(into_send_error)?;
                self.dispatch(batch).await
            }
            other => other,
        }
    }

    /// Returns an error only when the caller has something to do with it:
    /// retryable failures, collector signals and transport errors.
    async fn send_batch(self: &Arc<Self>, batch: Batch<'_>) -> Result<(), SendError> {
        let mut batch = batch;
        loop {
            match self.dispatch_sync_restart(batch).await {
                Ok(()) => return Ok(()),
                Err(SendError::PayloadTooLarge(_)) => {
                    let half = batch.len() / 2;
                    if half == 0 {
                        debug!("Dropping {} after the collector refused its size", batch.describe());
                        return Ok(());
                    }
                    debug!(
                        "Resending {half} of {} {} after the collector refused its size",
                        batch.len(),
                        batch.describe()
                    );
                    batch = batch.truncated(half);
                }
                Err(SendError::ForceRestart(msg)) => {
                    self.log_force_restart(&msg);
                    self.reconnect_async().await;
                    return Err(SendError::ForceRestart(msg));
                }
                Err(SendError::ForceDisconnect(msg)) => {
                    error!(
                        "Received a ForceDisconnectException: {msg}. The agent is no longer reporting information."
                    );
                    self.shutdown();
                    return Err(SendError::ForceDisconnect(msg));
                }
                Err(SendError::Http(http)) if !http.is_retryable() => {
                    debug!("Dropping {} for {}: {http}", batch.describe(), self.app_name());
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn send_events(
        self: &Arc<Self>,
        kind: EventKind,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_batch(Batch::Events {
            kind,
            reservoir_size,
            seen,
            events,
        })
        .await
    }

    pub async fn send_analytics_events(
        self: &Arc<Self>,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(EventKind::Analytics, reservoir_size, seen, events)
            .await
    }

    pub async fn send_error_events(
        self: &Arc<Self>,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(EventKind::Error, reservoir_size, seen, events)
            .await
    }

    pub async fn send_span_events(
        self: &Arc<Self>,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(EventKind::Span, reservoir_size, seen, events)
            .await
    }

    pub async fn send_log_events(
        self: &Arc<Self>,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(EventKind::Log, reservoir_size, seen, events)
            .await
    }

    pub async fn send_custom_events(
        self: &Arc<Self>,
        reservoir_size: usize,
        seen: usize,
        events: &[Event],
    ) -> Result<(), SendError> {
        self.send_events(EventKind::Custom, reservoir_size, seen, events)
            .await
    }

    pub async fn send_transaction_traces(self: &Arc<Self>, traces: &[Value]) -> Result<(), SendError> {
        self.send_batch(Batch::TransactionTraces(traces)).await
    }

    pub async fn send_sql_traces(self: &Arc<Self>, traces: &[Value]) -> Result<(), SendError> {
        self.send_batch(Batch::SqlTraces(traces)).await
    }

    /// Error traces are never resent: failures other than collector signals
    /// are logged and dropped.
    pub async fn send_error_data(self: &Arc<Self>, errors: &[Value]) -> Result<(), SendError> {
        match self.send_batch(Batch::Errors(errors)).await {
            Err(e @ (SendError::ForceRestart(_) | SendError::ForceDisconnect(_))) => Err(e),
            Err(e) => {
                warn!("Error sending error data: {e}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}
