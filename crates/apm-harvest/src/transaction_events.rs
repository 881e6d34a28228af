// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction events: one analytic event per finished transaction, sampled
//! into a per-application reservoir and sent on the negotiated schedule.

use crate::data_sender::{Event, ANALYTIC_EVENT_DATA};
use crate::harvestable::Harvestable;
use crate::metric_names::{
    SUPPORTABILITY_TRANSACTION_EVENTS_DISCARDED, SUPPORTABILITY_TRANSACTION_EVENTS_SEEN,
    SUPPORTABILITY_TRANSACTION_EVENTS_SENT,
};
use crate::reservoir::EventReservoir;
use crate::rpm_service::RpmService;
use apm_transaction::attributes::TIMEOUT_CAUSE;
use apm_transaction::dispatcher::DispatcherKind;
use apm_transaction::service::TransactionListener;
use apm_transaction::stats::{StatsService, StatsWork, TransactionStats};
use apm_transaction::transaction::TransactionData;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MAX_SAMPLES_STORED: usize = 2000;
pub const TRANSACTION_EVENT_TYPE: &str = "Transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionEventsConfig {
    pub enabled: bool,
    pub max_samples_stored: usize,
}

impl Default for TransactionEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples_stored: DEFAULT_MAX_SAMPLES_STORED,
        }
    }
}

#[derive(Debug)]
struct AppEvents {
    capacity: usize,
    reservoir: EventReservoir<Event>,
}

impl AppEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reservoir: EventReservoir::new(capacity),
        }
    }

    fn take(&mut self) -> EventReservoir<Event> {
        std::mem::replace(&mut self.reservoir, EventReservoir::new(self.capacity))
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Builds the analytic event reported for a finished transaction.
pub fn transaction_event(data: &TransactionData) -> Event {
    let mut event = Event::new(data.priority);
    let intrinsics = &mut event.intrinsics;
    for (key, value) in &data.attributes.intrinsic {
        intrinsics.insert(key.clone(), value.clone());
    }
    intrinsics.insert("type".to_string(), json!(TRANSACTION_EVENT_TYPE));
    intrinsics.insert("timestamp".to_string(), json!(data.start_time_ms));
    intrinsics.insert("name".to_string(), json!(data.name));
    intrinsics.insert("duration".to_string(), json!(seconds(data.response_time)));
    intrinsics.insert("totalTime".to_string(), json!(seconds(data.total_time)));
    intrinsics.insert("guid".to_string(), json!(data.guid));
    intrinsics.insert("priority".to_string(), json!(data.priority));
    intrinsics.insert("sampled".to_string(), json!(data.sampled));
    if !data.queue_time.is_zero() {
        intrinsics.insert("queueDuration".to_string(), json!(seconds(data.queue_time)));
    }
    if let Some(gc_time) = data.gc_time {
        intrinsics.insert("gcCumulative".to_string(), json!(seconds(gc_time)));
    }

    event.user_attributes = data.attributes.user.clone();

    let agent = &mut event.agent_attributes;
    for (key, value) in &data.attributes.agent {
        agent.insert(key.clone(), value.clone());
    }
    if data.dispatcher == DispatcherKind::Web {
        if let Some(uri) = &data.uri {
            agent.insert("request.uri".to_string(), Value::String(uri.clone()));
        }
    }
    if let Some(cause) = data.timeout_cause {
        agent.insert(TIMEOUT_CAUSE.to_string(), json!(cause.as_str()));
    }
    event
}

/// Collects transaction events for every application. Register it as a
/// transaction listener and add one [`TransactionEventHarvestable`] per
/// application to the harvest service.
pub struct TransactionEventsService {
    config: TransactionEventsConfig,
    stats: Arc<StatsService>,
    apps: Mutex<HashMap<String, AppEvents>>,
}

impl std::fmt::Debug for TransactionEventsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEventsService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionEventsService {
    pub fn new(config: TransactionEventsConfig, stats: Arc<StatsService>) -> Self {
        Self {
            config,
            stats,
            apps: Mutex::new(HashMap::new()),
        }
    }

    fn apps(&self) -> MutexGuard<'_, HashMap<String, AppEvents>> {
        #[allow(clippy::expect_used)]
        self.apps.lock().expect("lock poisoned")
    }

    pub fn harvestable(self: &Arc<Self>, rpm: Arc<RpmService>) -> Arc<TransactionEventHarvestable> {
        Arc::new(TransactionEventHarvestable {
            service: Arc::clone(self),
            rpm,
        })
    }

    /// Events held for `app_name` and transactions seen since the last harvest.
    pub fn pending(&self, app_name: &str) -> (usize, usize) {
        self.apps()
            .get(app_name)
            .map_or((0, 0), |app| (app.reservoir.len(), app.reservoir.seen()))
    }

    fn capacity(&self, app_name: &str) -> usize {
        self.apps()
            .get(app_name)
            .map_or(self.config.max_samples_stored, |app| app.capacity)
    }

    fn set_capacity(&self, app_name: &str, capacity: usize) {
        self.apps()
            .entry(app_name.to_string())
            .or_insert_with(|| AppEvents::new(capacity))
            .capacity = capacity;
    }

    fn take(&self, app_name: &str) -> Option<EventReservoir<Event>> {
        self.apps().get_mut(app_name).map(AppEvents::take)
    }

    fn restore(&self, app_name: &str, seen: usize, events: Vec<Event>) {
        let default = self.config.max_samples_stored;
        self.apps()
            .entry(app_name.to_string())
            .or_insert_with(|| AppEvents::new(default))
            .reservoir
            .restore(seen, events);
    }

    fn record(&self, app_name: &str, name: &str, count: usize) {
        self.stats.do_stats_work(
            app_name,
            StatsWork::increment_counter(name, count as u64),
        );
    }
}

impl TransactionListener for TransactionEventsService {
    fn transaction_finished(&self, data: &TransactionData, _stats: &TransactionStats) {
        if !self.config.enabled {
            return;
        }
        let event = transaction_event(data);
        let default = self.config.max_samples_stored;
        self.apps()
            .entry(data.app_name.clone())
            .or_insert_with(|| AppEvents::new(default))
            .reservoir
            .offer(event);
    }
}

/// Sends one application's transaction events.
pub struct TransactionEventHarvestable {
    service: Arc<TransactionEventsService>,
    rpm: Arc<RpmService>,
}

impl std::fmt::Debug for TransactionEventHarvestable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEventHarvestable")
            .field("app_name", &self.rpm.app_name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Harvestable for TransactionEventHarvestable {
    fn app_name(&self) -> &str {
        self.rpm.app_name()
    }

    fn endpoint(&self) -> &'static str {
        ANALYTIC_EVENT_DATA
    }

    fn max_samples_stored(&self) -> usize {
        self.service.capacity(self.rpm.app_name())
    }

    fn configure(&self, _report_period: Duration, max_samples_stored: usize) {
        self.service
            .set_capacity(self.rpm.app_name(), max_samples_stored);
    }

    async fn harvest(&self) {
        let app = self.rpm.app_name();
        if !self.rpm.is_connected() {
            return;
        }
        let Some(reservoir) = self.service.take(app) else {
            return;
        };
        let seen = reservoir.seen();
        if seen == 0 {
            return;
        }
        let reservoir_size = reservoir.capacity();
        let events = reservoir.into_events();

        match self
            .rpm
            .send_analytics_events(reservoir_size, seen, &events)
            .await
        {
            Ok(()) => {
                self.service
                    .record(app, SUPPORTABILITY_TRANSACTION_EVENTS_SENT, events.len());
                self.service
                    .record(app, SUPPORTABILITY_TRANSACTION_EVENTS_SEEN, seen);
            }
            Err(e) if e.is_retryable() => {
                debug!(
                    "Keeping {} transaction events for {app} after a failed send: {e}",
                    events.len()
                );
                self.service.restore(app, seen, events);
            }
            Err(e) => {
                debug!("Discarding {} transaction events for {app}: {e}", events.len());
                self.service
                    .record(app, SUPPORTABILITY_TRANSACTION_EVENTS_DISCARDED, events.len());
            }
        }
    }
}
