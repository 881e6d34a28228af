// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scheduling of metric harvests and of the faster per-datatype harvests.
//!
//! Every application gets one [`HarvestTask`] holding the harvest lock and
//! the engine carried forward from a failed send. In periodic mode the task
//! runs on a fixed interval and harvestables run on the period negotiated at
//! connect. In serverless mode nothing is scheduled; each finished
//! transaction marks its application through an [`ImmediateHarvestTrigger`]
//! and the invocation awaits [`ImmediateHarvestTrigger::flush`] before it
//! returns.

use crate::data_sender::{ServerConfig, SPAN_EVENT_DATA};
use crate::harvestable::Harvestable;
use crate::metric_names::{
    SUPPORTABILITY_CONNECT_MISSING_EVENT_DATA, SUPPORTABILITY_EVENT_HARVEST_REPORT_PERIOD,
    SUPPORTABILITY_HARVEST_SERVICE_RESPONSE_TIME,
};
use crate::rpm_service::{ConnectionListener, HarvestLimitsSource, RpmService};
use apm_transaction::service::HarvestTrigger;
use apm_transaction::stats::{StatsEngine, StatsService, StatsWork, METRIC_LIMIT};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const INITIAL_DELAY: Duration = Duration::from_secs(30);
pub const REPORTING_PERIOD: Duration = Duration::from_secs(60);
pub const MIN_HARVEST_INTERVAL: Duration = Duration::from_secs(55);
const MIN_HARVESTABLE_PERIOD: Duration = Duration::from_secs(1);

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Called around every metric harvest. Errors are logged and the harvest
/// carries on.
pub trait HarvestListener: Send + Sync {
    fn before_harvest(&self, app_name: &str, stats: &mut StatsEngine) -> Result<(), ListenerError>;

    fn after_harvest(&self, _app_name: &str) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestMode {
    Periodic,
    Serverless,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    pub mode: HarvestMode,
    pub initial_delay: Duration,
    pub reporting_period: Duration,
    pub min_harvest_interval: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            mode: HarvestMode::Periodic,
            initial_delay: INITIAL_DELAY,
            reporting_period: REPORTING_PERIOD,
            min_harvest_interval: MIN_HARVEST_INTERVAL,
        }
    }
}

#[derive(Default)]
struct HarvestTaskState {
    carried: StatsEngine,
    last_start: Option<Instant>,
}

struct HarvestTask {
    rpm: Arc<RpmService>,
    state: tokio::sync::Mutex<HarvestTaskState>,
    schedule: Mutex<Option<CancellationToken>>,
}

impl HarvestTask {
    fn new(rpm: Arc<RpmService>) -> Self {
        Self {
            rpm,
            state: tokio::sync::Mutex::new(HarvestTaskState::default()),
            schedule: Mutex::new(None),
        }
    }

    fn schedule(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        #[allow(clippy::expect_used)]
        self.schedule.lock().expect("lock poisoned")
    }

    fn is_scheduled(&self) -> bool {
        self.schedule()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn cancel(&self) {
        if let Some(token) = self.schedule().take() {
            debug!("Cancelling harvest task for {}", self.rpm.app_name());
            token.cancel();
        }
    }

    async fn should_harvest(&self, min_interval: Duration) -> bool {
        self.state
            .lock()
            .await
            .last_start
            .map_or(true, |last| last.elapsed() >= min_interval)
    }

    /// Runs one harvest. Only one harvest per application runs at a time.
    async fn harvest(&self, service: &HarvestInner) {
        let mut state = self.state.lock().await;
        let started = Instant::now();
        state.last_start = Some(started);
        let app = self.rpm.app_name();
        debug!("Starting harvest for {app}");

        let mut engine = service.stats.take_for_harvest(app);
        engine.merge(&std::mem::take(&mut state.carried));

        let listeners = service.listeners();
        for listener in &listeners {
            if let Err(e) = listener.before_harvest(app, &mut engine) {
                debug!("Error harvesting data for {app}: {e}");
            }
        }
        self.rpm.harvest(&mut engine).await;
        for listener in &listeners {
            if let Err(e) = listener.after_harvest(app) {
                debug!("Error harvesting data for {app}: {e}");
            }
        }

        if engine.size() > METRIC_LIMIT {
            engine.clear();
        }
        let elapsed = started.elapsed();
        engine.unscoped_mut().record_response_time(
            SUPPORTABILITY_HARVEST_SERVICE_RESPONSE_TIME,
            elapsed,
            elapsed,
        );
        state.carried = engine;
        debug!("Harvest for {app} took {} milliseconds", elapsed.as_millis());
    }

    async fn carried_size(&self) -> usize {
        self.state.lock().await.carried.size()
    }
}

struct TrackedHarvestable {
    harvestable: Arc<dyn Harvestable>,
    schedule: Option<CancellationToken>,
}

impl TrackedHarvestable {
    fn stop(&mut self) {
        if let Some(token) = self.schedule.take() {
            token.cancel();
        }
    }
}

struct HarvestInner {
    config: HarvestConfig,
    stats: Arc<StatsService>,
    listeners: RwLock<Vec<Arc<dyn HarvestListener>>>,
    tasks: Mutex<HashMap<String, Arc<HarvestTask>>>,
    harvestables: Mutex<Vec<TrackedHarvestable>>,
    shutdown: CancellationToken,
}

impl HarvestInner {
    fn listeners(&self) -> Vec<Arc<dyn HarvestListener>> {
        #[allow(clippy::expect_used)]
        self.listeners.read().expect("lock poisoned").clone()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Arc<HarvestTask>>> {
        #[allow(clippy::expect_used)]
        self.tasks.lock().expect("lock poisoned")
    }

    fn harvestables(&self) -> MutexGuard<'_, Vec<TrackedHarvestable>> {
        #[allow(clippy::expect_used)]
        self.harvestables.lock().expect("lock poisoned")
    }

    /// Harvestables of `app_name` that may store samples.
    fn harvestables_for(&self, app_name: &str) -> Vec<Arc<dyn Harvestable>> {
        self.harvestables()
            .iter()
            .filter(|tracked| {
                tracked.harvestable.app_name() == app_name
                    && tracked.harvestable.max_samples_stored() > 0
            })
            .map(|tracked| Arc::clone(&tracked.harvestable))
            .collect()
    }
}

#[derive(Clone)]
pub struct HarvestService {
    inner: Arc<HarvestInner>,
}

impl std::fmt::Debug for HarvestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestService")
            .field("config", &self.inner.config)
            .field("apps", &self.inner.tasks().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HarvestService {
    pub fn new(config: HarvestConfig, stats: Arc<StatsService>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HarvestInner {
                config,
                stats,
                listeners: RwLock::new(Vec::new()),
                tasks: Mutex::new(HashMap::new()),
                harvestables: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.inner.config
    }

    pub fn add_listener(&self, listener: Arc<dyn HarvestListener>) {
        #[allow(clippy::expect_used)]
        self.inner.listeners.write().expect("lock poisoned").push(listener);
    }

    fn task(&self, rpm: &Arc<RpmService>) -> Arc<HarvestTask> {
        let mut tasks = self.inner.tasks();
        Arc::clone(
            tasks
                .entry(rpm.app_name().to_string())
                .or_insert_with(|| Arc::new(HarvestTask::new(Arc::clone(rpm)))),
        )
    }

    fn task_for(&self, app_name: &str) -> Option<Arc<HarvestTask>> {
        self.inner.tasks().get(app_name).cloned()
    }

    /// Registers the application and, in periodic mode, schedules its
    /// harvest unless one is already scheduled.
    pub fn start_harvest(&self, rpm: &Arc<RpmService>) {
        let task = self.task(rpm);
        if self.inner.config.mode == HarvestMode::Serverless || task.is_scheduled() {
            return;
        }
        debug!("Scheduling harvest task for {}", rpm.app_name());
        let token = self.inner.shutdown.child_token();
        *task.schedule() = Some(token.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let config = inner.config.clone();
            tokio::select! {
                () = tokio::time::sleep(config.initial_delay) => {}
                () = token.cancelled() => return,
            }
            let mut interval = tokio::time::interval(config.reporting_period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if task.should_harvest(config.min_harvest_interval).await {
                            task.harvest(&inner).await;
                        }
                    }
                    () = token.cancelled() => {
                        debug!("Harvest task for {} stopped", task.rpm.app_name());
                        break;
                    }
                }
            }
        });
    }

    pub fn stop_harvest(&self, app_name: &str) {
        if let Some(task) = self.inner.tasks().remove(app_name) {
            task.cancel();
        }
    }

    pub fn add_harvestable(&self, harvestable: Arc<dyn Harvestable>) {
        let mut harvestables = self.inner.harvestables();
        if let Some(existing) = harvestables.iter_mut().find(|tracked| {
            tracked.harvestable.app_name() == harvestable.app_name()
                && tracked.harvestable.endpoint() == harvestable.endpoint()
        }) {
            error!(
                "Harvestable already added to the harvest service: {}/{}",
                harvestable.app_name(),
                harvestable.endpoint()
            );
            existing.stop();
            return;
        }
        harvestables.push(TrackedHarvestable {
            harvestable,
            schedule: None,
        });
    }

    pub fn remove_harvestable(&self, app_name: &str, endpoint: &str) {
        self.inner.harvestables().retain_mut(|tracked| {
            let matches = tracked.harvestable.app_name() == app_name
                && tracked.harvestable.endpoint() == endpoint;
            if matches {
                tracked.stop();
            }
            !matches
        });
    }

    pub fn remove_harvestables_by_app(&self, app_name: &str) {
        self.inner.harvestables().retain_mut(|tracked| {
            let matches = tracked.harvestable.app_name() == app_name;
            if matches {
                tracked.stop();
            }
            !matches
        });
    }

    /// The per-endpoint sample caps for `app_name`, as advertised on connect.
    pub fn event_harvest_limits(&self, app_name: &str) -> HashMap<String, usize> {
        self.inner
            .harvestables()
            .iter()
            .filter(|tracked| tracked.harvestable.app_name() == app_name)
            .map(|tracked| {
                (
                    tracked.harvestable.endpoint().to_string(),
                    tracked.harvestable.max_samples_stored(),
                )
            })
            .collect()
    }

    fn harvest_settings(
        &self,
        app_name: &str,
        harvestable: &dyn Harvestable,
        server: &ServerConfig,
    ) -> (Duration, usize) {
        let endpoint = harvestable.endpoint();
        let mut max_samples = harvestable.max_samples_stored();
        let mut period = self.inner.config.reporting_period;

        if endpoint == SPAN_EVENT_DATA {
            match &server.span_event_harvest_config {
                Some(span_config) => {
                    if let Some(limit) = span_config.harvest_limit {
                        max_samples = usize::try_from(limit).unwrap_or(usize::MAX);
                        if let Some(period_ms) = span_config.report_period_ms {
                            period = Duration::from_millis(period_ms);
                        }
                        debug!(
                            "harvest limit from collector for {endpoint} is: {limit} max samples stored per every {} second harvest",
                            period.as_secs_f32()
                        );
                    }
                }
                None => debug!(
                    "span_event_harvest_config from collector for {endpoint} was null. Using default value: {max_samples} max samples stored per minute"
                ),
            }
            return (period, max_samples);
        }

        match &server.event_harvest_config {
            Some(event_config) => {
                if let Some(limit) = event_config.harvest_limits.get(endpoint) {
                    max_samples = usize::try_from(*limit).unwrap_or(usize::MAX);
                    if let Some(period_ms) = event_config.report_period_ms {
                        period = Duration::from_millis(period_ms);
                    }
                    if max_samples == 0 {
                        info!("harvest limit has been disabled by the collector for {endpoint}");
                    }
                    debug!(
                        "harvest limit from collector for {endpoint} is: {limit} max samples stored per every {} second harvest",
                        period.as_secs_f32()
                    );
                    self.inner.stats.do_stats_work(
                        app_name,
                        StatsWork::record_data_point(
                            SUPPORTABILITY_EVENT_HARVEST_REPORT_PERIOD,
                            period.as_secs_f64(),
                        ),
                    );
                }
            }
            None => debug!(
                "event_harvest_config from collector for {endpoint} was null. Using default value: {max_samples} max samples stored per minute"
            ),
        }
        (period, max_samples)
    }

    /// Configures and schedules the harvestables of `rpm`'s application with
    /// what the collector negotiated.
    pub fn start_harvestables(&self, rpm: &RpmService, server: &ServerConfig) {
        let app_name = rpm.app_name();
        if server.event_harvest_config.is_none() {
            self.inner.stats.do_stats_work(
                app_name,
                StatsWork::increment_counter(SUPPORTABILITY_CONNECT_MISSING_EVENT_DATA, 1),
            );
        }

        let mut harvestables = self.inner.harvestables();
        for tracked in harvestables
            .iter_mut()
            .filter(|tracked| tracked.harvestable.app_name() == app_name)
        {
            tracked.stop();
            let (period, max_samples) =
                self.harvest_settings(app_name, tracked.harvestable.as_ref(), server);
            tracked.harvestable.configure(period, max_samples);
            if max_samples == 0 || self.inner.config.mode == HarvestMode::Serverless {
                continue;
            }

            let token = self.inner.shutdown.child_token();
            tracked.schedule = Some(token.clone());
            let harvestable = Arc::clone(&tracked.harvestable);
            let period = period.max(MIN_HARVESTABLE_PERIOD);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => harvestable.harvest().await,
                        () = token.cancelled() => break,
                    }
                }
            });
        }
    }

    pub fn stop_harvestables(&self, app_name: &str) {
        for tracked in self
            .inner
            .harvestables()
            .iter_mut()
            .filter(|tracked| tracked.harvestable.app_name() == app_name)
        {
            tracked.stop();
        }
    }

    /// Runs every application's harvestables and then its metric harvest.
    /// Applications that are not connected are skipped.
    pub async fn harvest_now(&self) {
        let tasks: Vec<Arc<HarvestTask>> = self.inner.tasks().values().cloned().collect();
        for task in tasks {
            self.harvest_task_now(&task).await;
        }
    }

    /// Harvests one application right away, as after a serverless invocation.
    pub async fn harvest_app_now(&self, app_name: &str) {
        match self.task_for(app_name) {
            Some(task) => self.harvest_task_now(&task).await,
            None => debug!("No harvest registered for {app_name}"),
        }
    }

    async fn harvest_task_now(&self, task: &HarvestTask) {
        let app = task.rpm.app_name();
        if !task.rpm.is_connected() {
            debug!("Skipping harvest for {app}: not connected");
            return;
        }
        for harvestable in self.inner.harvestables_for(app) {
            harvestable.harvest().await;
        }
        info!("Sending metrics for {app} immediately");
        task.harvest(&self.inner).await;
    }

    /// Harvests once more, bounded by `timeout`, then cancels every schedule.
    pub async fn stop_with_final_harvest(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.harvest_now()).await.is_err() {
            warn!("Final harvest did not complete within {} ms", timeout.as_millis());
        }
        self.stop();
    }

    pub fn stop(&self) {
        let tasks: Vec<Arc<HarvestTask>> = self.inner.tasks().values().cloned().collect();
        for task in tasks {
            task.cancel();
        }
        for tracked in self.inner.harvestables().iter_mut() {
            tracked.stop();
        }
    }

    /// Size of the engine carried into `app_name`'s next harvest.
    pub async fn carried_metric_count(&self, app_name: &str) -> Option<usize> {
        let task = self.task_for(app_name)?;
        Some(task.carried_size().await)
    }

    /// Starts the task that serves immediate harvest requests until
    /// `shutdown` is cancelled. Requests for the same application coalesce
    /// into one harvest.
    pub fn spawn_immediate_harvester(
        &self,
        shutdown: CancellationToken,
    ) -> (Arc<ImmediateHarvestTrigger>, JoinHandle<()>) {
        let trigger = Arc::new(ImmediateHarvestTrigger {
            service: self.clone(),
            pending: Mutex::new(HashSet::new()),
            requested: Notify::new(),
            draining: tokio::sync::Mutex::new(()),
        });
        let driver = Arc::clone(&trigger);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = driver.requested.notified() => driver.flush().await,
                    () = shutdown.cancelled() => {
                        debug!("Immediate harvester received shutdown signal");
                        break;
                    }
                }
            }
        });
        (trigger, handle)
    }
}

impl ConnectionListener for HarvestService {
    fn connected(&self, rpm: &Arc<RpmService>, config: &ServerConfig) {
        self.start_harvest(rpm);
        self.start_harvestables(rpm, config);
    }

    fn disconnected(&self, rpm: &RpmService) {
        self.stop_harvestables(rpm.app_name());
    }
}

impl HarvestLimitsSource for HarvestService {
    fn event_harvest_limits(&self, app_name: &str) -> HashMap<String, usize> {
        HarvestService::event_harvest_limits(self, app_name)
    }
}

/// Marks applications with finished transactions for harvest.
///
/// Marking never blocks the finishing thread. The background driver picks
/// marked applications up, and [`ImmediateHarvestTrigger::flush`] harvests
/// them in the caller's task, so a serverless invocation can await its data
/// being sent before it returns.
pub struct ImmediateHarvestTrigger {
    service: HarvestService,
    pending: Mutex<HashSet<String>>,
    requested: Notify,
    draining: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ImmediateHarvestTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateHarvestTrigger")
            .field("pending", &*self.pending())
            .finish_non_exhaustive()
    }
}

impl ImmediateHarvestTrigger {
    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        #[allow(clippy::expect_used)]
        self.pending.lock().expect("lock poisoned")
    }

    /// Applications waiting for a harvest.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Harvests every marked application and returns once the data is sent.
    /// A harvest already started by the driver is waited for.
    pub async fn flush(&self) {
        let _draining = self.draining.lock().await;
        let apps: Vec<String> = self.pending().drain().collect();
        for app_name in apps {
            self.service.harvest_app_now(&app_name).await;
        }
    }
}

impl HarvestTrigger for ImmediateHarvestTrigger {
    fn harvest_now(&self, app_name: &str) {
        let newly_marked = self.pending().insert(app_name.to_string());
        if newly_marked {
            self.requested.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sender::{SpanEventHarvestConfig, ANALYTIC_EVENT_DATA};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHarvestable {
        app: String,
        endpoint: &'static str,
        max_samples: AtomicUsize,
        harvests: AtomicUsize,
    }

    impl CountingHarvestable {
        fn new(app: &str, endpoint: &'static str, max_samples: usize) -> Arc<Self> {
            Arc::new(Self {
                app: app.to_string(),
                endpoint,
                max_samples: AtomicUsize::new(max_samples),
                harvests: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Harvestable for CountingHarvestable {
        fn app_name(&self) -> &str {
            &self.app
        }

        fn endpoint(&self) -> &'static str {
            self.endpoint
        }

        fn max_samples_stored(&self) -> usize {
            self.max_samples.load(Ordering::Relaxed)
        }

        fn configure(&self, _report_period: Duration, max_samples_stored: usize) {
            self.max_samples.store(max_samples_stored, Ordering::Relaxed);
        }

        async fn harvest(&self) {
            self.harvests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn service(mode: HarvestMode) -> HarvestService {
        HarvestService::new(
            HarvestConfig {
                mode,
                ..HarvestConfig::default()
            },
            Arc::new(StatsService::new("app")),
            CancellationToken::new(),
        )
    }

    #[test]
    fn default_schedule() {
        let config = HarvestConfig::default();
        assert_eq!(config.mode, HarvestMode::Periodic);
        assert_eq!(config.initial_delay, Duration::from_secs(30));
        assert_eq!(config.reporting_period, Duration::from_secs(60));
        assert_eq!(config.min_harvest_interval, Duration::from_secs(55));
    }

    #[test]
    fn limits_are_reported_per_app() {
        let service = service(HarvestMode::Serverless);
        service.add_harvestable(CountingHarvestable::new("app", ANALYTIC_EVENT_DATA, 2000));
        service.add_harvestable(CountingHarvestable::new("app", SPAN_EVENT_DATA, 1000));
        service.add_harvestable(CountingHarvestable::new("other", ANALYTIC_EVENT_DATA, 10));

        let limits = service.event_harvest_limits("app");
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[ANALYTIC_EVENT_DATA], 2000);
        assert_eq!(limits[SPAN_EVENT_DATA], 1000);

        service.remove_harvestables_by_app("app");
        assert!(service.event_harvest_limits("app").is_empty());
        assert_eq!(service.event_harvest_limits("other").len(), 1);
    }

    #[test]
    fn duplicate_harvestable_keeps_the_first() {
        let service = service(HarvestMode::Serverless);
        service.add_harvestable(CountingHarvestable::new("app", ANALYTIC_EVENT_DATA, 2000));
        service.add_harvestable(CountingHarvestable::new("app", ANALYTIC_EVENT_DATA, 5));
        assert_eq!(service.event_harvest_limits("app")[ANALYTIC_EVENT_DATA], 2000);

        service.remove_harvestable("app", ANALYTIC_EVENT_DATA);
        assert!(service.event_harvest_limits("app").is_empty());
    }

    #[test]
    fn span_limit_comes_from_span_config() {
        let service = service(HarvestMode::Serverless);
        let span = CountingHarvestable::new("app", SPAN_EVENT_DATA, 2000);
        let server = ServerConfig {
            span_event_harvest_config: Some(SpanEventHarvestConfig {
                report_period_ms: Some(60_000),
                harvest_limit: Some(166),
            }),
            ..ServerConfig::default()
        };
        let (period, max_samples) = service.harvest_settings("app", span.as_ref(), &server);
        assert_eq!(period, Duration::from_secs(60));
        assert_eq!(max_samples, 166);

        let (_, max_samples) =
            service.harvest_settings("app", span.as_ref(), &ServerConfig::default());
        assert_eq!(max_samples, 2000);
    }

    #[test]
    fn missing_event_limit_keeps_local_settings() {
        let service = service(HarvestMode::Serverless);
        let events = CountingHarvestable::new("app", ANALYTIC_EVENT_DATA, 2000);
        let (period, max_samples) =
            service.harvest_settings("app", events.as_ref(), &ServerConfig::default());
        assert_eq!(period, REPORTING_PERIOD);
        assert_eq!(max_samples, 2000);
    }

    #[tokio::test]
    async fn trigger_is_inert_after_harvester_stops() {
        let service = service(HarvestMode::Serverless);
        let shutdown = CancellationToken::new();
        let (trigger, handle) = service.spawn_immediate_harvester(shutdown.clone());
        trigger.harvest_now("app");
        shutdown.cancel();
        handle.await.unwrap();
        trigger.harvest_now("app");
    }
}
