// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::TransactionConfig;
use crate::context::ExecutionContext;
use crate::error::TransactionError;
use crate::metric_names::SUPPORTABILITY_TRANSACTION_CANCELLED;
use crate::naming::NormalizerRegistry;
use crate::sources::{CpuTimeSource, GcTimeSource, Unsupported};
use crate::stats::{StatsService, StatsWork, TransactionStats};
use crate::transaction::{CancelledTransaction, Finalization, Transaction, TransactionData, TransactionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Observer of transaction lifecycle events.
///
/// Called on the thread that made the transaction start or finish, with no
/// transaction lock held.
pub trait TransactionListener: Send + Sync {
    fn transaction_started(&self, _transaction: &Transaction) {}

    fn transaction_finished(&self, data: &TransactionData, stats: &TransactionStats);

    fn transaction_cancelled(&self, _cancelled: &CancelledTransaction) {}
}

/// Requests a harvest as soon as possible. Used when every finished
/// transaction must be reported right away.
pub trait HarvestTrigger: Send + Sync {
    fn harvest_now(&self, app_name: &str);
}

pub trait Sampler: Send + Sync {
    fn compute_sampled(&self) -> bool;
}

/// Samples a fixed share of transactions.
#[derive(Debug, Clone, Copy)]
pub struct RatioSampler {
    ratio: f64,
}

impl RatioSampler {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for RatioSampler {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl Sampler for RatioSampler {
    fn compute_sampled(&self) -> bool {
        rand::random::<f64>() < self.ratio
    }
}

/// Host measurements and sampling used by every transaction of a service.
#[derive(Clone)]
pub struct Sources {
    pub cpu: Option<Arc<dyn CpuTimeSource>>,
    pub gc: Arc<dyn GcTimeSource>,
    pub sampler: Arc<dyn Sampler>,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            cpu: None,
            gc: Arc::new(Unsupported),
            sampler: Arc::new(RatioSampler::default()),
        }
    }
}

/// State shared by the service and every transaction it creates.
pub(crate) struct TransactionEnv {
    pub(crate) config: TransactionConfig,
    pub(crate) stats: Arc<StatsService>,
    pub(crate) normalizers: Arc<NormalizerRegistry>,
    pub(crate) gc: Arc<dyn GcTimeSource>,
    pub(crate) sampler: Arc<dyn Sampler>,
    cpu: Option<Arc<dyn CpuTimeSource>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    harvest_trigger: RwLock<Option<Arc<dyn HarvestTrigger>>>,
    in_flight: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionEnv {
    pub(crate) fn default_app(&self) -> &str {
        self.stats.default_app()
    }

    pub(crate) fn cpu_source(&self) -> Option<Arc<dyn CpuTimeSource>> {
        if self.config.thread_cpu_time_enabled {
            self.cpu.clone()
        } else {
            None
        }
    }

    pub(crate) fn record_supportability(&self, work: StatsWork) {
        self.stats.record_supportability(work);
    }

    fn listeners(&self) -> Vec<Arc<dyn TransactionListener>> {
        #[allow(clippy::expect_used)]
        self.listeners.read().expect("lock poisoned").clone()
    }

    fn harvest_trigger(&self) -> Option<Arc<dyn HarvestTrigger>> {
        #[allow(clippy::expect_used)]
        self.harvest_trigger.read().expect("lock poisoned").clone()
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, Arc<Transaction>>> {
        #[allow(clippy::expect_used)]
        self.in_flight.lock().expect("lock poisoned")
    }

    pub(crate) fn transaction_began(&self, transaction: &Arc<Transaction>) {
        self.in_flight().insert(transaction.id(), Arc::clone(transaction));
        for listener in self.listeners() {
            listener.transaction_started(transaction);
        }
    }

    /// Hands a finalized transaction to the stats sink and listeners.
    pub(crate) fn complete(&self, outcome: Option<Finalization>) {
        let Some(outcome) = outcome else {
            return;
        };
        match outcome {
            Finalization::Finished(data, stats) => {
                self.in_flight().remove(&data.id);
                self.stats.merge_transaction(&data.app_name, &data.name, &stats);
                for listener in self.listeners() {
                    listener.transaction_finished(&data, &stats);
                }
                if self.config.immediate_harvest {
                    match self.harvest_trigger() {
                        Some(trigger) => trigger.harvest_now(&data.app_name),
                        None => debug!("No harvest trigger installed for {}", data.app_name),
                    }
                }
            }
            Finalization::Cancelled(cancelled) => {
                self.in_flight().remove(&cancelled.id);
                self.record_supportability(StatsWork::increment_counter(
                    SUPPORTABILITY_TRANSACTION_CANCELLED,
                    1,
                ));
                for listener in self.listeners() {
                    listener.transaction_cancelled(&cancelled);
                }
            }
        }
    }
}

/// Creates execution contexts and owns everything their transactions share.
#[derive(Clone)]
pub struct TransactionService {
    env: Arc<TransactionEnv>,
}

impl TransactionService {
    pub fn new(
        config: TransactionConfig,
        stats: Arc<StatsService>,
        normalizers: Arc<NormalizerRegistry>,
    ) -> Result<Self, TransactionError> {
        Self::with_sources(config, stats, normalizers, Sources::default())
    }

    pub fn with_sources(
        config: TransactionConfig,
        stats: Arc<StatsService>,
        normalizers: Arc<NormalizerRegistry>,
        sources: Sources,
    ) -> Result<Self, TransactionError> {
        config.validate()?;
        Ok(Self {
            env: Arc::new(TransactionEnv {
                config,
                stats,
                normalizers,
                gc: sources.gc,
                sampler: sources.sampler,
                cpu: sources.cpu,
                listeners: RwLock::new(Vec::new()),
                harvest_trigger: RwLock::new(None),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.env.config
    }

    pub fn stats_service(&self) -> &Arc<StatsService> {
        &self.env.stats
    }

    pub fn normalizers(&self) -> &Arc<NormalizerRegistry> {
        &self.env.normalizers
    }

    pub fn context(&self, name: impl Into<String>) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(&self.env), name.into())
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        #[allow(clippy::expect_used)]
        self.env.listeners.write().expect("lock poisoned").push(listener);
    }

    pub fn set_harvest_trigger(&self, trigger: Arc<dyn HarvestTrigger>) {
        #[allow(clippy::expect_used)]
        let mut current = self.env.harvest_trigger.write().expect("lock poisoned");
        *current = Some(trigger);
    }

    /// Started transactions that have not finalized yet.
    pub fn in_flight(&self) -> Vec<Arc<Transaction>> {
        self.env.in_flight().values().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.env.in_flight().len()
    }

    /// Runs the segment and token timeout checks over every in-flight transaction.
    pub fn check_expirations(&self) {
        let now = Instant::now();
        for transaction in self.in_flight() {
            transaction.check_expire(now);
        }
    }

    /// Spawns the periodic expiration sweep. Runs until `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        let period = self.env.config.expiration_check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        service.check_expirations();
                    }
                    () = shutdown.cancelled() => {
                        debug!("Transaction expiration sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::TracerSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTrigger(AtomicUsize);

    impl HarvestTrigger for CountingTrigger {
        fn harvest_now(&self, _app_name: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct StartCounter(AtomicUsize);

    impl TransactionListener for StartCounter {
        fn transaction_started(&self, _transaction: &Transaction) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn transaction_finished(&self, _data: &TransactionData, _stats: &TransactionStats) {}
    }

    fn service_with(config: TransactionConfig) -> TransactionService {
        TransactionService::new(
            config,
            Arc::new(StatsService::new("app")),
            Arc::new(NormalizerRegistry::default()),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = TransactionService::new(
            TransactionConfig {
                token_timeout: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(StatsService::new("app")),
            Arc::new(NormalizerRegistry::default()),
        );
        assert!(matches!(result, Err(TransactionError::InvalidConfig(_))));
    }

    #[test]
    fn immediate_harvest_triggers_per_transaction() {
        let service = service_with(TransactionConfig {
            immediate_harvest: true,
            ..Default::default()
        });
        let trigger = Arc::new(CountingTrigger::default());
        service.set_harvest_trigger(trigger.clone());

        for _ in 0..3 {
            let mut ctx = service.context("main");
            let root = ctx.tracer_started(TracerSpec::new("Job/run").initiator()).unwrap();
            ctx.tracer_finished(root);
        }
        assert_eq!(trigger.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn started_listener_and_registry() {
        let service = service_with(TransactionConfig::default());
        let counter = Arc::new(StartCounter::default());
        service.add_listener(counter.clone());

        let mut ctx = service.context("main");
        let root = ctx.tracer_started(TracerSpec::new("Job/run").initiator()).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(service.in_flight_count(), 1);
        ctx.tracer_finished(root);
        assert_eq!(service.in_flight_count(), 0);
    }

    #[test]
    fn cancelled_transactions_are_counted() {
        let service = service_with(TransactionConfig::default());
        let mut ctx = service.context("main");
        let root = ctx.tracer_started(TracerSpec::new("Job/run").initiator()).unwrap();
        ctx.ignore_transaction();
        ctx.tracer_finished(root);

        let engine = service.stats_service().take_for_harvest("app");
        let cancelled = engine
            .unscoped()
            .stats(SUPPORTABILITY_TRANSACTION_CANCELLED)
            .unwrap();
        assert_eq!(cancelled.call_count(), 1);
    }

    #[tokio::test]
    async fn sweeper_expires_idle_tokens() {
        let service = service_with(TransactionConfig {
            token_timeout: Duration::from_millis(20),
            expiration_check_interval: Duration::from_millis(5),
            ..Default::default()
        });
        let mut ctx = service.context("main");
        let root = ctx.tracer_started(TracerSpec::new("Job/run").initiator()).unwrap();
        let token = ctx.get_token();
        ctx.tracer_finished(root);
        assert_eq!(service.in_flight_count(), 1);

        let shutdown = CancellationToken::new();
        let sweeper = service.spawn_sweeper(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        sweeper.await.unwrap();

        assert!(!token.is_active());
        assert_eq!(service.in_flight_count(), 0);
    }
}
