// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric aggregation.
//!
//! Stats are recorded into a [`TransactionStats`] while a transaction runs,
//! merged into the per-application [`StatsEngine`] when it finalizes, and
//! drained from the [`StatsService`] by the harvest.

use crate::naming::Normalizer;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap as StdHashMap;
use std::sync::Mutex;
use std::time::Duration;
use ustr::Ustr;

/// Engines larger than this are cleared instead of carried forward after a failed harvest.
pub const METRIC_LIMIT: usize = 20_000;

/// Keys are interned and never freed. Only names with a bounded set of values
/// belong here; lookups use [`Ustr::from_existing`] so they never intern.
pub type MetricMap<V> = HashMap<Ustr, V, FnvBuildHasher>;

/// Call count and timing values for one metric. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Stats {
    call_count: u64,
    total: f64,
    total_exclusive: f64,
    min: f64,
    max: f64,
    sum_of_squares: f64,
}

impl Stats {
    pub fn record_response_time(&mut self, total: Duration, exclusive: Duration) {
        let value = total.as_secs_f64();
        self.record_value(value);
        self.total_exclusive += exclusive.as_secs_f64();
    }

    pub fn record_data_point(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.record_value(value);
        self.total_exclusive += value;
    }

    pub fn increment_call_count(&mut self, count: u64) {
        self.call_count += count;
    }

    fn record_value(&mut self, value: f64) {
        if self.call_count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.call_count += 1;
        self.total += value;
        self.sum_of_squares += value * value;
    }

    pub fn merge(&mut self, other: &Stats) {
        if other.call_count == 0 && other.total == 0.0 {
            return;
        }
        if self.call_count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else if other.call_count > 0 {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.call_count += other.call_count;
        self.total += other.total;
        self.total_exclusive += other.total_exclusive;
        self.sum_of_squares += other.sum_of_squares;
    }

    pub fn has_data(&self) -> bool {
        self.call_count > 0 || self.total != 0.0
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn total_exclusive(&self) -> f64 {
        self.total_exclusive
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.sum_of_squares
    }
}

/// Flat map of metric name to [`Stats`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimpleStatsEngine {
    stats: MetricMap<Stats>,
}

impl SimpleStatsEngine {
    pub fn get_stats(&mut self, name: &str) -> &mut Stats {
        self.stats.entry(Ustr::from(name)).or_default()
    }

    pub fn stats(&self, name: &str) -> Option<&Stats> {
        self.stats.get(&Ustr::from_existing(name)?)
    }

    pub fn record_response_time(&mut self, name: &str, total: Duration, exclusive: Duration) {
        self.get_stats(name).record_response_time(total, exclusive);
    }

    pub fn merge(&mut self, other: &SimpleStatsEngine) {
        for (name, stats) in &other.stats {
            self.stats.entry(*name).or_default().merge(stats);
        }
    }

    pub fn clear(&mut self) {
        self.stats.clear();
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ustr, &Stats)> {
        self.stats.iter()
    }
}

/// Stats recorded by one activity or one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionStats {
    scoped: SimpleStatsEngine,
    unscoped: SimpleStatsEngine,
}

impl TransactionStats {
    pub fn scoped(&self) -> &SimpleStatsEngine {
        &self.scoped
    }

    pub fn scoped_mut(&mut self) -> &mut SimpleStatsEngine {
        &mut self.scoped
    }

    pub fn unscoped(&self) -> &SimpleStatsEngine {
        &self.unscoped
    }

    pub fn unscoped_mut(&mut self) -> &mut SimpleStatsEngine {
        &mut self.unscoped
    }

    pub fn merge(&mut self, other: &TransactionStats) {
        self.scoped.merge(&other.scoped);
        self.unscoped.merge(&other.unscoped);
    }

    pub fn size(&self) -> usize {
        self.scoped.len() + self.unscoped.len()
    }
}

/// One metric ready to be sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricData {
    #[serde(serialize_with = "serialize_ustr")]
    pub name: Ustr,
    #[serde(serialize_with = "serialize_scope")]
    pub scope: Option<Ustr>,
    pub stats: Stats,
}

fn serialize_ustr<S: Serializer>(value: &Ustr, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_str())
}

fn serialize_scope<S: Serializer>(value: &Option<Ustr>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(scope) => serializer.serialize_some(scope.as_str()),
        None => serializer.serialize_none(),
    }
}

/// Per-application aggregate of unscoped stats and stats scoped by transaction name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsEngine {
    unscoped: SimpleStatsEngine,
    scoped: MetricMap<SimpleStatsEngine>,
}

impl StatsEngine {
    pub fn unscoped_mut(&mut self) -> &mut SimpleStatsEngine {
        &mut self.unscoped
    }

    pub fn unscoped(&self) -> &SimpleStatsEngine {
        &self.unscoped
    }

    pub fn scoped(&self, scope: &str) -> Option<&SimpleStatsEngine> {
        self.scoped.get(&Ustr::from_existing(scope)?)
    }

    pub fn merge_transaction_stats(&mut self, scope: &str, stats: &TransactionStats) {
        self.unscoped.merge(&stats.unscoped);
        if !stats.scoped.is_empty() {
            self.scoped
                .entry(Ustr::from(scope))
                .or_default()
                .merge(&stats.scoped);
        }
    }

    pub fn merge(&mut self, other: &StatsEngine) {
        self.unscoped.merge(&other.unscoped);
        for (scope, engine) in &other.scoped {
            self.scoped.entry(*scope).or_default().merge(engine);
        }
    }

    pub fn clear(&mut self) {
        self.unscoped.clear();
        self.scoped.clear();
    }

    /// Number of distinct metrics across all scopes.
    pub fn size(&self) -> usize {
        self.unscoped.len() + self.scoped.values().map(SimpleStatsEngine::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Metrics with data, names passed through `normalizer`. Names normalized away are dropped.
    pub fn metric_data(&self, normalizer: &dyn Normalizer) -> Vec<MetricData> {
        let mut data = Vec::with_capacity(self.size());
        for (name, stats) in self.unscoped.iter() {
            if !stats.has_data() {
                continue;
            }
            if let Some(normalized) = normalizer.normalize(name.as_str()) {
                data.push(MetricData {
                    name: Ustr::from(normalized.as_str()),
                    scope: None,
                    stats: *stats,
                });
            }
        }
        for (scope, engine) in &self.scoped {
            for (name, stats) in engine.iter() {
                if !stats.has_data() {
                    continue;
                }
                if let Some(normalized) = normalizer.normalize(name.as_str()) {
                    data.push(MetricData {
                        name: Ustr::from(normalized.as_str()),
                        scope: Some(*scope),
                        stats: *stats,
                    });
                }
            }
        }
        data
    }
}

/// A unit of work applied to an application's engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsWork {
    IncrementCounter {
        name: String,
        count: u64,
    },
    RecordResponseTime {
        name: String,
        total: Duration,
        exclusive: Duration,
    },
    RecordDataPoint {
        name: String,
        value: f64,
    },
    MergeTransaction {
        scope: String,
        stats: TransactionStats,
    },
}

impl StatsWork {
    pub fn increment_counter(name: impl Into<String>, count: u64) -> Self {
        StatsWork::IncrementCounter {
            name: name.into(),
            count,
        }
    }

    pub fn record_response_time(name: impl Into<String>, duration: Duration) -> Self {
        StatsWork::RecordResponseTime {
            name: name.into(),
            total: duration,
            exclusive: duration,
        }
    }

    pub fn record_data_point(name: impl Into<String>, value: f64) -> Self {
        StatsWork::RecordDataPoint {
            name: name.into(),
            value,
        }
    }

    fn apply(self, engine: &mut StatsEngine) {
        match self {
            StatsWork::IncrementCounter { name, count } => {
                engine.unscoped.get_stats(&name).increment_call_count(count);
            }
            StatsWork::RecordResponseTime {
                name,
                total,
                exclusive,
            } => engine.unscoped.record_response_time(&name, total, exclusive),
            StatsWork::RecordDataPoint { name, value } => {
                engine.unscoped.get_stats(&name).record_data_point(value);
            }
            StatsWork::MergeTransaction { scope, stats } => {
                engine.merge_transaction_stats(&scope, &stats);
            }
        }
    }
}

/// Per-application stats engines. The lock is held only for one merge or swap.
#[derive(Debug)]
pub struct StatsService {
    default_app: String,
    engines: Mutex<StdHashMap<String, StatsEngine>>,
}

impl StatsService {
    pub fn new(default_app: impl Into<String>) -> Self {
        Self {
            default_app: default_app.into(),
            engines: Mutex::new(StdHashMap::new()),
        }
    }

    pub fn default_app(&self) -> &str {
        &self.default_app
    }

    pub fn do_stats_work(&self, app: &str, work: StatsWork) {
        #[allow(clippy::expect_used)]
        let mut engines = self.engines.lock().expect("lock poisoned");
        work.apply(engines.entry(app.to_string()).or_default());
    }

    /// Records agent self-metrics into the default application.
    pub fn record_supportability(&self, work: StatsWork) {
        let app = self.default_app.clone();
        self.do_stats_work(&app, work);
    }

    pub fn merge_transaction(&self, app: &str, scope: &str, stats: &TransactionStats) {
        #[allow(clippy::expect_used)]
        let mut engines = self.engines.lock().expect("lock poisoned");
        engines
            .entry(app.to_string())
            .or_default()
            .merge_transaction_stats(scope, stats);
    }

    /// Swaps out the accumulated engine for `app`, leaving an empty one for new recordings.
    pub fn take_for_harvest(&self, app: &str) -> StatsEngine {
        #[allow(clippy::expect_used)]
        let mut engines = self.engines.lock().expect("lock poisoned");
        engines
            .get_mut(app)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn apps(&self) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let engines = self.engines.lock().expect("lock poisoned");
        engines.keys().cloned().collect()
    }
}
