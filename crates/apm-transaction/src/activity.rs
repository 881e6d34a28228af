// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One execution context's contribution to a transaction.
//!
//! An activity is owned by the execution context running it. It only reaches
//! its transaction's lock when it starts, finishes or fails, so pushing and
//! popping spans never contends with other contexts.

use crate::counts::TransactionCounts;
use crate::sources::CpuTimeSource;
use crate::stats::TransactionStats;
use crate::tracer::{SpanRef, TraceSegment, Tracer, TracerId, TracerSpec};
use crate::transaction::TransactionId;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActivityId(pub u32);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerStart {
    Rejected,
    Started(TracerId),
    /// The span became the activity's root.
    RootStarted(TracerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerFinish {
    Popped,
    /// The root span finished; the activity is done.
    ActivityFinished,
    /// The span was not on top of the stack. The activity is aborted.
    Inconsistent,
}

/// An outstanding flyweight measurement.
#[derive(Debug)]
#[must_use]
pub struct Flyweight {
    parent: TracerId,
    start: Instant,
}

pub struct TransactionActivity {
    id: ActivityId,
    owner: TransactionId,
    counts: Arc<TransactionCounts>,
    cpu_source: Option<Arc<dyn CpuTimeSource>>,
    context_name: String,
    tracers: Vec<Tracer>,
    root: Option<TracerId>,
    last: Option<TracerId>,
    root_parent: Option<SpanRef>,
    tracer_start_lock: i32,
    flyweight_in_progress: bool,
    stats: TransactionStats,
    cpu_start: Option<Duration>,
    total_cpu: Option<Duration>,
    cpu_recorded: bool,
    done: bool,
    ignored: bool,
    owner_ignored: bool,
    started_at: Instant,
    finished_at: Option<Instant>,
}

impl fmt::Debug for TransactionActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionActivity")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("context", &self.context_name)
            .field("tracers", &self.tracers.len())
            .field("last", &self.last)
            .field("done", &self.done)
            .field("ignored", &self.ignored)
            .finish()
    }
}

impl TransactionActivity {
    pub(crate) fn new(
        id: ActivityId,
        owner: TransactionId,
        counts: Arc<TransactionCounts>,
        cpu_source: Option<Arc<dyn CpuTimeSource>>,
        context_name: &str,
        now: Instant,
    ) -> Self {
        let cpu_start = cpu_source
            .as_ref()
            .and_then(|source| source.current_cpu_time());
        Self {
            id,
            owner,
            counts,
            cpu_source,
            context_name: context_name.to_string(),
            tracers: Vec::new(),
            root: None,
            last: None,
            root_parent: None,
            tracer_start_lock: 0,
            flyweight_in_progress: false,
            stats: TransactionStats::default(),
            cpu_start,
            total_cpu: None,
            cpu_recorded: false,
            done: false,
            ignored: false,
            owner_ignored: false,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn owner(&self) -> TransactionId {
        self.owner
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    pub fn is_started(&self) -> bool {
        self.root.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored || self.owner_ignored
    }

    /// Discards this activity's data when it completes.
    pub fn set_ignored(&mut self) {
        self.ignored = true;
    }

    pub(crate) fn set_owner_ignored(&mut self) {
        self.owner_ignored = true;
    }

    pub fn root_tracer(&self) -> Option<&Tracer> {
        self.root.map(|id| &self.tracers[id.0 as usize])
    }

    pub(crate) fn root_tracer_mut(&mut self) -> Option<&mut Tracer> {
        self.root.map(|id| &mut self.tracers[id.0 as usize])
    }

    pub fn last_tracer(&self) -> Option<&Tracer> {
        self.last.map(|id| &self.tracers[id.0 as usize])
    }

    pub fn tracer(&self, id: TracerId) -> Option<&Tracer> {
        self.tracers.get(id.0 as usize)
    }

    pub(crate) fn tracer_mut(&mut self, id: TracerId) -> Option<&mut Tracer> {
        self.tracers.get_mut(id.0 as usize)
    }

    pub fn tracers(&self) -> &[Tracer] {
        &self.tracers
    }

    /// Span this activity continues, when it was linked through a token or is a segment.
    pub fn root_parent(&self) -> Option<SpanRef> {
        self.root_parent
    }

    pub(crate) fn set_root_parent(&mut self, parent: SpanRef) {
        self.root_parent = Some(parent);
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TransactionStats {
        &mut self.stats
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub(crate) fn counts(&self) -> &Arc<TransactionCounts> {
        &self.counts
    }

    /// True while a flyweight measurement is outstanding or the top span cannot have children.
    pub fn is_leaf(&self) -> bool {
        self.flyweight_in_progress || self.last_tracer().is_some_and(Tracer::is_leaf)
    }

    pub fn lock_tracer_start(&mut self) {
        self.tracer_start_lock -= 1;
    }

    pub fn unlock_tracer_start(&mut self) {
        self.tracer_start_lock += 1;
    }

    pub fn is_tracer_start_locked(&self) -> bool {
        self.tracer_start_lock < 0
    }

    /// Takes the start lock if a span could be started right now.
    pub fn check_tracer_start(&mut self) -> bool {
        if self.is_tracer_start_locked() || self.is_leaf() || self.is_ignored() {
            return false;
        }
        self.lock_tracer_start();
        true
    }

    pub fn tracer_started(&mut self, spec: TracerSpec, now: Instant) -> TracerStart {
        if self.done || self.is_tracer_start_locked() {
            return TracerStart::Rejected;
        }

        match self.last {
            None => {
                if self.root.is_some() || !spec.flags.initiator {
                    return TracerStart::Rejected;
                }
                let id = self.push(None, spec, now);
                self.root = Some(id);
                TracerStart::RootStarted(id)
            }
            Some(parent) => {
                if self.is_leaf() {
                    return TracerStart::Rejected;
                }
                TracerStart::Started(self.push(Some(parent), spec, now))
            }
        }
    }

    fn push(&mut self, parent: Option<TracerId>, spec: TracerSpec, now: Instant) -> TracerId {
        let id = TracerId(self.tracers.len() as u32);
        let mut tracer = Tracer::new(id, parent, spec, now);
        if tracer.is_transaction_segment() {
            self.counts.add_tracer();
            if self.counts.is_over_segment_limit() {
                tracer.remove_transaction_segment();
            }
        }
        self.tracers.push(tracer);
        self.last = Some(id);
        id
    }

    pub fn tracer_finished(&mut self, id: TracerId, now: Instant) -> TracerFinish {
        if self.last != Some(id) {
            error!(
                "Inconsistent state! tracer {:?} != last tracer {:?} in activity {} of transaction {}",
                id, self.last, self.id, self.owner
            );
            self.done = true;
            self.last = None;
            return TracerFinish::Inconsistent;
        }

        let index = id.0 as usize;
        let tracer = &mut self.tracers[index];
        let duration = tracer.finish(now);
        let exclusive = tracer.exclusive_duration();
        let parent = tracer.parent();

        let tracer = &self.tracers[index];
        self.stats
            .scoped_mut()
            .record_response_time(tracer.metric_name(), duration, exclusive);
        for rollup in tracer.rollup_metric_names() {
            self.stats
                .unscoped_mut()
                .record_response_time(rollup, duration, exclusive);
        }

        match parent {
            Some(parent) => {
                self.tracers[parent.0 as usize].child_finished(duration);
                self.last = Some(parent);
                TracerFinish::Popped
            }
            None => {
                self.last = None;
                self.finished(now);
                TracerFinish::ActivityFinished
            }
        }
    }

    fn finished(&mut self, now: Instant) {
        self.record_cpu();
        self.finished_at = Some(now);
        self.done = true;
    }

    /// Finishes every open span, innermost first.
    pub(crate) fn finish_all(&mut self, now: Instant, truncated: bool) {
        while let Some(last) = self.last {
            if truncated {
                self.tracers[last.0 as usize].set_truncated();
            }
            if self.tracer_finished(last, now) != TracerFinish::Popped {
                break;
            }
        }
    }

    pub fn start_flyweight(&mut self, now: Instant) -> Option<Flyweight> {
        if self.root.is_none() || self.flyweight_in_progress || self.is_leaf() {
            return None;
        }
        let parent = self.last?;
        self.flyweight_in_progress = true;
        Some(Flyweight { parent, start: now })
    }

    pub fn finish_flyweight(
        &mut self,
        flyweight: Flyweight,
        metric_name: &str,
        rollup_metric_names: &[&str],
        end: Instant,
    ) {
        self.flyweight_in_progress = false;
        let Some(duration) = end.checked_duration_since(flyweight.start) else {
            debug!("Dropping flyweight {} with negative duration", metric_name);
            return;
        };
        self.stats
            .scoped_mut()
            .record_response_time(metric_name, duration, duration);
        for rollup in rollup_metric_names {
            self.stats
                .unscoped_mut()
                .record_response_time(rollup, duration, duration);
        }
        if let Some(parent) = self.tracers.get_mut(flyweight.parent.0 as usize) {
            parent.child_finished(duration);
        }
    }

    fn record_cpu(&mut self) {
        if self.cpu_recorded {
            return;
        }
        self.cpu_recorded = true;
        let end = self
            .cpu_source
            .as_ref()
            .and_then(|source| source.current_cpu_time());
        self.total_cpu = match (self.cpu_start, end) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        };
    }

    /// `None` when CPU time was not measured.
    pub fn total_cpu_time(&self) -> Option<Duration> {
        self.total_cpu
    }

    pub(crate) fn set_total_cpu_time(&mut self, cpu: Option<Duration>) {
        self.cpu_recorded = true;
        self.total_cpu = cpu;
    }

    pub fn root_is_segment(&self) -> bool {
        self.root_tracer()
            .is_some_and(Tracer::is_transaction_segment)
    }

    /// Moves this activity to another transaction under a new id.
    pub(crate) fn reparent(
        &mut self,
        owner: TransactionId,
        id: ActivityId,
        counts: Arc<TransactionCounts>,
        parent: SpanRef,
    ) {
        self.owner = owner;
        self.id = id;
        self.counts = counts;
        self.root_parent = Some(parent);

        if self.counts.is_over_segment_limit() {
            if let Some(root) = self.root_tracer_mut() {
                root.remove_transaction_segment();
            }
        } else {
            let segments = self
                .tracers
                .iter()
                .filter(|tracer| tracer.is_transaction_segment())
                .count();
            self.counts.add_tracers(segments);
        }
    }

    /// Spans kept for the transaction trace. Empty when the root was demoted to metrics only.
    pub fn trace_segments(&self, transaction_start: Instant) -> Vec<TraceSegment> {
        if !self.root_is_segment() {
            return Vec::new();
        }
        self.tracers
            .iter()
            .filter(|tracer| tracer.is_transaction_segment() && tracer.is_finished())
            .map(|tracer| TraceSegment::from_tracer(self.id, tracer, transaction_start))
            .collect()
    }

    /// Root span duration, zero until finished.
    pub fn duration(&self) -> Duration {
        self.root_tracer().map(Tracer::duration).unwrap_or_default()
    }
}
