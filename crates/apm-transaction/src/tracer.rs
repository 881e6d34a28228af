// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spans measured within one activity.

use crate::activity::ActivityId;
use crate::attributes::AttributeMap;
use crate::dispatcher::DispatcherSpec;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Index of a span inside its activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TracerId(pub u32);

/// A span in some activity, possibly of another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SpanRef {
    pub activity: ActivityId,
    pub tracer: TracerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerFlags {
    /// May begin a transaction or an activity.
    pub initiator: bool,
    /// Cannot have children.
    pub leaf: bool,
    /// Root of work that will be linked to a transaction through a token.
    pub is_async: bool,
    /// Kept in the transaction trace, not only aggregated into metrics.
    pub transaction_segment: bool,
}

impl Default for TracerFlags {
    fn default() -> Self {
        Self {
            initiator: false,
            leaf: false,
            is_async: false,
            transaction_segment: true,
        }
    }
}

/// What the instrumentation hands over when a call starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TracerSpec {
    pub metric_name: String,
    pub rollup_metric_names: Vec<String>,
    pub flags: TracerFlags,
    pub dispatcher: Option<DispatcherSpec>,
}

impl TracerSpec {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            rollup_metric_names: Vec::new(),
            flags: TracerFlags::default(),
            dispatcher: None,
        }
    }

    /// A root span that starts a web or background transaction.
    pub fn dispatcher(metric_name: impl Into<String>, dispatcher: DispatcherSpec) -> Self {
        let mut spec = Self::new(metric_name);
        spec.flags.initiator = true;
        spec.dispatcher = Some(dispatcher);
        spec
    }

    pub fn initiator(mut self) -> Self {
        self.flags.initiator = true;
        self
    }

    pub fn leaf(mut self) -> Self {
        self.flags.leaf = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.flags.initiator = true;
        self.flags.is_async = true;
        self
    }

    pub fn metrics_only(mut self) -> Self {
        self.flags.transaction_segment = false;
        self
    }

    pub fn with_rollup(mut self, name: impl Into<String>) -> Self {
        self.rollup_metric_names.push(name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Tracer {
    id: TracerId,
    parent: Option<TracerId>,
    metric_name: String,
    rollup_metric_names: Vec<String>,
    flags: TracerFlags,
    dispatcher: Option<DispatcherSpec>,
    start: Instant,
    end: Option<Instant>,
    child_duration: Duration,
    truncated: bool,
    agent_attributes: AttributeMap,
}

impl Tracer {
    pub(crate) fn new(id: TracerId, parent: Option<TracerId>, spec: TracerSpec, start: Instant) -> Self {
        Self {
            id,
            parent,
            metric_name: spec.metric_name,
            rollup_metric_names: spec.rollup_metric_names,
            flags: spec.flags,
            dispatcher: spec.dispatcher,
            start,
            end: None,
            child_duration: Duration::ZERO,
            truncated: false,
            agent_attributes: AttributeMap::new(),
        }
    }

    pub fn id(&self) -> TracerId {
        self.id
    }

    pub fn parent(&self) -> Option<TracerId> {
        self.parent
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn rollup_metric_names(&self) -> &[String] {
        &self.rollup_metric_names
    }

    pub fn flags(&self) -> TracerFlags {
        self.flags
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.leaf
    }

    pub fn is_transaction_segment(&self) -> bool {
        self.flags.transaction_segment
    }

    pub(crate) fn remove_transaction_segment(&mut self) {
        self.flags.transaction_segment = false;
    }

    pub fn dispatcher(&self) -> Option<&DispatcherSpec> {
        self.dispatcher.as_ref()
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    pub(crate) fn finish(&mut self, end: Instant) -> Duration {
        self.end = Some(end);
        self.duration()
    }

    /// Zero until finished.
    pub fn duration(&self) -> Duration {
        self.end
            .map(|end| end.saturating_duration_since(self.start))
            .unwrap_or_default()
    }

    pub fn exclusive_duration(&self) -> Duration {
        self.duration().saturating_sub(self.child_duration)
    }

    pub(crate) fn child_finished(&mut self, duration: Duration) {
        self.child_duration += duration;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn set_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn agent_attributes(&self) -> &AttributeMap {
        &self.agent_attributes
    }

    pub fn set_agent_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.agent_attributes.insert(key.to_string(), value.into());
    }

    pub(crate) fn remove_agent_attribute(&mut self, key: &str) {
        self.agent_attributes.remove(key);
    }
}

/// A finished span as it appears in the transaction trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSegment {
    pub activity: ActivityId,
    pub id: TracerId,
    pub parent: Option<TracerId>,
    pub metric_name: String,
    /// Offset from the transaction start.
    pub start_offset: Duration,
    pub duration: Duration,
    pub exclusive_duration: Duration,
    pub truncated: bool,
    pub attributes: AttributeMap,
}

impl TraceSegment {
    pub(crate) fn from_tracer(activity: ActivityId, tracer: &Tracer, transaction_start: Instant) -> Self {
        Self {
            activity,
            id: tracer.id,
            parent: tracer.parent,
            metric_name: tracer.metric_name.clone(),
            start_offset: tracer.start.saturating_duration_since(transaction_start),
            duration: tracer.duration(),
            exclusive_duration: tracer.exclusive_duration(),
            truncated: tracer.truncated,
            attributes: tracer.agent_attributes.clone(),
        }
    }
}
