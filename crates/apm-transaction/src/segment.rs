// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Activities created through the API rather than by an execution context.

use crate::activity::TransactionActivity;
use crate::attributes::{ASYNC_CONTEXT, SEGMENT_END_CONTEXT, SEGMENT_START_CONTEXT};
use crate::transaction::Transaction;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

const SEGMENT_API_CONTEXT: &str = "segment-api";

/// Holds a segment's activity until it is ended, ignored or timed out.
pub(crate) struct SegmentCell {
    activity: Mutex<Option<TransactionActivity>>,
    started_at: Instant,
    start_context: String,
}

impl SegmentCell {
    pub(crate) fn new(activity: TransactionActivity, start_context: &str, now: Instant) -> Self {
        Self {
            activity: Mutex::new(Some(activity)),
            started_at: now,
            start_context: start_context.to_string(),
        }
    }

    pub(crate) fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The first caller gets the activity; later callers get `None`.
    pub(crate) fn take(&self) -> Option<TransactionActivity> {
        #[allow(clippy::expect_used)]
        self.activity.lock().expect("lock poisoned").take()
    }

    pub(crate) fn is_finished(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.activity.lock().expect("lock poisoned").is_none()
    }

    pub(crate) fn with_activity<R>(&self, f: impl FnOnce(&mut TransactionActivity) -> R) -> Option<R> {
        #[allow(clippy::expect_used)]
        let mut activity = self.activity.lock().expect("lock poisoned");
        activity.as_mut().map(f)
    }
}

/// A timed piece of work not bound to an execution context.
///
/// Dropping a segment without ending it leaves it running until the segment
/// timeout sweep finishes it as truncated.
pub struct Segment {
    transaction: Weak<Transaction>,
    cell: Arc<SegmentCell>,
}

impl Segment {
    pub(crate) fn new(transaction: Weak<Transaction>, cell: Arc<SegmentCell>) -> Self {
        Self { transaction, cell }
    }

    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }

    pub fn set_agent_attribute(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.cell.with_activity(|activity| {
            if let Some(root) = activity.root_tracer_mut() {
                root.set_agent_attribute(key, value);
            }
        });
    }

    /// Finishes the segment from the execution context named `context_name`.
    pub fn end(self, context_name: &str) -> bool {
        let Some(mut activity) = self.cell.take() else {
            return false;
        };
        if let Some(root) = activity.root_tracer_mut() {
            if context_name == self.cell.start_context {
                root.remove_agent_attribute(ASYNC_CONTEXT);
            } else {
                root.set_agent_attribute(ASYNC_CONTEXT, SEGMENT_API_CONTEXT);
                root.set_agent_attribute(SEGMENT_START_CONTEXT, self.cell.start_context.as_str());
                root.set_agent_attribute(SEGMENT_END_CONTEXT, context_name);
            }
        }
        activity.set_total_cpu_time(Some(Duration::ZERO));
        activity.finish_all(Instant::now(), false);
        match self.transaction.upgrade() {
            Some(transaction) => {
                transaction.activity_completed(activity);
                true
            }
            None => false,
        }
    }

    /// Discards the segment unless it has already finished.
    pub fn ignore_if_unfinished(self) -> bool {
        let Some(mut activity) = self.cell.take() else {
            return false;
        };
        activity.set_ignored();
        match self.transaction.upgrade() {
            Some(transaction) => {
                transaction.activity_failed_or_ignored(activity.id());
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("start_context", &self.cell.start_context)
            .field("finished", &self.cell.is_finished())
            .finish()
    }
}
