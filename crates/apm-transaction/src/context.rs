// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The carrier instrumentation passes through its callbacks.
//!
//! An execution context holds at most one transaction and one activity. There
//! is no thread-local lookup: whoever runs the work owns the context.

use crate::activity::{Flyweight, TracerFinish, TracerStart, TransactionActivity};
use crate::metric_names::SUPPORTABILITY_INCONSISTENT_STATE;
use crate::naming::NamePriority;
use crate::segment::Segment;
use crate::service::TransactionEnv;
use crate::stats::StatsWork;
use crate::token::Token;
use crate::tracer::{TracerId, TracerSpec};
use crate::transaction::Transaction;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct ExecutionContext {
    env: Arc<TransactionEnv>,
    name: String,
    transaction: Option<Arc<Transaction>>,
    activity: Option<TransactionActivity>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("transaction", &self.transaction)
            .field("activity", &self.activity)
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new(env: Arc<TransactionEnv>, name: String) -> Self {
        Self {
            env,
            name,
            transaction: None,
            activity: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn activity(&self) -> Option<&TransactionActivity> {
        self.activity.as_ref()
    }

    pub fn activity_mut(&mut self) -> Option<&mut TransactionActivity> {
        self.activity.as_mut()
    }

    fn reset(&mut self) {
        self.activity = None;
        self.transaction = None;
    }

    /// Starts a span, creating the transaction and activity when this is the first one.
    pub fn tracer_started(&mut self, spec: TracerSpec) -> Option<TracerId> {
        let now = Instant::now();
        let env = &self.env;
        let transaction = Arc::clone(
            self.transaction
                .get_or_insert_with(|| Transaction::new(Arc::clone(env))),
        );
        let name = &self.name;
        let activity = self
            .activity
            .get_or_insert_with(|| transaction.create_activity(name, now));

        match activity.tracer_started(spec, now) {
            TracerStart::Rejected => {
                if !activity.is_started() {
                    self.reset();
                }
                None
            }
            TracerStart::Started(id) => Some(id),
            TracerStart::RootStarted(id) => {
                let is_async = activity.root_tracer().is_some_and(|root| root.flags().is_async);
                // Async roots join a transaction only when linked through a token.
                if !is_async && !transaction.activity_started(activity) {
                    debug!(
                        "Transaction {} no longer accepts activities",
                        transaction.guid()
                    );
                    self.reset();
                    return None;
                }
                Some(id)
            }
        }
    }

    pub fn tracer_finished(&mut self, id: TracerId) -> Option<TracerFinish> {
        let activity = self.activity.as_mut()?;
        let outcome = activity.tracer_finished(id, Instant::now());
        match outcome {
            TracerFinish::Popped => {}
            TracerFinish::ActivityFinished => {
                if let (Some(activity), Some(transaction)) = (self.activity.take(), self.transaction.take()) {
                    transaction.activity_completed(activity);
                }
            }
            TracerFinish::Inconsistent => {
                self.env.record_supportability(StatsWork::increment_counter(
                    SUPPORTABILITY_INCONSISTENT_STATE,
                    1,
                ));
                if let (Some(activity), Some(transaction)) = (self.activity.take(), self.transaction.take()) {
                    transaction.activity_failed_or_ignored(activity.id());
                }
            }
        }
        Some(outcome)
    }

    pub fn start_flyweight(&mut self) -> Option<Flyweight> {
        self.activity.as_mut()?.start_flyweight(Instant::now())
    }

    pub fn finish_flyweight(&mut self, flyweight: Flyweight, metric_name: &str, rollup_metric_names: &[&str]) {
        if let Some(activity) = self.activity.as_mut() {
            activity.finish_flyweight(flyweight, metric_name, rollup_metric_names, Instant::now());
        }
    }

    pub fn get_token(&self) -> Token {
        match (&self.transaction, &self.activity) {
            (Some(transaction), Some(activity)) if activity.is_started() => transaction.get_token(activity),
            _ => Token::noop(),
        }
    }

    /// Moves this context's activity into the token's transaction.
    pub fn link(&mut self, token: &Token) -> bool {
        let Some(new) = token.transaction() else {
            return false;
        };
        if self
            .transaction
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &new))
        {
            return false;
        }
        let Some(activity) = self.activity.as_mut() else {
            return false;
        };
        if !Transaction::link_activity(&new, self.transaction.as_ref(), token, activity) {
            return false;
        }
        self.transaction = Some(new);
        true
    }

    pub fn start_segment(&self, category: &str, segment_name: &str) -> Option<Segment> {
        let transaction = self.transaction.as_ref()?;
        let activity = self.activity.as_ref()?;
        transaction.start_segment(activity, category, segment_name, &self.name)
    }

    pub fn ignore_transaction(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|transaction| transaction.ignore())
    }

    pub fn set_transaction_name(
        &self,
        priority: NamePriority,
        override_same: bool,
        category: &str,
        parts: &[&str],
    ) -> bool {
        self.transaction.as_ref().is_some_and(|transaction| {
            transaction.set_transaction_name(priority, override_same, category, parts)
        })
    }

    pub fn set_application_name(&self, priority: NamePriority, app_name: &str, override_same: bool) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(|transaction| transaction.set_application_name(priority, app_name, override_same))
    }

    pub fn add_user_attribute(&self, key: &str, value: impl Into<Value>) {
        if let Some(transaction) = &self.transaction {
            transaction.add_user_attribute(key, value);
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let (Some(activity), Some(transaction)) = (self.activity.take(), self.transaction.take()) {
            if activity.is_started() && !activity.is_done() {
                debug!(
                    "Execution context {} dropped while activity {} was running",
                    self.name,
                    activity.id()
                );
                transaction.activity_failed_or_ignored(activity.id());
            }
        }
    }
}
