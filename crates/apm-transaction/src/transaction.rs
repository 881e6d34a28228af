// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The transaction: one logical unit of work spanning any number of activities
//! and tokens.
//!
//! All lifecycle state lives behind one mutex per transaction. The live
//! reference count is only changed under that lock, and only when the
//! activity or token being released was actually registered, so it never
//! goes negative and reaches zero exactly once. The thread performing that
//! final decrement assembles the result under the lock; listeners, stats and
//! harvest triggers are handed the result after the lock is released.

use crate::activity::{ActivityId, TracerStart, TransactionActivity};
use crate::attributes::{
    TransactionAttributes, CPU_TIME, EXPLAIN_PLAN_CLAMP, GC_TIME, PRIORITY, SEGMENT_CLAMP, SIZE_LIMIT,
    STACK_TRACE_CLAMP, THREAD_NAME, TIMEOUT_CAUSE, TOKEN_CLAMP,
};
use crate::counts::TransactionCounts;
use crate::dispatcher::{Dispatcher, DispatcherKind, DispatcherSpec};
use crate::error::TransactionError;
use crate::metric_names::{
    CPU_PREFIX, GC_CUMULATIVE, SUPPORTABILITY_ASYNC_FINISH_SEGMENT_NOT_CALLED,
    SUPPORTABILITY_ASYNC_TOKEN_CREATE, SUPPORTABILITY_ASYNC_TOKEN_EXPIRE,
    SUPPORTABILITY_ASYNC_TOKEN_LINK_IGNORE, SUPPORTABILITY_ASYNC_TOKEN_LINK_SUCCESS,
    SUPPORTABILITY_ASYNC_TOKEN_TIMEOUT, SUPPORTABILITY_TRANSACTION_SEGMENT_CLAMP,
};
use crate::naming::{NamePriority, PriorityApplicationName, PriorityTransactionName};
use crate::segment::{Segment, SegmentCell};
use crate::service::TransactionEnv;
use crate::stats::{StatsWork, TransactionStats};
use crate::token::{Token, TokenId};
use crate::tracer::{SpanRef, TraceSegment, Tracer, TracerSpec};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

const SIZE_LIMIT_MESSAGE: &str = "The transaction size limit was reached";
const SEGMENT_ACTIVITY_CONTEXT: &str = "activity";

/// Process-wide transaction identifier. Also orders lock acquisition when two
/// transactions must be locked together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Unstarted,
    InProgress,
    Finished,
    Cancelled,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Finished | TransactionState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutCause {
    Segment,
    Token,
}

impl TimeoutCause {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutCause::Segment => "segment",
            TimeoutCause::Token => "token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Ignored,
    NoFinishedActivities,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelledTransaction {
    pub id: TransactionId,
    pub guid: String,
    pub app_name: String,
    pub reason: CancelReason,
}

/// Everything reported about a finished transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionData {
    pub id: TransactionId,
    pub guid: String,
    pub app_name: String,
    pub name: String,
    pub dispatcher: DispatcherKind,
    pub uri: Option<String>,
    /// Milliseconds since the unix epoch.
    pub start_time_ms: u64,
    pub duration: Duration,
    pub response_time: Duration,
    /// Sum of the durations of all activities.
    pub total_time: Duration,
    pub queue_time: Duration,
    pub cpu_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub priority: f32,
    pub sampled: bool,
    pub attributes: TransactionAttributes,
    pub timeout_cause: Option<TimeoutCause>,
    pub segments: Vec<TraceSegment>,
    pub activity_count: usize,
    pub segment_count: usize,
    pub token_count: usize,
    pub timed_out_tokens: usize,
}

pub(crate) enum Finalization {
    Finished(Box<TransactionData>, TransactionStats),
    Cancelled(CancelledTransaction),
}

enum Running {
    Context,
    Segment(Arc<SegmentCell>),
}

struct TrackedToken {
    token: Token,
    last_access: Instant,
}

enum Release {
    Activity(ActivityId),
    Token,
}

#[derive(Default)]
struct TransactionInner {
    state: TransactionState,
    ignored: bool,
    dispatcher: Option<Dispatcher>,
    root_metric_name: String,
    initial_activity: Option<ActivityId>,
    wall_clock_start: Option<SystemTime>,
    start: Option<Instant>,
    gc_start: Option<Duration>,
    response_time: Option<Duration>,
    total_time: Duration,
    last_activity_finished: Option<Instant>,
    name: PriorityTransactionName,
    app_name: PriorityApplicationName,
    attributes: TransactionAttributes,
    running: HashMap<ActivityId, Running>,
    finished: BTreeMap<ActivityId, TransactionActivity>,
    overflow_stats: TransactionStats,
    live_count: usize,
    tokens: HashMap<TokenId, TrackedToken>,
    timed_out_tokens: usize,
    truncated_spans: Vec<SpanRef>,
    timeout_cause: Option<TimeoutCause>,
    priority: Option<f32>,
    sampled: bool,
}

impl TransactionInner {
    fn is_in_progress(&self) -> bool {
        self.state == TransactionState::InProgress && self.live_count > 0
    }
}

pub struct Transaction {
    id: TransactionId,
    guid: String,
    env: Arc<TransactionEnv>,
    counts: Arc<TransactionCounts>,
    next_activity_id: AtomicU32,
    inner: Mutex<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(env: Arc<TransactionEnv>) -> Arc<Self> {
        let counts = Arc::new(TransactionCounts::new(&env.config));
        Arc::new(Self {
            id: TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)),
            guid: format!("{:016x}", rand::random::<u64>()),
            env,
            counts,
            next_activity_id: AtomicU32::new(1),
            inner: Mutex::new(TransactionInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TransactionInner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock poisoned")
    }

    /// Locks two distinct transactions in id order. Guards come back in argument order.
    fn lock_pair<'a>(
        first: &'a Transaction,
        second: &'a Transaction,
    ) -> (MutexGuard<'a, TransactionInner>, MutexGuard<'a, TransactionInner>) {
        if first.id < second.id {
            let a = first.lock();
            let b = second.lock();
            (a, b)
        } else {
            let b = second.lock();
            let a = first.lock();
            (a, b)
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn counts(&self) -> &TransactionCounts {
        &self.counts
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.lock().state != TransactionState::Unstarted
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock().is_in_progress()
    }

    /// Started and no live references left.
    pub fn is_finished(&self) -> bool {
        let inner = self.lock();
        inner.state != TransactionState::Unstarted && inner.live_count == 0
    }

    pub fn is_ignored(&self) -> bool {
        self.lock().ignored
    }

    pub fn live_count(&self) -> usize {
        self.lock().live_count
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    pub fn active_token_count(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn timed_out_token_count(&self) -> usize {
        self.lock().timed_out_tokens
    }

    pub fn timeout_cause(&self) -> Option<TimeoutCause> {
        self.lock().timeout_cause
    }

    pub fn wall_clock_start(&self) -> Option<SystemTime> {
        self.lock().wall_clock_start
    }

    pub fn transaction_name(&self) -> Option<String> {
        self.lock().name.name().map(str::to_string)
    }

    pub fn application_name(&self) -> String {
        let inner = self.lock();
        inner
            .app_name
            .name()
            .unwrap_or_else(|| self.env.default_app())
            .to_string()
    }

    pub fn priority(&self) -> Option<f32> {
        self.lock().priority
    }

    pub fn attributes(&self) -> TransactionAttributes {
        self.lock().attributes.clone()
    }

    pub(crate) fn next_activity_id(&self) -> ActivityId {
        ActivityId(self.next_activity_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn create_activity(&self, context_name: &str, now: Instant) -> TransactionActivity {
        TransactionActivity::new(
            self.next_activity_id(),
            self.id,
            Arc::clone(&self.counts),
            self.env.cpu_source(),
            context_name,
            now,
        )
    }

    fn begin(&self, inner: &mut TransactionInner, root: &Tracer, activity: Option<ActivityId>) -> bool {
        let flags = root.flags();
        if inner.state != TransactionState::Unstarted || !flags.initiator || flags.is_async {
            return false;
        }
        inner.wall_clock_start = Some(SystemTime::now());
        inner.start = Some(root.start());
        inner.gc_start = self.env.gc.cumulative_gc_time();
        inner.root_metric_name = root.metric_name().to_string();
        inner.initial_activity = activity;
        inner.dispatcher = Some(Dispatcher::new(
            root.dispatcher().cloned().unwrap_or(DispatcherSpec::Other),
        ));
        inner.state = TransactionState::InProgress;
        true
    }

    /// Starts the transaction if `tracer` can begin one and it has not started yet.
    pub fn start_if_beginning(self: &Arc<Self>, tracer: &Tracer) -> bool {
        let began = {
            let mut inner = self.lock();
            self.begin(&mut inner, tracer, None)
        };
        if began {
            self.env.transaction_began(self);
        }
        began
    }

    /// Replaces a background dispatcher with a web request one. A web dispatcher is never replaced.
    pub fn set_web_request(&self, uri: impl Into<String>, queue_time: Option<Duration>) -> bool {
        let mut inner = self.lock();
        if inner.state != TransactionState::InProgress
            || inner.dispatcher.as_ref().is_some_and(Dispatcher::is_web)
        {
            return false;
        }
        inner.dispatcher = Some(Dispatcher::new(DispatcherSpec::WebRequest {
            uri: uri.into(),
            queue_time,
        }));
        true
    }

    /// Registers a context activity whose root span just started.
    pub(crate) fn activity_started(self: &Arc<Self>, activity: &TransactionActivity) -> bool {
        let began = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            let began = match activity.root_tracer() {
                Some(root) => self.begin(&mut inner, root, Some(activity.id())),
                None => false,
            };
            if inner.state != TransactionState::InProgress {
                return false;
            }
            if inner.ignored {
                debug!(
                    "Activity {} started in ignored transaction {}",
                    activity.id(),
                    self.guid
                );
            }
            inner.running.insert(activity.id(), Running::Context);
            inner.live_count += 1;
            began
        };
        if began {
            self.env.transaction_began(self);
        }
        true
    }

    /// Accepts a finished activity. Ignored activities are discarded instead.
    pub(crate) fn activity_completed(&self, activity: TransactionActivity) {
        if activity.is_ignored() {
            self.activity_failed_or_ignored(activity.id());
            return;
        }
        let outcome = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            let id = activity.id();
            if !inner.running.contains_key(&id) {
                debug!("Activity {} is not running in transaction {}", id, self.guid);
                return;
            }
            let finished_at = activity.finished_at().unwrap_or_else(Instant::now);
            inner.total_time += activity.duration();
            if inner.initial_activity == Some(id) {
                inner.response_time = Some(activity.duration());
            }
            if activity.root_is_segment() {
                inner.finished.insert(id, activity);
            } else {
                inner.overflow_stats.merge(activity.stats());
            }
            self.release(&mut inner, Release::Activity(id), finished_at)
        };
        self.env.complete(outcome);
    }

    /// Releases an activity that failed or was ignored without keeping its data.
    pub(crate) fn activity_failed_or_ignored(&self, id: ActivityId) {
        let outcome = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.finished.remove(&id);
            self.release(&mut inner, Release::Activity(id), Instant::now())
        };
        self.env.complete(outcome);
    }

    /// Decrements the live count for a registered activity or token.
    fn release(&self, inner: &mut TransactionInner, release: Release, now: Instant) -> Option<Finalization> {
        if inner.state != TransactionState::InProgress {
            return None;
        }
        if let Release::Activity(id) = release {
            if inner.running.remove(&id).is_none() {
                return None;
            }
            inner.last_activity_finished = Some(match inner.last_activity_finished {
                Some(last) if last > now => last,
                _ => now,
            });
        }
        match inner.live_count.checked_sub(1) {
            Some(count) => inner.live_count = count,
            None => {
                error!("{}", TransactionError::CountUnderflow(self.id));
                return None;
            }
        }
        (inner.live_count == 0).then(|| self.finalize(inner))
    }

    fn finalize(&self, inner: &mut TransactionInner) -> Finalization {
        self.freeze_name(inner);
        self.assign_priority(inner);
        let app_name = inner
            .app_name
            .name()
            .unwrap_or_else(|| self.env.default_app())
            .to_string();

        let reason = if inner.ignored {
            debug!(
                "Transaction {} was cancelled: ignored. This is not an error condition.",
                self.guid
            );
            Some(CancelReason::Ignored)
        } else if inner.finished.is_empty() {
            debug!("Transaction {} was cancelled: no finished activities", self.guid);
            Some(CancelReason::NoFinishedActivities)
        } else {
            None
        };

        let reason = match reason {
            Some(reason) => reason,
            None => match self.build_report(inner, &app_name) {
                Ok((data, stats)) => {
                    inner.state = TransactionState::Finished;
                    return Finalization::Finished(Box::new(data), stats);
                }
                Err(err) => {
                    warn!(
                        "Transaction {} was not reported because of an internal error: {}",
                        self.guid, err
                    );
                    CancelReason::InternalError
                }
            },
        };

        inner.state = TransactionState::Cancelled;
        Finalization::Cancelled(CancelledTransaction {
            id: self.id,
            guid: self.guid.clone(),
            app_name,
            reason,
        })
    }

    fn freeze_name(&self, inner: &mut TransactionInner) {
        if inner.name.is_frozen() {
            return;
        }
        let raw = match inner.name.name() {
            Some(name) => name.to_string(),
            None => match &inner.dispatcher {
                Some(dispatcher) => dispatcher.default_name(&inner.root_metric_name),
                None => return,
            },
        };
        let app = inner.app_name.name().unwrap_or_else(|| self.env.default_app());
        match self.env.normalizers.transaction_normalizer(app).normalize(&raw) {
            Some(normalized) => inner.name.rename(normalized),
            None => {
                debug!("Transaction {} named {} is ignored by naming rules", self.guid, raw);
                inner.ignored = true;
            }
        }
        inner.name.freeze();
    }

    /// Fixes the name so later naming calls have no effect.
    pub fn freeze_transaction_name(&self) {
        let mut inner = self.lock();
        self.freeze_name(&mut inner);
    }

    fn assign_priority(&self, inner: &mut TransactionInner) {
        if inner.priority.is_some() {
            return;
        }
        let random: f32 = rand::random();
        let sampled = self.env.sampler.compute_sampled();
        inner.sampled = sampled;
        inner.priority = Some(if sampled { random + 1.0 } else { random });
    }

    fn build_report(
        &self,
        inner: &mut TransactionInner,
        app_name: &str,
    ) -> Result<(TransactionData, TransactionStats), TransactionError> {
        let dispatcher = inner
            .dispatcher
            .clone()
            .ok_or_else(|| TransactionError::Report(self.id, "no dispatcher".to_string()))?;
        let name = inner
            .name
            .name()
            .map(str::to_string)
            .ok_or_else(|| TransactionError::Report(self.id, "no name".to_string()))?;
        let start = inner
            .start
            .ok_or_else(|| TransactionError::Report(self.id, "no start time".to_string()))?;

        let end = inner.last_activity_finished.unwrap_or(start);
        let duration = end.saturating_duration_since(start);
        let response_time = inner.response_time.unwrap_or(duration);
        let total_time = inner.total_time;

        let mut stats = std::mem::take(&mut inner.overflow_stats);
        let mut cpu_time = Some(Duration::ZERO);
        let mut segments = Vec::new();
        for activity in inner.finished.values() {
            stats.merge(activity.stats());
            cpu_time = cpu_time
                .zip(activity.total_cpu_time())
                .map(|(total, cpu)| total + cpu);
            segments.extend(activity.trace_segments(start));
        }
        for segment in &mut segments {
            if inner
                .truncated_spans
                .iter()
                .any(|span| span.activity == segment.activity && span.tracer == segment.id)
            {
                segment.truncated = true;
            }
        }

        let cpu_time = cpu_time.filter(|cpu| !cpu.is_zero());
        if let Some(cpu) = cpu_time {
            inner
                .attributes
                .intrinsic
                .insert(CPU_TIME.to_string(), Value::from(cpu.as_millis() as u64));
            stats
                .unscoped_mut()
                .record_response_time(&format!("{CPU_PREFIX}{name}"), cpu, cpu);
        }

        let gc_time = match (inner.gc_start, self.env.gc.cumulative_gc_time()) {
            (Some(gc_start), Some(gc_end)) => Some(gc_end.saturating_sub(gc_start)).filter(|gc| !gc.is_zero()),
            _ => None,
        };
        if let Some(gc) = gc_time {
            inner
                .attributes
                .intrinsic
                .insert(GC_TIME.to_string(), Value::from(gc.as_millis() as u64));
            stats.unscoped_mut().record_response_time(GC_CUMULATIVE, gc, gc);
        }

        if inner.timed_out_tokens > 0 {
            stats
                .unscoped_mut()
                .get_stats(SUPPORTABILITY_ASYNC_TOKEN_TIMEOUT)
                .increment_call_count(inner.timed_out_tokens as u64);
        }

        dispatcher.transaction_finished(&name, &mut stats, response_time, total_time);

        let counts = &self.counts;
        let intrinsic = &mut inner.attributes.intrinsic;
        if counts.is_over_segment_limit() {
            let segment_count = counts.segment_count();
            intrinsic.insert(SEGMENT_CLAMP.to_string(), Value::from(segment_count));
            stats
                .unscoped_mut()
                .get_stats(SUPPORTABILITY_TRANSACTION_SEGMENT_CLAMP)
                .record_data_point(segment_count as f64);
        }
        if counts.is_over_transaction_size() {
            inner
                .attributes
                .agent
                .insert(SIZE_LIMIT.to_string(), Value::from(SIZE_LIMIT_MESSAGE));
        }
        let intrinsic = &mut inner.attributes.intrinsic;
        if counts.is_over_stack_trace_limit() {
            intrinsic.insert(STACK_TRACE_CLAMP.to_string(), Value::from(counts.stack_trace_count()));
        }
        if counts.is_over_token_limit() {
            intrinsic.insert(TOKEN_CLAMP.to_string(), Value::from(counts.token_count()));
        }
        if counts.is_over_explain_plan_limit() {
            intrinsic.insert(EXPLAIN_PLAN_CLAMP.to_string(), Value::from(counts.explain_plan_count()));
        }
        if let Some(cause) = inner.timeout_cause {
            intrinsic.insert(TIMEOUT_CAUSE.to_string(), Value::from(cause.as_str()));
        }
        if inner.timed_out_tokens == 0 && inner.finished.len() == 1 {
            if let Some(activity) = inner.finished.values().next() {
                intrinsic.insert(THREAD_NAME.to_string(), Value::from(activity.context_name()));
            }
        }
        let priority = inner.priority.unwrap_or_default();
        intrinsic.insert(PRIORITY.to_string(), Value::from(priority));

        let start_time_ms = inner
            .wall_clock_start
            .and_then(|start| start.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as u64)
            .unwrap_or_default();

        let data = TransactionData {
            id: self.id,
            guid: self.guid.clone(),
            app_name: app_name.to_string(),
            name,
            dispatcher: dispatcher.kind(),
            uri: dispatcher.uri().map(str::to_string),
            start_time_ms,
            duration,
            response_time,
            total_time,
            queue_time: dispatcher.queue_time(),
            cpu_time,
            gc_time,
            priority,
            sampled: inner.sampled,
            attributes: inner.attributes.clone(),
            timeout_cause: inner.timeout_cause,
            segments,
            activity_count: inner.finished.len(),
            segment_count: counts.segment_count(),
            token_count: counts.token_count(),
            timed_out_tokens: inner.timed_out_tokens,
        };
        Ok((data, stats))
    }

    /// Creates a token parented on `activity`'s current span. Returns a no-op
    /// token when the transaction cannot take more references.
    pub(crate) fn get_token(self: &Arc<Self>, activity: &TransactionActivity) -> Token {
        let Some(last) = activity.last_tracer() else {
            return Token::noop();
        };
        if activity.is_leaf() {
            return Token::noop();
        }
        let initiating = SpanRef {
            activity: activity.id(),
            tracer: last.id(),
        };
        let token = {
            let mut inner = self.lock();
            if inner.ignored || !inner.is_in_progress() {
                return Token::noop();
            }
            if !self.counts.try_add_token() {
                debug!(
                    "Token limit of {} reached for transaction {}; returning a no-op token",
                    self.counts.max_tokens(),
                    self.guid
                );
                return Token::noop();
            }
            let id = TokenId(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed));
            let token = Token::new(id, self, initiating);
            inner.live_count += 1;
            inner.tokens.insert(
                id,
                TrackedToken {
                    token: token.clone(),
                    last_access: Instant::now(),
                },
            );
            token
        };
        self.env
            .record_supportability(StatsWork::increment_counter(SUPPORTABILITY_ASYNC_TOKEN_CREATE, 1));
        token
    }

    /// Called by a token after it flipped itself inactive.
    pub(crate) fn token_expired(&self, id: TokenId) -> bool {
        let outcome = {
            let mut inner = self.lock();
            if inner.state.is_terminal() || inner.tokens.remove(&id).is_none() {
                return false;
            }
            self.release(&mut inner, Release::Token, Instant::now())
        };
        self.env
            .record_supportability(StatsWork::increment_counter(SUPPORTABILITY_ASYNC_TOKEN_EXPIRE, 1));
        self.env.complete(outcome);
        true
    }

    fn refresh_token(&self, id: TokenId) {
        let mut inner = self.lock();
        if let Some(tracked) = inner.tokens.get_mut(&id) {
            tracked.last_access = Instant::now();
        }
    }

    /// Moves `activity` from `old` into `new`, the transaction of `token`.
    pub(crate) fn link_activity(
        new: &Arc<Transaction>,
        old: Option<&Arc<Transaction>>,
        token: &Token,
        activity: &mut TransactionActivity,
    ) -> bool {
        let (Some(token_id), Some(initiating)) = (token.id(), token.initiating_span()) else {
            return false;
        };
        if old.is_some_and(|old| Arc::ptr_eq(old, new)) {
            return false;
        }
        new.refresh_token(token_id);
        let old_key = activity.id();

        let linked = {
            let (mut new_inner, mut old_inner) = match old {
                Some(old) => {
                    let (new_inner, old_inner) = Transaction::lock_pair(new, old);
                    (new_inner, Some(old_inner))
                }
                None => (new.lock(), None),
            };

            if !new_inner.is_in_progress() {
                debug!("Not linking to transaction {}: not in progress", new.guid);
                false
            } else if !token.is_active() {
                debug!("Not linking to transaction {}: token {} is expired", new.guid, token_id);
                false
            } else if !activity.is_started() {
                debug!("Not linking to transaction {}: no started activity", new.guid);
                false
            } else {
                let new_id = new.next_activity_id();
                activity.reparent(new.id, new_id, Arc::clone(&new.counts), initiating);
                if new_inner.ignored {
                    activity.set_owner_ignored();
                }
                new_inner.running.insert(new_id, Running::Context);
                new_inner.live_count += 1;

                if let Some(old_inner) = old_inner.as_mut() {
                    if let Some(app) = old_inner.app_name.name() {
                        let priority = old_inner.app_name.priority();
                        new_inner.app_name.set(priority, app, true);
                    }
                    new_inner.name.adopt(&old_inner.name);
                    new_inner.attributes.put_all(&old_inner.attributes);
                    old_inner.ignored = true;
                }
                true
            }
        };

        let metric = if linked {
            SUPPORTABILITY_ASYNC_TOKEN_LINK_SUCCESS
        } else {
            SUPPORTABILITY_ASYNC_TOKEN_LINK_IGNORE
        };
        new.env.record_supportability(StatsWork::increment_counter(metric, 1));

        if linked {
            if let Some(old) = old {
                old.check_expire(Instant::now());
                old.activity_failed_or_ignored(old_key);
            }
        }
        linked
    }

    /// Creates an activity for work the caller times by hand.
    pub(crate) fn start_segment(
        self: &Arc<Self>,
        parent: &TransactionActivity,
        category: &str,
        name: &str,
        context_name: &str,
    ) -> Option<Segment> {
        if self.counts.is_over_segment_limit() || parent.is_leaf() {
            return None;
        }
        let last = parent.last_tracer()?;
        let parent_span = SpanRef {
            activity: parent.id(),
            tracer: last.id(),
        };
        // Starting the span counts it toward the segment limit; check and
        // register under one lock.
        let mut inner = self.lock();
        if inner.ignored || !inner.is_in_progress() {
            return None;
        }
        let now = Instant::now();
        let mut activity = self.create_activity(SEGMENT_ACTIVITY_CONTEXT, now);
        let spec = TracerSpec::new(format!("{category}/{name}")).initiator();
        if !matches!(activity.tracer_started(spec, now), TracerStart::RootStarted(_)) {
            return None;
        }
        activity.set_root_parent(parent_span);
        let id = activity.id();
        let cell = Arc::new(SegmentCell::new(activity, context_name, now));
        inner.running.insert(id, Running::Segment(Arc::clone(&cell)));
        inner.live_count += 1;
        Some(Segment::new(Arc::downgrade(self), cell))
    }

    /// Cancels reporting. Only takes effect once the transaction has started.
    pub fn ignore(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != TransactionState::InProgress {
            debug!("Unable to ignore transaction {}: not in progress", self.guid);
            return false;
        }
        inner.ignored = true;
        for activity in inner.finished.values_mut() {
            activity.set_owner_ignored();
        }
        for running in inner.running.values() {
            if let Running::Segment(cell) = running {
                cell.with_activity(TransactionActivity::set_owner_ignored);
            }
        }
        true
    }

    pub fn set_transaction_name(
        &self,
        priority: NamePriority,
        override_same: bool,
        category: &str,
        parts: &[&str],
    ) -> bool {
        let mut inner = self.lock();
        let Some(web) = inner.dispatcher.as_ref().map(Dispatcher::is_web) else {
            debug!("Unable to name transaction {}: not started", self.guid);
            return false;
        };
        inner.name.set(priority, override_same, web, category, parts)
    }

    pub fn set_application_name(&self, priority: NamePriority, name: &str, override_same: bool) -> bool {
        self.lock().app_name.set(priority, name, override_same)
    }

    pub fn update_attributes<R>(&self, f: impl FnOnce(&mut TransactionAttributes) -> R) -> R {
        f(&mut self.lock().attributes)
    }

    pub fn add_user_attribute(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.update_attributes(|attributes| attributes.user.insert(key.to_string(), value));
    }

    pub fn add_agent_attribute(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.update_attributes(|attributes| attributes.agent.insert(key.to_string(), value));
    }

    /// Returns `false` once the stack trace limit is reached.
    pub fn add_stack_trace(&self) -> bool {
        self.counts.add_stack_trace()
    }

    pub fn add_explain_plan(&self) -> bool {
        self.counts.add_explain_plan()
    }

    pub fn add_transaction_size(&self, bytes: usize) {
        self.counts.add_transaction_size(bytes);
    }

    /// Forcibly finishes timed-out segments and expires idle tokens.
    pub fn check_expire(&self, now: Instant) {
        self.check_expire_segments(now);
        self.check_expire_tokens(now);
    }

    fn check_expire_segments(&self, now: Instant) {
        let timeout = self.env.config.segment_timeout;
        let (expired, name) = {
            let mut inner = self.lock();
            if inner.state != TransactionState::InProgress {
                return;
            }
            let expired: Vec<Arc<SegmentCell>> = inner
                .running
                .values()
                .filter_map(|running| match running {
                    Running::Segment(cell) if now.saturating_duration_since(cell.started_at()) > timeout => {
                        Some(Arc::clone(cell))
                    }
                    _ => None,
                })
                .collect();
            if expired.is_empty() {
                return;
            }
            inner.timeout_cause.get_or_insert(TimeoutCause::Segment);
            let name = inner.name.name().unwrap_or(inner.root_metric_name.as_str()).to_string();
            (expired, name)
        };

        for cell in expired {
            let Some(mut activity) = cell.take() else {
                continue;
            };
            info!(
                "Segment timed out after {} seconds. The \"segment_timeout\" configuration parameter can be used to adjust this timeout. The affected transaction name is {}.",
                timeout.as_secs(),
                name
            );
            self.env.record_supportability(StatsWork::increment_counter(
                SUPPORTABILITY_ASYNC_FINISH_SEGMENT_NOT_CALLED,
                1,
            ));
            activity.finish_all(now, true);
            self.activity_completed(activity);
        }
    }

    fn check_expire_tokens(&self, now: Instant) {
        let timeout = self.env.config.token_timeout;
        let outcome = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state != TransactionState::InProgress || inner.tokens.is_empty() {
                return;
            }
            let idle_since = inner.last_activity_finished.or(inner.start);
            let expire_all = inner.running.is_empty()
                && idle_since.is_some_and(|since| now.saturating_duration_since(since) >= timeout);
            let expired: Vec<TokenId> = inner
                .tokens
                .iter()
                .filter(|(_, tracked)| expire_all || now.saturating_duration_since(tracked.last_access) >= timeout)
                .map(|(id, _)| *id)
                .collect();

            let mut outcome = None;
            for id in expired {
                let Some(tracked) = inner.tokens.get(&id) else {
                    continue;
                };
                // A concurrent expire() that won the flip releases the token itself.
                if !tracked.token.deactivate() {
                    continue;
                }
                if let Some(span) = tracked.token.initiating_span() {
                    inner.truncated_spans.push(span);
                }
                inner.tokens.remove(&id);
                inner.timed_out_tokens += 1;
                inner.timeout_cause.get_or_insert(TimeoutCause::Token);
                debug!("Token {} of transaction {} timed out", id, self.guid);
                if let Some(finalization) = self.release(inner, Release::Token, now) {
                    outcome = Some(finalization);
                }
            }
            outcome
        };
        self.env.complete(outcome);
    }
}
