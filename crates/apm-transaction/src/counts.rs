// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::TransactionConfig;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-transaction counters checked against the configured limits.
///
/// Shared by the transaction and every activity currently owned by it, so
/// span creation can be clamped without taking the transaction lock.
#[derive(Debug)]
pub struct TransactionCounts {
    max_segments: usize,
    max_tokens: usize,
    max_stack_traces: usize,
    max_explain_plans: usize,
    size_limit: usize,
    segments: AtomicUsize,
    tokens: AtomicUsize,
    stack_traces: AtomicUsize,
    explain_plans: AtomicUsize,
    size: AtomicUsize,
}

impl TransactionCounts {
    pub fn new(config: &TransactionConfig) -> Self {
        Self {
            max_segments: config.max_segments,
            max_tokens: config.max_tokens,
            max_stack_traces: config.max_stack_traces,
            max_explain_plans: config.max_explain_plans,
            size_limit: config.transaction_size_limit,
            segments: AtomicUsize::new(0),
            tokens: AtomicUsize::new(0),
            stack_traces: AtomicUsize::new(0),
            explain_plans: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn add_tracer(&self) {
        self.add_tracers(1);
    }

    pub fn add_tracers(&self, count: usize) {
        self.segments.fetch_add(count, Ordering::Relaxed);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.load(Ordering::Relaxed)
    }

    pub fn is_over_segment_limit(&self) -> bool {
        self.segment_count() > self.max_segments
    }

    /// Counts one more token unless the limit is reached. The check and the
    /// increment are one atomic step.
    pub fn try_add_token(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_tokens).then_some(count + 1)
            })
            .is_ok()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn is_over_token_limit(&self) -> bool {
        self.token_count() >= self.max_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Returns false once the stack trace limit has been reached.
    pub fn add_stack_trace(&self) -> bool {
        self.stack_traces.fetch_add(1, Ordering::Relaxed) < self.max_stack_traces
    }

    pub fn stack_trace_count(&self) -> usize {
        self.stack_traces.load(Ordering::Relaxed)
    }

    pub fn is_over_stack_trace_limit(&self) -> bool {
        self.stack_trace_count() >= self.max_stack_traces
    }

    /// Returns false once the explain plan limit has been reached.
    pub fn add_explain_plan(&self) -> bool {
        self.explain_plans.fetch_add(1, Ordering::Relaxed) < self.max_explain_plans
    }

    pub fn explain_plan_count(&self) -> usize {
        self.explain_plans.load(Ordering::Relaxed)
    }

    pub fn is_over_explain_plan_limit(&self) -> bool {
        self.explain_plan_count() >= self.max_explain_plans
    }

    pub fn add_transaction_size(&self, bytes: usize) {
        self.size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transaction_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_over_transaction_size(&self) -> bool {
        self.transaction_size() > self.size_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> TransactionCounts {
        TransactionCounts::new(&TransactionConfig {
            max_segments: 2,
            max_tokens: 1,
            max_stack_traces: 2,
            max_explain_plans: 1,
            transaction_size_limit: 10,
            ..Default::default()
        })
    }

    #[test]
    fn segment_limit_is_exceeded_past_max() {
        let counts = counts();
        counts.add_tracers(2);
        assert!(!counts.is_over_segment_limit());
        counts.add_tracer();
        assert!(counts.is_over_segment_limit());
        assert_eq!(counts.segment_count(), 3);
    }

    #[test]
    fn stack_traces_refused_at_limit() {
        let counts = counts();
        assert!(counts.add_stack_trace());
        assert!(counts.add_stack_trace());
        assert!(counts.is_over_stack_trace_limit());
        assert!(!counts.add_stack_trace());
    }

    #[test]
    fn concurrent_token_adds_stop_at_limit() {
        let counts = std::sync::Arc::new(TransactionCounts::new(&TransactionConfig {
            max_tokens: 5,
            ..Default::default()
        }));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counts = std::sync::Arc::clone(&counts);
                std::thread::spawn(move || (0..10).filter(|_| counts.try_add_token()).count())
            })
            .collect();
        let granted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(granted, 5);
        assert_eq!(counts.token_count(), 5);
        assert!(counts.is_over_token_limit());
    }

    #[test]
    fn token_and_size_limits() {
        let counts = counts();
        assert!(!counts.is_over_token_limit());
        assert!(counts.try_add_token());
        assert!(counts.is_over_token_limit());
        assert!(!counts.try_add_token());
        assert_eq!(counts.token_count(), 1);

        counts.add_transaction_size(10);
        assert!(!counts.is_over_transaction_size());
        counts.add_transaction_size(1);
        assert!(counts.is_over_transaction_size());
    }
}
