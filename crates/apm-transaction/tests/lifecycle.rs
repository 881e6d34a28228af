// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_transaction::config::TransactionConfig;
use apm_transaction::context::ExecutionContext;
use apm_transaction::naming::NormalizerRegistry;
use apm_transaction::service::{TransactionListener, TransactionService};
use apm_transaction::stats::{StatsService, TransactionStats};
use apm_transaction::token::Token;
use apm_transaction::tracer::{TracerId, TracerSpec};
use apm_transaction::transaction::{TransactionData, TransactionState};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct FinishCounter(AtomicUsize);

impl TransactionListener for FinishCounter {
    fn transaction_finished(&self, _data: &TransactionData, _stats: &TransactionStats) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn service() -> (TransactionService, Arc<FinishCounter>) {
    let service = TransactionService::new(
        TransactionConfig::default(),
        Arc::new(StatsService::new("app")),
        Arc::new(NormalizerRegistry::default()),
    )
    .unwrap();
    let counter = Arc::new(FinishCounter::default());
    service.add_listener(counter.clone());
    (service, counter)
}

#[derive(Debug, Clone)]
enum Op {
    CreateToken,
    Expire(usize),
    Link(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::CreateToken),
        any::<usize>().prop_map(Op::Expire),
        any::<usize>().prop_map(Op::Link),
    ]
}

proptest! {
    #[test]
    fn live_count_tracks_outstanding_references(ops in proptest::collection::vec(op(), 0..40)) {
        let (service, counter) = service();
        let mut main = service.context("main");
        let root = main.tracer_started(TracerSpec::new("Job/run").initiator()).unwrap();
        let tx = Arc::clone(main.transaction().unwrap());

        let mut tokens: Vec<Token> = Vec::new();
        let mut workers: Vec<(ExecutionContext, TracerId)> = Vec::new();
        let mut expected = 1usize;

        for op in ops {
            match op {
                Op::CreateToken => {
                    let token = main.get_token();
                    prop_assert!(!token.is_noop());
                    tokens.push(token);
                    expected += 1;
                }
                Op::Expire(index) if !tokens.is_empty() => {
                    if tokens[index % tokens.len()].expire() {
                        expected -= 1;
                    }
                }
                Op::Link(index) if !tokens.is_empty() => {
                    let token = tokens[index % tokens.len()].clone();
                    let mut worker = service.context("worker");
                    let async_root = worker
                        .tracer_started(TracerSpec::new("Async/work").asynchronous())
                        .unwrap();
                    if token.link(&mut worker) {
                        expected += 1;
                        workers.push((worker, async_root));
                    }
                }
                _ => {}
            }
            prop_assert_eq!(tx.live_count(), expected);
            prop_assert_eq!(tx.state(), TransactionState::InProgress);
        }

        for (mut worker, async_root) in workers {
            worker.tracer_finished(async_root);
        }
        for token in &tokens {
            token.expire();
        }
        main.tracer_finished(root);

        prop_assert_eq!(tx.live_count(), 0);
        prop_assert_eq!(tx.state(), TransactionState::Finished);
        prop_assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn fan_out_across_threads_finishes_once() {
    let (service, counter) = service();
    let mut main = service.context("main");
    let root = main.tracer_started(TracerSpec::new("Job/fan-out").initiator()).unwrap();
    let tokens: Vec<Token> = (0..16).map(|_| main.get_token()).collect();
    let tx = Arc::clone(main.transaction().unwrap());

    thread::scope(|scope| {
        for (i, token) in tokens.into_iter().enumerate() {
            let service = service.clone();
            scope.spawn(move || {
                let mut worker = service.context(format!("worker-{i}"));
                let async_root = worker
                    .tracer_started(TracerSpec::new("Async/work").asynchronous())
                    .unwrap();
                assert!(token.link_and_expire(&mut worker));
                let child = worker.tracer_started(TracerSpec::new("Custom/step")).unwrap();
                worker.tracer_finished(child);
                worker.tracer_finished(async_root);
            });
        }
        main.tracer_finished(root);
    });

    assert_eq!(tx.state(), TransactionState::Finished);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    let engine = service.stats_service().take_for_harvest("app");
    let scoped = engine.scoped("OtherTransaction/Job/fan-out").unwrap();
    assert_eq!(scoped.stats("Custom/step").unwrap().call_count(), 16);
}
