// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_agent::config::{AgentConfig, FlushStrategy};
use apm_agent::services::{AgentHandle, AgentServices, AgentStatus};
use apm_harvest::data_sender::{DataSender, Event, ServerConfig, StartupOptions};
use apm_harvest::error::SendError;
use apm_transaction::stats::MetricData;
use apm_transaction::tracer::TracerSpec;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSender {
    connects: AtomicUsize,
    metric_posts: AtomicUsize,
    analytic_events: AtomicUsize,
    shutdowns: AtomicUsize,
}

#[async_trait::async_trait]
impl DataSender for RecordingSender {
    async fn connect(&self, _options: &StartupOptions) -> Result<ServerConfig, SendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ServerConfig {
            agent_run_id: Some(json!("run-1")),
            collect_errors: Some(true),
            collect_traces: Some(true),
            data_report_period: Some(60),
            ..ServerConfig::default()
        })
    }

    async fn send_metric_data(&self, _begin: u64, _end: u64, _data: &[MetricData]) -> Result<(), SendError> {
        self.metric_posts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_analytics_events(&self, _size: usize, _seen: usize, events: &[Event]) -> Result<(), SendError> {
        self.analytic_events.fetch_add(events.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn send_error_events(&self, _size: usize, _seen: usize, _events: &[Event]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_span_events(&self, _size: usize, _seen: usize, _events: &[Event]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_log_events(&self, _size: usize, _seen: usize, _events: &[Event]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_custom_events(&self, _size: usize, _seen: usize, _events: &[Event]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_error_data(&self, _errors: &[Value]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_transaction_trace_data(&self, _traces: &[Value]) -> Result<(), SendError> {
        Ok(())
    }

    async fn send_sql_trace_data(&self, _traces: &[Value]) -> Result<(), SendError> {
        Ok(())
    }

    async fn commit_and_flush(&self) -> Result<(), SendError> {
        Ok(())
    }

    async fn shutdown(&self, _timestamp_ms: u64) -> Result<(), SendError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn run_job(handle: &AgentHandle) {
    let mut ctx = handle.transactions().context("main");
    let root = ctx
        .tracer_started(TracerSpec::new("Job/run").initiator())
        .unwrap();
    ctx.tracer_finished(root);
}

async fn wait_for(counter: &AtomicUsize, at_least: usize) -> bool {
    for _ in 0..200 {
        if counter.load(Ordering::SeqCst) >= at_least {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn serverless_invocation_is_harvested_when_it_ends() {
    let sender = Arc::new(RecordingSender::default());
    let config = AgentConfig {
        serverless: true,
        flush_strategy: FlushStrategy::End,
        ..AgentConfig::default()
    };
    let handle = AgentServices::with_sender(config, sender.clone())
        .start()
        .await
        .unwrap();
    assert!(handle.rpm().is_connected());
    // serverless never handshakes
    assert_eq!(sender.connects.load(Ordering::SeqCst), 0);

    run_job(&handle);
    handle.end_invocation().await;

    assert_eq!(sender.analytic_events.load(Ordering::SeqCst), 1);
    assert_eq!(sender.metric_posts.load(Ordering::SeqCst), 1);
    assert_eq!(handle.transactions().in_flight_count(), 0);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn finished_transactions_coalesce_into_one_serverless_harvest() {
    let sender = Arc::new(RecordingSender::default());
    let config = AgentConfig {
        serverless: true,
        ..AgentConfig::default()
    };
    let handle = AgentServices::with_sender(config, sender.clone())
        .start()
        .await
        .unwrap();

    for _ in 0..5 {
        run_job(&handle);
    }
    handle.end_invocation().await;
    assert_eq!(sender.metric_posts.load(Ordering::SeqCst), 1);
    assert_eq!(sender.analytic_events.load(Ordering::SeqCst), 5);

    // the background driver finds nothing left to send
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sender.metric_posts.load(Ordering::SeqCst), 1);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn background_driver_harvests_without_end_of_invocation() {
    let sender = Arc::new(RecordingSender::default());
    let config = AgentConfig {
        serverless: true,
        flush_strategy: FlushStrategy::End,
        ..AgentConfig::default()
    };
    let handle = AgentServices::with_sender(config, sender.clone())
        .start()
        .await
        .unwrap();

    run_job(&handle);
    assert!(wait_for(&sender.metric_posts, 1).await);

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn stop_sends_the_final_harvest_and_disconnects() {
    let sender = Arc::new(RecordingSender::default());
    let config = AgentConfig {
        sync_startup: true,
        ..AgentConfig::default()
    };
    let handle = AgentServices::with_sender(config, sender.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(sender.connects.load(Ordering::SeqCst), 1);
    assert_eq!(handle.rpm().run_token().as_deref(), Some("run-1"));

    run_job(&handle);
    run_job(&handle);
    assert_eq!(sender.analytic_events.load(Ordering::SeqCst), 0);

    handle.stop().await.unwrap();

    assert_eq!(handle.status().await, AgentStatus::Stopped);
    assert_eq!(sender.analytic_events.load(Ordering::SeqCst), 2);
    assert_eq!(sender.metric_posts.load(Ordering::SeqCst), 1);
    assert_eq!(sender.shutdowns.load(Ordering::SeqCst), 1);
}
