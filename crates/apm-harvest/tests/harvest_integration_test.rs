// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use apm_harvest::connection_service::ConnectionService;
use apm_harvest::data_sender::{Event, ServerConfig, ANALYTIC_EVENT_DATA};
use apm_harvest::error::{ConnectError, HttpError, SendError};
use apm_harvest::harvest_service::HarvestMode;
use apm_harvest::metric_names::SUPPORTABILITY_AGENT_CONNECT_BACKOFF_ATTEMPTS;
use apm_harvest::transaction_events::{TransactionEventsConfig, TransactionEventsService};
use apm_transaction::service::{HarvestTrigger, TransactionListener};
use apm_transaction::stats::{StatsWork, TransactionStats};
use common::helpers::{finished_transaction, harness, harness_with, server_config, APP};
use common::mocks::{Call, MockDataSender, CONNECT, METRIC_DATA, SHUTDOWN};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn unavailable() -> SendError {
    HttpError::new(503, "Service Unavailable").into()
}

#[tokio::test]
async fn metric_data_is_carried_forward_after_unavailable() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    h.stats.do_stats_work(
        APP,
        StatsWork::record_response_time("Custom/work", Duration::from_millis(5)),
    );
    h.sender.script(METRIC_DATA, Err(unavailable()));

    h.harvest.harvest_app_now(APP).await;
    assert_eq!(h.rpm.retry_count(), 1);
    assert!(h.harvest.carried_metric_count(APP).await.unwrap() >= 1);

    // recorded while the failed engine waits for the next attempt
    h.stats.do_stats_work(
        APP,
        StatsWork::record_response_time("Custom/work", Duration::from_millis(7)),
    );

    h.harvest.harvest_app_now(APP).await;
    let sent = h.sender.metric_names();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains(&"Custom/work".to_string()));
    assert!(sent[1].contains(&"Custom/work".to_string()));
    assert_eq!(h.rpm.retry_count(), 0);

    h.harvest.harvest_app_now(APP).await;
    assert_eq!(h.sender.metric_call_counts("Custom/work"), vec![1, 2, 0]);
}

#[tokio::test]
async fn non_retryable_metric_failure_drops_data() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    h.stats.do_stats_work(APP, StatsWork::increment_counter("Custom/dropped", 1));
    h.sender
        .script(METRIC_DATA, Err(HttpError::new(400, "Bad Request").into()));

    h.harvest.harvest_app_now(APP).await;
    h.harvest.harvest_app_now(APP).await;
    let sent = h.sender.metric_names();
    assert!(sent[0].contains(&"Custom/dropped".to_string()));
    assert!(!sent[1].contains(&"Custom/dropped".to_string()));
    assert_eq!(h.rpm.retry_count(), 0);
}

#[tokio::test]
async fn oversized_event_batches_are_halved_until_accepted() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    for _ in 0..2 {
        h.sender.script(
            ANALYTIC_EVENT_DATA,
            Err(SendError::PayloadTooLarge("Request Entity Too Large".to_string())),
        );
    }
    let events: Vec<Event> = (0..1000).map(|i| Event::new(i as f32)).collect();

    h.rpm
        .send_analytics_events(1000, 1000, &events)
        .await
        .unwrap();
    assert_eq!(h.sender.event_counts(ANALYTIC_EVENT_DATA), vec![1000, 500, 250]);
}

#[tokio::test]
async fn force_restart_reconnects_before_resending_metrics() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    h.sender
        .script(METRIC_DATA, Err(SendError::ForceRestart("restart".to_string())));

    h.harvest.harvest_app_now(APP).await;
    assert_eq!(h.sender.count(CONNECT), 2);
    assert_eq!(h.sender.count(SHUTDOWN), 1);
    assert_eq!(h.sender.count(METRIC_DATA), 2);
    assert!(h.rpm.is_connected());
    assert_eq!(h.rpm.retry_count(), 0);
}

#[tokio::test]
async fn force_disconnect_stops_reporting_for_good() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    h.sender.script(
        ANALYTIC_EVENT_DATA,
        Err(SendError::ForceDisconnect("disconnect".to_string())),
    );

    let result = h.rpm.send_analytics_events(10, 1, &[Event::new(1.0)]).await;
    assert!(matches!(result, Err(SendError::ForceDisconnect(_))));
    assert!(h.rpm.is_shut_down());
    assert!(!h.rpm.is_connected());
    assert!(matches!(h.rpm.launch().await, Err(ConnectError::ShutDown(_))));
}

#[tokio::test]
async fn immediate_requests_coalesce_and_flush_before_returning() {
    let h = harness(HarvestMode::Serverless);
    h.rpm.launch().await.unwrap();
    let (trigger, driver) = h.harvest.spawn_immediate_harvester(h.shutdown.clone());

    for _ in 0..4 {
        trigger.harvest_now(APP);
    }
    assert_eq!(trigger.pending_count(), 1);

    trigger.flush().await;
    assert_eq!(trigger.pending_count(), 0);
    assert_eq!(h.sender.count(METRIC_DATA), 1);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.sender.count(METRIC_DATA), 1);

    h.shutdown.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn serverless_harvest_skips_disconnected_apps() {
    let h = harness(HarvestMode::Serverless);
    h.harvest.start_harvest(&h.rpm);

    h.harvest.harvest_app_now(APP).await;
    assert!(h.sender.calls().is_empty());
}

#[tokio::test]
async fn invalid_license_shuts_the_app_down() {
    let sender = MockDataSender::new();
    sender.script_connect(Err(SendError::LicenseInvalid("bad key".to_string())));
    let h = harness_with(sender, HarvestMode::Serverless);

    let result = h.rpm.launch().await;
    assert!(matches!(
        result,
        Err(ConnectError::Send(SendError::LicenseInvalid(_)))
    ));
    assert!(h.rpm.is_shut_down());
    assert!(!h.rpm.has_ever_connected());
}

#[tokio::test]
async fn connect_reply_without_required_parameters_is_rejected() {
    let sender = MockDataSender::with_server_config(ServerConfig {
        agent_run_id: Some(json!(1)),
        ..ServerConfig::default()
    });
    let h = harness_with(sender, HarvestMode::Serverless);

    match h.rpm.launch().await {
        Err(ConnectError::MissingParameters(missing)) => assert_eq!(
            missing,
            vec!["collect_errors", "collect_traces", "data_report_period"]
        ),
        other => panic!("unexpected connect result: {other:?}"),
    }
    assert!(!h.rpm.is_connected());
    assert!(!h.rpm.is_shut_down());
}

#[tokio::test]
async fn transaction_events_use_negotiated_limits() {
    let h = harness(HarvestMode::Serverless);
    let events = Arc::new(TransactionEventsService::new(
        TransactionEventsConfig::default(),
        Arc::clone(&h.stats),
    ));
    h.harvest.add_harvestable(events.harvestable(Arc::clone(&h.rpm)));
    h.rpm.launch().await.unwrap();

    let advertised = h.sender.calls().into_iter().find_map(|call| match call {
        Call::Connect(options) => Some(options.event_harvest_config.harvest_limits),
        _ => None,
    });
    assert_eq!(
        advertised,
        Some(HashMap::from([(ANALYTIC_EVENT_DATA.to_string(), 2000)]))
    );

    for priority in [0.2, 0.4, 0.6] {
        events.transaction_finished(&finished_transaction(priority), &TransactionStats::default());
    }
    h.harvest.harvest_app_now(APP).await;

    assert!(h.sender.calls().contains(&Call::Events {
        endpoint: ANALYTIC_EVENT_DATA,
        reservoir_size: 833,
        seen: 3,
        count: 3,
    }));
    assert_eq!(events.pending(APP), (0, 0));
}

#[tokio::test]
async fn transaction_events_are_kept_after_retryable_failure() {
    let h = harness(HarvestMode::Serverless);
    let events = Arc::new(TransactionEventsService::new(
        TransactionEventsConfig::default(),
        Arc::clone(&h.stats),
    ));
    h.harvest.add_harvestable(events.harvestable(Arc::clone(&h.rpm)));
    h.rpm.launch().await.unwrap();
    h.sender.script(ANALYTIC_EVENT_DATA, Err(unavailable()));

    events.transaction_finished(&finished_transaction(0.5), &TransactionStats::default());
    events.transaction_finished(&finished_transaction(0.7), &TransactionStats::default());
    h.harvest.harvest_app_now(APP).await;

    assert_eq!(events.pending(APP), (2, 2));
}

#[tokio::test]
async fn disabled_harvest_limit_skips_the_harvestable() {
    let mut config = server_config();
    if let Some(harvest) = config.event_harvest_config.as_mut() {
        harvest
            .harvest_limits
            .insert(ANALYTIC_EVENT_DATA.to_string(), 0);
    }
    let h = harness_with(MockDataSender::with_server_config(config), HarvestMode::Serverless);
    let events = Arc::new(TransactionEventsService::new(
        TransactionEventsConfig::default(),
        Arc::clone(&h.stats),
    ));
    h.harvest.add_harvestable(events.harvestable(Arc::clone(&h.rpm)));
    h.rpm.launch().await.unwrap();

    events.transaction_finished(&finished_transaction(0.5), &TransactionStats::default());
    h.harvest.harvest_app_now(APP).await;

    assert!(h.sender.event_counts(ANALYTIC_EVENT_DATA).is_empty());
    assert_eq!(events.pending(APP), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn periodic_harvest_runs_after_initial_delay() {
    let h = harness(HarvestMode::Periodic);
    h.rpm.launch().await.unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.sender.count(METRIC_DATA), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sender.count(METRIC_DATA), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.sender.count(METRIC_DATA), 2);

    h.harvest.stop();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.sender.count(METRIC_DATA), 2);
}

#[tokio::test(start_paused = true)]
async fn harvestables_first_run_one_period_after_connect() {
    let h = harness(HarvestMode::Periodic);
    let events = Arc::new(TransactionEventsService::new(
        TransactionEventsConfig::default(),
        Arc::clone(&h.stats),
    ));
    h.harvest.add_harvestable(events.harvestable(Arc::clone(&h.rpm)));
    h.rpm.launch().await.unwrap();
    events.transaction_finished(&finished_transaction(0.5), &TransactionStats::default());

    // the negotiated report period is 5 seconds
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(h.sender.event_counts(ANALYTIC_EVENT_DATA).is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sender.event_counts(ANALYTIC_EVENT_DATA), vec![1]);

    h.harvest.stop();
}

#[tokio::test(start_paused = true)]
async fn connection_service_backs_off_between_attempts() {
    let sender = MockDataSender::new();
    for _ in 0..2 {
        sender.script_connect(Err(SendError::HostUnreachable(
            "collector.newrelic.com".to_string(),
        )));
    }
    let h = harness_with(sender, HarvestMode::Serverless);
    let connections = ConnectionService::new(
        Arc::clone(&h.rpm),
        Arc::clone(&h.stats),
        false,
        h.shutdown.clone(),
    );
    let _task = connections.connect(Arc::clone(&h.rpm)).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.sender.count(CONNECT), 2);
    assert!(!h.rpm.is_connected());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.sender.count(CONNECT), 3);
    assert!(h.rpm.is_connected());

    let attempts = h
        .stats
        .take_for_harvest(APP)
        .unscoped()
        .stats(SUPPORTABILITY_AGENT_CONNECT_BACKOFF_ATTEMPTS)
        .map(|stats| stats.call_count());
    assert_eq!(attempts, Some(3));
    h.shutdown.cancel();
}

#[tokio::test]
async fn synchronous_startup_connects_before_returning() {
    let h = harness(HarvestMode::Serverless);
    let connections = ConnectionService::new(
        Arc::clone(&h.rpm),
        Arc::clone(&h.stats),
        true,
        h.shutdown.clone(),
    );
    let _task = connections.connect(Arc::clone(&h.rpm)).await;
    assert!(h.rpm.is_connected());
    assert_eq!(h.rpm.run_token().as_deref(), Some("run-1"));
    h.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn repeated_force_restart_hands_reconnect_to_connection_service() {
    let h = harness(HarvestMode::Serverless);
    let connections = ConnectionService::new(
        Arc::clone(&h.rpm),
        Arc::clone(&h.stats),
        true,
        h.shutdown.clone(),
    );
    let _task = connections.connect(Arc::clone(&h.rpm)).await;
    for _ in 0..2 {
        h.sender.script(
            ANALYTIC_EVENT_DATA,
            Err(SendError::ForceRestart("restart".to_string())),
        );
    }

    let result = h.rpm.send_analytics_events(10, 1, &[Event::new(1.0)]).await;
    assert!(matches!(result, Err(SendError::ForceRestart(_))));
    assert!(!h.rpm.is_connected());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.rpm.is_connected());
    assert_eq!(h.sender.count(CONNECT), 3);
    h.shutdown.cancel();
}
