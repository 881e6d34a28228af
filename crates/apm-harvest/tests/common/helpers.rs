// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers wiring an application to the mock collector

use super::mocks::MockDataSender;
use apm_harvest::data_sender::{EventHarvestConfig, ServerConfig, ANALYTIC_EVENT_DATA};
use apm_harvest::harvest_service::{HarvestConfig, HarvestMode, HarvestService};
use apm_harvest::rpm_service::{RpmService, RpmServiceConfig};
use apm_transaction::attributes::TransactionAttributes;
use apm_transaction::dispatcher::DispatcherKind;
use apm_transaction::naming::NormalizerRegistry;
use apm_transaction::stats::StatsService;
use apm_transaction::transaction::{TransactionData, TransactionId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const APP: &str = "My Application";

/// A connect reply carrying everything an agent needs to report.
pub fn server_config() -> ServerConfig {
    ServerConfig {
        agent_run_id: Some(json!("run-1")),
        collect_errors: Some(true),
        collect_traces: Some(true),
        data_report_period: Some(60),
        event_harvest_config: Some(EventHarvestConfig {
            report_period_ms: Some(5000),
            harvest_limits: HashMap::from([(ANALYTIC_EVENT_DATA.to_string(), 833)]),
        }),
        ..ServerConfig::default()
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub sender: Arc<MockDataSender>,
    pub stats: Arc<StatsService>,
    pub rpm: Arc<RpmService>,
    pub harvest: HarvestService,
    pub shutdown: CancellationToken,
}

#[allow(dead_code)]
pub fn harness(mode: HarvestMode) -> Harness {
    harness_with(MockDataSender::new(), mode)
}

pub fn harness_with(sender: MockDataSender, mode: HarvestMode) -> Harness {
    let sender = Arc::new(sender);
    let stats = Arc::new(StatsService::new(APP));
    let rpm = Arc::new(RpmService::new(
        RpmServiceConfig::new(APP),
        sender.clone(),
        Arc::clone(&stats),
        Arc::new(NormalizerRegistry::default()),
    ));
    let shutdown = CancellationToken::new();
    let harvest = HarvestService::new(
        HarvestConfig {
            mode,
            ..HarvestConfig::default()
        },
        Arc::clone(&stats),
        shutdown.clone(),
    );
    rpm.add_connection_listener(Arc::new(harvest.clone()));
    rpm.set_harvest_limits_source(Arc::new(harvest.clone()));
    Harness {
        sender,
        stats,
        rpm,
        harvest,
        shutdown,
    }
}

#[allow(dead_code)]
pub fn finished_transaction(priority: f32) -> TransactionData {
    TransactionData {
        id: TransactionId(7),
        guid: "0af7651916cd43dd".to_string(),
        app_name: APP.to_string(),
        name: "OtherTransaction/Custom/job".to_string(),
        dispatcher: DispatcherKind::Other,
        uri: None,
        start_time_ms: 1_700_000_000_000,
        duration: Duration::from_millis(40),
        response_time: Duration::from_millis(40),
        total_time: Duration::from_millis(40),
        queue_time: Duration::ZERO,
        cpu_time: None,
        gc_time: None,
        priority,
        sampled: false,
        attributes: TransactionAttributes::default(),
        timeout_cause: None,
        segments: Vec::new(),
        activity_count: 1,
        segment_count: 1,
        token_count: 0,
        timed_out_tokens: 0,
    }
}
