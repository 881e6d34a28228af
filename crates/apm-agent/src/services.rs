// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::normalization::NameRulesListener;
use crate::sender::data_sender;
use apm_harvest::connection_service::ConnectionService;
use apm_harvest::data_sender::DataSender;
use apm_harvest::harvest_service::{HarvestService, ImmediateHarvestTrigger};
use apm_harvest::rpm_service::{RpmService, RpmServiceConfig};
use apm_harvest::transaction_events::{TransactionEventsConfig, TransactionEventsService};
use apm_transaction::naming::NormalizerRegistry;
use apm_transaction::service::TransactionService;
use apm_transaction::stats::StatsService;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of the agent services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Handle to the running agent.
///
/// Instrumentation creates execution contexts through
/// [`AgentHandle::transactions`]; stopping performs one final harvest.
#[derive(Clone)]
pub struct AgentHandle {
    status: Arc<RwLock<AgentStatus>>,
    status_tx: broadcast::Sender<AgentStatus>,
    shutdown: CancellationToken,
    transactions: TransactionService,
    harvest: HarvestService,
    rpm: Arc<RpmService>,
    events: Arc<TransactionEventsService>,
    immediate: Option<Arc<ImmediateHarvestTrigger>>,
    shutdown_timeout: std::time::Duration,
    tasks: Arc<TokioMutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("app_name", &self.rpm.app_name())
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, AgentStatus::Running)
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    pub fn transactions(&self) -> &TransactionService {
        &self.transactions
    }

    pub fn harvest_service(&self) -> &HarvestService {
        &self.harvest
    }

    pub fn rpm(&self) -> &Arc<RpmService> {
        &self.rpm
    }

    pub fn transaction_events(&self) -> &Arc<TransactionEventsService> {
        &self.events
    }

    /// Cancelled once the agent begins stopping.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn harvest_now(&self) {
        self.harvest.harvest_now().await;
    }

    /// Sends what the finished transactions of this invocation recorded and
    /// returns once it is sent. Only harvests when every transaction is
    /// reported immediately; otherwise the schedule reports it.
    pub async fn end_invocation(&self) {
        match &self.immediate {
            Some(trigger) => trigger.flush().await,
            None => debug!("Periodic harvest configured, nothing to flush at end of invocation"),
        }
    }

    async fn set_status(&self, next: AgentStatus) {
        *self.status.write().await = next;
        let _ = self.status_tx.send(next);
    }

    /// Harvests one last time, disconnects and stops every background task.
    /// Stopping a stopped agent is a no-op.
    pub async fn stop(&self) -> Result<(), AgentError> {
        {
            let mut status = self.status.write().await;
            if matches!(*status, AgentStatus::Stopping | AgentStatus::Stopped) {
                return Ok(());
            }
            *status = AgentStatus::Stopping;
        }
        let _ = self.status_tx.send(AgentStatus::Stopping);
        info!("Shutting down agent services");

        self.harvest
            .stop_with_final_harvest(self.shutdown_timeout)
            .await;
        self.rpm.disconnect().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            match tokio::time::timeout(self.shutdown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Agent task failed during shutdown: {e}"),
                Err(_) => warn!("Agent task did not stop within {:?}", self.shutdown_timeout),
            }
        }

        self.set_status(AgentStatus::Stopped).await;
        debug!("Agent services stopped");
        Ok(())
    }
}

/// Wires the transaction core, the connection and the harvest pipeline.
pub struct AgentServices {
    config: AgentConfig,
    sender: Option<Arc<dyn DataSender>>,
}

impl std::fmt::Debug for AgentServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl AgentServices {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sender: None,
        }
    }

    /// Reports through `sender` instead of the one the configuration selects.
    pub fn with_sender(config: AgentConfig, sender: Arc<dyn DataSender>) -> Self {
        Self {
            config,
            sender: Some(sender),
        }
    }

    fn rpm_config(config: &AgentConfig) -> RpmServiceConfig {
        RpmServiceConfig {
            app_names: config.app_names.clone(),
            is_main_app: true,
            serverless: config.serverless,
            high_security: config.high_security,
            collector_host: config.host.clone(),
            collector_port: config.port,
            hostname: hostname(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            labels: config.labels.clone(),
            settings: json!({
                "serverless_mode": { "enabled": config.serverless },
                "sync_startup": config.sync_startup,
                "flush_strategy": format!("{:?}", config.flush_strategy),
                "segment_timeout": config.transaction.segment_timeout.as_secs(),
                "token_timeout": config.transaction.token_timeout.as_secs(),
            }),
        }
    }

    /// Start the agent services. The main application is connected before
    /// this returns when startup is synchronous or serverless.
    pub async fn start(self) -> Result<AgentHandle, AgentError> {
        let config = self.config;
        config.validate()?;

        let status = Arc::new(RwLock::new(AgentStatus::Starting));
        let (status_tx, _status_rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        let stats = Arc::new(StatsService::new(config.app_name()));
        let normalizers = Arc::new(NormalizerRegistry::default());
        let transactions = TransactionService::new(
            config.transaction_config(),
            Arc::clone(&stats),
            Arc::clone(&normalizers),
        )?;

        let sender = match self.sender {
            Some(sender) => sender,
            None => data_sender(&config)?,
        };
        let rpm = Arc::new(RpmService::new(
            Self::rpm_config(&config),
            sender,
            Arc::clone(&stats),
            Arc::clone(&normalizers),
        ));
        let harvest = HarvestService::new(
            config.harvest_config(),
            Arc::clone(&stats),
            shutdown.clone(),
        );

        rpm.add_connection_listener(Arc::new(NameRulesListener::new(Arc::clone(&normalizers))));
        rpm.add_connection_listener(Arc::new(harvest.clone()));
        rpm.set_harvest_limits_source(Arc::new(harvest.clone()));

        let events = Arc::new(TransactionEventsService::new(
            TransactionEventsConfig::default(),
            Arc::clone(&stats),
        ));
        transactions.add_listener(events.clone());
        harvest.add_harvestable(events.harvestable(Arc::clone(&rpm)));

        let mut tasks = Vec::new();
        let mut immediate = None;
        if config.harvests_immediately() {
            let (trigger, task) = harvest.spawn_immediate_harvester(shutdown.clone());
            transactions.set_harvest_trigger(trigger.clone());
            immediate = Some(trigger);
            tasks.push(task);
        }
        tasks.push(transactions.spawn_sweeper(shutdown.clone()));

        let connections = ConnectionService::new(
            Arc::clone(&rpm),
            Arc::clone(&stats),
            config.sync_startup,
            shutdown.clone(),
        );
        tasks.push(connections.connect(Arc::clone(&rpm)).await);

        let handle = AgentHandle {
            status,
            status_tx,
            shutdown,
            transactions,
            harvest,
            rpm,
            events,
            immediate,
            shutdown_timeout: config.shutdown_timeout,
            tasks: Arc::new(TokioMutex::new(tasks)),
        };
        handle.set_status(AgentStatus::Running).await;
        info!(
            "Agent started for {} (serverless: {})",
            config.app_name(),
            config.serverless
        );
        Ok(handle)
    }
}
