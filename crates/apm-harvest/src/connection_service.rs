// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background connect attempts with backoff.

use crate::metric_names::SUPPORTABILITY_AGENT_CONNECT_BACKOFF_ATTEMPTS;
use crate::rpm_service::RpmService;
use apm_transaction::stats::{StatsService, StatsWork};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Seconds to wait after the previous attempt, by attempt number.
pub const BACKOFF_INTERVALS_SECS: [u64; 7] = [0, 15, 15, 30, 60, 120, 300];
pub const MAX_BACKOFF_DELAY_SECS: u64 = 300;
pub const CONNECT_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct Backoff {
    index: usize,
    last_attempt: Option<Instant>,
}

impl Backoff {
    /// Whether an attempt is due at `now`. An allowed attempt is recorded.
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        let last = *self.last_attempt.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last).as_secs();
        if elapsed < BACKOFF_INTERVALS_SECS[self.index] {
            return false;
        }
        if elapsed < MAX_BACKOFF_DELAY_SECS && self.index + 1 < BACKOFF_INTERVALS_SECS.len() {
            self.index += 1;
        }
        self.last_attempt = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.last_attempt = None;
    }
}

/// Keeps every application connected.
#[derive(Clone)]
pub struct ConnectionService {
    main: Arc<RpmService>,
    stats: Arc<StatsService>,
    sync_startup: bool,
    shutdown: CancellationToken,
}

impl ConnectionService {
    pub fn new(
        main: Arc<RpmService>,
        stats: Arc<StatsService>,
        sync_startup: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            main,
            stats,
            sync_startup,
            shutdown,
        }
    }

    /// Starts keeping `rpm` connected. The main application connects before
    /// this returns when startup is synchronous or the agent is serverless.
    pub async fn connect(&self, rpm: Arc<RpmService>) -> JoinHandle<()> {
        if rpm.is_main_app() && (self.sync_startup || rpm.is_serverless()) {
            debug!("Connecting {} before startup completes", rpm.app_name());
            if !rpm.is_connected() {
                self.attempt(&rpm).await;
            }
        }
        self.spawn(rpm)
    }

    async fn attempt(&self, rpm: &Arc<RpmService>) -> bool {
        match rpm.launch().await {
            Ok(()) => true,
            Err(e) => {
                info!(
                    "Failed to connect to {} for {}: {e}",
                    rpm.host_string(),
                    rpm.app_name()
                );
                false
            }
        }
    }

    fn main_app_ready(&self, rpm: &RpmService) -> bool {
        rpm.is_main_app() || self.main.is_connected()
    }

    fn spawn(&self, rpm: Arc<RpmService>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let reporting_stopped = rpm.shutdown_token();
            let mut backoff = Backoff::default();
            let mut interval = tokio::time::interval(CONNECT_ATTEMPT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = rpm.connect_requested() => {
                        backoff.reset();
                    }
                    () = service.shutdown.cancelled() => {
                        debug!("Stopping connection task for {}", rpm.app_name());
                        break;
                    }
                    () = reporting_stopped.cancelled() => {
                        debug!("Reporting stopped for {}, no further connect attempts", rpm.app_name());
                        break;
                    }
                }

                if rpm.is_connected() {
                    backoff.reset();
                    continue;
                }
                if !service.main_app_ready(&rpm) || !backoff.should_attempt(Instant::now()) {
                    continue;
                }
                service.stats.do_stats_work(
                    rpm.app_name(),
                    StatsWork::increment_counter(SUPPORTABILITY_AGENT_CONNECT_BACKOFF_ATTEMPTS, 1),
                );
                if service.attempt(&rpm).await {
                    backoff.reset();
                }
            }
        })
    }
}
