// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use apm_agent::config::AgentConfig;
use apm_agent::logger::init_logging;
use apm_agent::services::AgentServices;
use tracing::{error, info};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env().context("reading agent configuration")?;
    init_logging(&config.log_level).context("installing the log subscriber")?;

    let handle = match AgentServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Agent failed to start: {e}");
            return Err(e.into());
        }
    };

    let shutdown = handle.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
            }
            info!("Received shutdown signal");
        }
        () = shutdown.cancelled() => {}
    }

    handle.stop().await?;
    Ok(())
}
