// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector connection management and the harvest pipeline.
//!
//! An [`rpm_service::RpmService`] owns the connection of one application and
//! turns collector responses into retry decisions. The
//! [`connection_service::ConnectionService`] keeps applications connected
//! with backoff, and the [`harvest_service::HarvestService`] periodically
//! sends the metrics accumulated by `apm_transaction` along with every
//! registered [`harvestable::Harvestable`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod connection_service;
pub mod data_sender;
pub mod error;
pub mod harvest_service;
pub mod harvestable;
pub mod http_sender;
pub mod metric_names;
pub mod reservoir;
pub mod rpm_service;
pub mod transaction_events;
