// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction lifecycle tracking.
//!
//! A [`transaction::Transaction`] is one logical unit of work. Each execution
//! context that contributes to it owns an [`activity::TransactionActivity`]
//! holding a strict LIFO stack of spans. Work handed to another execution
//! context is tracked with an [`token::Token`]. Once every activity has
//! finished and every token has expired the transaction finalizes exactly once
//! and its stats are merged into the per-application [`stats::StatsService`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod activity;
pub mod attributes;
pub mod config;
pub mod context;
pub mod counts;
pub mod dispatcher;
pub mod error;
pub mod metric_names;
pub mod naming;
pub mod segment;
pub mod service;
pub mod sources;
pub mod stats;
pub mod token;
pub mod tracer;
pub mod transaction;
