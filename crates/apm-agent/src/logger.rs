// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for agent output.
//!
//! Lines look like:
//! ```text
//! APM_AGENT | INFO | Agent checkout connected to collector.newrelic.com:443
//! APM_AGENT | DEBUG | harvest{app=checkout}: Reported 42 timeslices for checkout
//! ```

use crate::error::AgentError;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "APM_AGENT";

/// Prefixes every line with [`LOG_PREFIX`] and the level, followed by the
/// active spans and the event's fields.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// The filter directive for `level`, with noisy HTTP internals silenced.
pub fn filter_directive(level: &str) -> String {
    format!("h2=off,hyper=off,rustls=off,{level}")
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces `level`.
pub fn init_logging(level: &str) -> Result<(), AgentError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(filter_directive(level)),
    }
    .map_err(|e| AgentError::Logging(e.to_string()))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AgentError::Logging(e.to_string()))
}
