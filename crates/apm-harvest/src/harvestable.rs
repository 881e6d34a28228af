// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::time::Duration;

/// A data kind harvested on its own schedule, separate from metric data.
///
/// The period and sample cap are negotiated with the collector on connect
/// and handed over through [`Harvestable::configure`].
#[async_trait]
pub trait Harvestable: Send + Sync {
    fn app_name(&self) -> &str;

    /// The collector method this data is sent to.
    fn endpoint(&self) -> &'static str;

    fn max_samples_stored(&self) -> usize;

    fn configure(&self, report_period: Duration, max_samples_stored: usize);

    async fn harvest(&self);
}
