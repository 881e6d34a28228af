// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime measurements the host process may or may not be able to provide.

use std::time::Duration;

/// CPU time consumed by the calling execution context.
pub trait CpuTimeSource: Send + Sync {
    /// `None` when the platform cannot measure it.
    fn current_cpu_time(&self) -> Option<Duration>;
}

/// Cumulative garbage-collection pause time of the process.
pub trait GcTimeSource: Send + Sync {
    fn cumulative_gc_time(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl CpuTimeSource for Unsupported {
    fn current_cpu_time(&self) -> Option<Duration> {
        None
    }
}

impl GcTimeSource for Unsupported {
    fn cumulative_gc_time(&self) -> Option<Duration> {
        None
    }
}
