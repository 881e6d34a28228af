// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use serde_json::{Map, Value};

pub const SEGMENT_CLAMP: &str = "nr.segment_clamp";
pub const SIZE_LIMIT: &str = "size_limit";
pub const STACK_TRACE_CLAMP: &str = "nr.stack_trace_clamp";
pub const TOKEN_CLAMP: &str = "nr.token_clamp";
pub const EXPLAIN_PLAN_CLAMP: &str = "nr.explain_plan_clamp";
pub const TIMEOUT_CAUSE: &str = "nr.timeoutCause";
pub const PRIORITY: &str = "priority";
pub const CPU_TIME: &str = "cpu_time";
pub const GC_TIME: &str = "gc_time";
pub const THREAD_NAME: &str = "thread.name";
pub const ASYNC_CONTEXT: &str = "async_context";
pub const SEGMENT_START_CONTEXT: &str = "start_thread";
pub const SEGMENT_END_CONTEXT: &str = "end_thread";

pub type AttributeMap = Map<String, Value>;

/// Attribute maps carried by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionAttributes {
    pub agent: AttributeMap,
    pub intrinsic: AttributeMap,
    pub user: AttributeMap,
    pub error: AttributeMap,
    pub internal: AttributeMap,
}

impl TransactionAttributes {
    /// Copies every attribute of `other` into `self`; values from `other` replace existing keys.
    pub fn put_all(&mut self, other: &TransactionAttributes) {
        fn extend(into: &mut AttributeMap, from: &AttributeMap) {
            for (key, value) in from {
                into.insert(key.clone(), value.clone());
            }
        }
        extend(&mut self.internal, &other.internal);
        extend(&mut self.agent, &other.agent);
        extend(&mut self.intrinsic, &other.intrinsic);
        extend(&mut self.user, &other.user);
        extend(&mut self.error, &other.error);
    }
}
