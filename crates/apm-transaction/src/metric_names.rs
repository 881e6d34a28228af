// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub const WEB_TRANSACTION: &str = "WebTransaction";
pub const URI_WEB_TRANSACTION: &str = "WebTransaction/Uri";
pub const OTHER_TRANSACTION: &str = "OtherTransaction";
pub const OTHER_TRANSACTION_ALL: &str = "OtherTransaction/all";
pub const DISPATCHER: &str = "HttpDispatcher";
pub const WEB_TRANSACTION_TOTAL_TIME: &str = "WebTransactionTotalTime";
pub const OTHER_TRANSACTION_TOTAL_TIME: &str = "OtherTransactionTotalTime";
pub const CPU_PREFIX: &str = "CPU/";
pub const GC_CUMULATIVE: &str = "GC/cumulative";
pub const QUEUE_TIME: &str = "WebFrontend/QueueTime";

pub const SUPPORTABILITY_TRANSACTION_SEGMENT_CLAMP: &str = "Supportability/TransactionSegmentClamp";
pub const SUPPORTABILITY_ASYNC_TOKEN_CREATE: &str = "Supportability/Async/Token/Create";
pub const SUPPORTABILITY_ASYNC_TOKEN_EXPIRE: &str = "Supportability/Async/Token/Expire";
pub const SUPPORTABILITY_ASYNC_TOKEN_TIMEOUT: &str = "Supportability/Async/Token/Timeout";
pub const SUPPORTABILITY_ASYNC_TOKEN_LINK_SUCCESS: &str = "Supportability/Async/Token/Link/Success";
pub const SUPPORTABILITY_ASYNC_TOKEN_LINK_IGNORE: &str = "Supportability/Async/Token/Link/Ignore";
pub const SUPPORTABILITY_ASYNC_FINISH_SEGMENT_NOT_CALLED: &str =
    "Supportability/Timeout/finishSegmentNotCalled";
pub const SUPPORTABILITY_TRANSACTION_CANCELLED: &str = "Supportability/Transaction/Cancelled";
pub const SUPPORTABILITY_INCONSISTENT_STATE: &str = "Supportability/Transaction/InconsistentState";
