// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub const SUPPORTABILITY_METRIC_HARVEST_INTERVAL: &str = "Supportability/MetricHarvest/interval";
pub const SUPPORTABILITY_METRIC_HARVEST_TRANSMIT: &str = "Supportability/MetricHarvest/transmit";
pub const SUPPORTABILITY_METRIC_HARVEST_COUNT: &str = "Supportability/MetricHarvest/count";
pub const SUPPORTABILITY_HARVEST_SERVICE_RESPONSE_TIME: &str = "Supportability/Harvest/Service";
pub const SUPPORTABILITY_AGENT_CONNECT_BACKOFF_ATTEMPTS: &str =
    "Supportability/AgentConnect/Backoff/Attempts";
pub const SUPPORTABILITY_CONNECT_MISSING_EVENT_DATA: &str =
    "Supportability/Agent/Collector/MissingEventHarvestConfig";
pub const SUPPORTABILITY_EVENT_HARVEST_REPORT_PERIOD: &str =
    "Supportability/EventHarvest/ReportPeriod";
pub const SUPPORTABILITY_TRANSACTION_EVENTS_SENT: &str =
    "Supportability/AnalyticsEvents/TotalEventsSent";
pub const SUPPORTABILITY_TRANSACTION_EVENTS_SEEN: &str =
    "Supportability/AnalyticsEvents/TotalEventsSeen";
pub const SUPPORTABILITY_TRANSACTION_EVENTS_DISCARDED: &str =
    "Supportability/AnalyticsEvents/TotalEventsDiscarded";
