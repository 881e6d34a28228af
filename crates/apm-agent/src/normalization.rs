// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Naming rules sent by the collector on connect.

use apm_harvest::data_sender::ServerConfig;
use apm_harvest::rpm_service::{ConnectionListener, RpmService};
use apm_transaction::naming::{AppNormalizers, Normalizer, NormalizerRegistry};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    match_expression: String,
    #[serde(default)]
    replacement: Option<String>,
    #[serde(default)]
    ignore: bool,
    #[serde(default)]
    eval_order: i64,
    #[serde(default)]
    terminate_chain: bool,
    #[serde(default)]
    replace_all: bool,
    #[serde(default)]
    each_segment: bool,
}

/// One regex rewrite. A matching `ignore` rule drops the name.
#[derive(Debug, Clone)]
pub struct NameRule {
    pattern: Regex,
    replacement: String,
    ignore: bool,
    eval_order: i64,
    terminate_chain: bool,
    replace_all: bool,
    each_segment: bool,
}

// Collector replacements use `\1` for groups; the regex crate wants `${1}`.
fn backreferences() -> &'static Regex {
    static BACKREFERENCE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    BACKREFERENCE.get_or_init(|| Regex::new(r"\\(\d+)").expect("valid backreference pattern"))
}

impl NameRule {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let raw = RawRule::deserialize(value).map_err(|e| e.to_string())?;
        let pattern = RegexBuilder::new(&raw.match_expression)
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string())?;
        let replacement = raw.replacement.unwrap_or_default();
        let replacement = backreferences()
            .replace_all(&replacement, "$${${1}}")
            .into_owned();
        Ok(Self {
            pattern,
            replacement,
            ignore: raw.ignore,
            eval_order: raw.eval_order,
            terminate_chain: raw.terminate_chain,
            replace_all: raw.replace_all,
            each_segment: raw.each_segment,
        })
    }

    pub fn eval_order(&self) -> i64 {
        self.eval_order
    }

    fn rewrite<'a>(&self, input: &'a str) -> Option<Cow<'a, str>> {
        if !self.pattern.is_match(input) {
            return None;
        }
        Some(if self.replace_all {
            self.pattern.replace_all(input, self.replacement.as_str())
        } else {
            self.pattern.replace(input, self.replacement.as_str())
        })
    }

    fn apply(&self, name: &str) -> RuleOutcome {
        if self.each_segment {
            let mut matched = false;
            let segments: Vec<String> = name
                .split('/')
                .enumerate()
                .map(|(index, segment)| {
                    if index == 0 {
                        return segment.to_string();
                    }
                    match self.rewrite(segment) {
                        Some(rewritten) => {
                            matched = true;
                            rewritten.into_owned()
                        }
                        None => segment.to_string(),
                    }
                })
                .collect();
            return match (matched, self.ignore) {
                (false, _) => RuleOutcome::NoMatch,
                (true, true) => RuleOutcome::Ignore,
                (true, false) => RuleOutcome::Renamed(segments.join("/")),
            };
        }
        match self.rewrite(name) {
            None => RuleOutcome::NoMatch,
            Some(_) if self.ignore => RuleOutcome::Ignore,
            Some(rewritten) => RuleOutcome::Renamed(rewritten.into_owned()),
        }
    }
}

enum RuleOutcome {
    NoMatch,
    Ignore,
    Renamed(String),
}

/// Applies rules in eval order until one that terminates the chain matches.
#[derive(Debug, Clone, Default)]
pub struct RuleNormalizer {
    rules: Vec<NameRule>,
}

impl RuleNormalizer {
    pub fn new(mut rules: Vec<NameRule>) -> Self {
        rules.sort_by_key(NameRule::eval_order);
        Self { rules }
    }

    /// Builds from the collector's rule list, skipping rules that do not parse.
    pub fn from_values(kind: &str, values: &[Value]) -> Self {
        let rules = values
            .iter()
            .filter_map(|value| match NameRule::from_value(value) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Ignoring invalid {kind} name rule {value}: {e}");
                    None
                }
            })
            .collect();
        Self::new(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Normalizer for RuleNormalizer {
    fn normalize(&self, name: &str) -> Option<String> {
        let mut current = name.to_string();
        for rule in &self.rules {
            match rule.apply(&current) {
                RuleOutcome::NoMatch => continue,
                RuleOutcome::Ignore => return None,
                RuleOutcome::Renamed(renamed) => {
                    current = renamed;
                    if rule.terminate_chain {
                        break;
                    }
                }
            }
        }
        Some(current)
    }
}

/// Installs the collector's naming rules for each application as it connects.
#[derive(Debug)]
pub struct NameRulesListener {
    normalizers: Arc<NormalizerRegistry>,
}

impl NameRulesListener {
    pub fn new(normalizers: Arc<NormalizerRegistry>) -> Self {
        Self { normalizers }
    }
}

impl ConnectionListener for NameRulesListener {
    fn connected(&self, rpm: &Arc<RpmService>, config: &ServerConfig) {
        let transaction = RuleNormalizer::from_values("transaction", &config.transaction_name_rules);
        let metric = RuleNormalizer::from_values("metric", &config.metric_name_rules);
        debug!(
            "Installing {} transaction and {} metric name rules for {}",
            transaction.len(),
            metric.len(),
            rpm.app_name()
        );
        self.normalizers.set(
            rpm.app_name(),
            AppNormalizers {
                transaction: Arc::new(transaction),
                metric: Arc::new(metric),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer(rules: Value) -> RuleNormalizer {
        RuleNormalizer::from_values("test", rules.as_array().unwrap())
    }

    #[test]
    fn test_replacement_with_backreference() {
        let rules = normalizer(json!([{
            "match_expression": "^(WebTransaction/Uri/user)/\\d+$",
            "replacement": "\\1/*",
        }]));
        assert_eq!(
            rules.normalize("WebTransaction/Uri/user/1234").as_deref(),
            Some("WebTransaction/Uri/user/*")
        );
        assert_eq!(
            rules.normalize("WebTransaction/Uri/account").as_deref(),
            Some("WebTransaction/Uri/account")
        );
    }

    #[test]
    fn test_ignore_rule_drops_name() {
        let rules = normalizer(json!([{
            "match_expression": ".*/health$",
            "ignore": true,
        }]));
        assert_eq!(rules.normalize("WebTransaction/Uri/health"), None);
        assert!(rules.normalize("WebTransaction/Uri/orders").is_some());
    }

    #[test]
    fn test_rules_run_in_eval_order_until_terminated() {
        let rules = normalizer(json!([
            { "match_expression": "b", "replacement": "c", "eval_order": 2 },
            { "match_expression": "a", "replacement": "b", "eval_order": 1, "terminate_chain": true },
        ]));
        assert_eq!(rules.normalize("a").as_deref(), Some("b"));

        let rules = normalizer(json!([
            { "match_expression": "b", "replacement": "c", "eval_order": 2 },
            { "match_expression": "a", "replacement": "b", "eval_order": 1 },
        ]));
        assert_eq!(rules.normalize("a").as_deref(), Some("c"));
    }

    #[test]
    fn test_replace_all_and_each_segment() {
        let rules = normalizer(json!([{
            "match_expression": "\\d",
            "replacement": "#",
            "replace_all": true,
        }]));
        assert_eq!(rules.normalize("Custom/a1b22").as_deref(), Some("Custom/a#b##"));

        let rules = normalizer(json!([{
            "match_expression": "^[0-9a-f]{8,}$",
            "replacement": "*",
            "each_segment": true,
        }]));
        assert_eq!(
            rules.normalize("WebTransaction/deadbeef00/items/cafebabe11").as_deref(),
            Some("WebTransaction/*/items/*")
        );
    }

    #[test]
    fn test_invalid_rules_are_skipped() {
        let rules = normalizer(json!([
            { "match_expression": "(unclosed" },
            { "replacement": "missing match" },
            { "match_expression": "x", "replacement": "y" },
        ]));
        assert_eq!(rules.len(), 1);
    }
}
