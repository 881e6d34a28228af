// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction and application naming with priorities, plus the normalizer
//! contract used to apply server-provided naming rules.

use crate::metric_names::{OTHER_TRANSACTION, WEB_TRANSACTION};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Maps a raw name to its reported form. `None` means the name is ignored.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNormalizer;

impl Normalizer for NoOpNormalizer {
    fn normalize(&self, name: &str) -> Option<String> {
        Some(name.to_string())
    }
}

/// Normalizers for one application.
#[derive(Clone)]
pub struct AppNormalizers {
    pub transaction: Arc<dyn Normalizer>,
    pub metric: Arc<dyn Normalizer>,
}

impl Default for AppNormalizers {
    fn default() -> Self {
        Self {
            transaction: Arc::new(NoOpNormalizer),
            metric: Arc::new(NoOpNormalizer),
        }
    }
}

impl std::fmt::Debug for AppNormalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppNormalizers").finish_non_exhaustive()
    }
}

/// Normalizers per application, replaced whenever an application (re)connects.
#[derive(Debug, Default)]
pub struct NormalizerRegistry {
    normalizers: RwLock<HashMap<String, AppNormalizers>>,
}

impl NormalizerRegistry {
    pub fn set(&self, app: &str, normalizers: AppNormalizers) {
        #[allow(clippy::expect_used)]
        let mut map = self.normalizers.write().expect("lock poisoned");
        map.insert(app.to_string(), normalizers);
    }

    pub fn get(&self, app: &str) -> AppNormalizers {
        #[allow(clippy::expect_used)]
        let map = self.normalizers.read().expect("lock poisoned");
        map.get(app).cloned().unwrap_or_default()
    }

    pub fn transaction_normalizer(&self, app: &str) -> Arc<dyn Normalizer> {
        self.get(app).transaction
    }

    pub fn metric_normalizer(&self, app: &str) -> Arc<dyn Normalizer> {
        self.get(app).metric
    }
}

/// Ordered lowest to highest. A name only replaces one of lower priority,
/// or of equal priority when overriding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum NamePriority {
    #[default]
    None,
    RequestUri,
    StatusCode,
    FrameworkLow,
    Framework,
    FrameworkHigh,
    CustomLow,
    CustomHigh,
}

impl NamePriority {
    fn accepts(self, incoming: NamePriority, override_same: bool) -> bool {
        incoming > self || (override_same && incoming == self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityTransactionName {
    name: Option<String>,
    category: String,
    priority: NamePriority,
    frozen: bool,
}

impl PriorityTransactionName {
    /// Full name such as `WebTransaction/Uri/users`.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn priority(&self) -> NamePriority {
        self.priority
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Builds the full name from `category` and `parts` under the web or other prefix.
    pub fn set(
        &mut self,
        priority: NamePriority,
        override_same: bool,
        web: bool,
        category: &str,
        parts: &[&str],
    ) -> bool {
        if self.frozen || !self.priority.accepts(priority, override_same) {
            return false;
        }
        let prefix = if web { WEB_TRANSACTION } else { OTHER_TRANSACTION };
        let joined = parts
            .iter()
            .map(|part| part.trim_matches('/'))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let mut name = String::from(prefix);
        for segment in [category.trim_matches('/'), joined.as_str()] {
            if !segment.is_empty() {
                name.push('/');
                name.push_str(segment);
            }
        }
        self.name = Some(name);
        self.category = category.to_string();
        self.priority = priority;
        true
    }

    /// Replaces the name wholesale, keeping category and priority. Used for normalization.
    pub(crate) fn rename(&mut self, name: String) {
        if !self.frozen {
            self.name = Some(name);
        }
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Takes over `other`'s name when it has at least the same priority.
    pub(crate) fn adopt(&mut self, other: &PriorityTransactionName) -> bool {
        if self.frozen || other.name.is_none() || !self.priority.accepts(other.priority, true) {
            return false;
        }
        self.name.clone_from(&other.name);
        self.category.clone_from(&other.category);
        self.priority = other.priority;
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityApplicationName {
    name: Option<String>,
    priority: NamePriority,
}

impl PriorityApplicationName {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> NamePriority {
        self.priority
    }

    pub fn set(&mut self, priority: NamePriority, name: &str, override_same: bool) -> bool {
        if name.is_empty() || !self.priority.accepts(priority, override_same) {
            return false;
        }
        self.name = Some(name.to_string());
        self.priority = priority;
        true
    }
}
