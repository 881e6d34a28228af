// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Handles that keep a transaction alive while work is handed to another
//! execution context.

use crate::context::ExecutionContext;
use crate::transaction::Transaction;
use crate::tracer::SpanRef;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TokenInner {
    id: TokenId,
    transaction: Weak<Transaction>,
    initiating: SpanRef,
    active: AtomicBool,
}

/// A token counts toward its transaction's live references until it expires.
///
/// Cloning a token yields the same token: expiring any clone expires all of
/// them, and only the first expiry has an effect. The default token is a no-op
/// that links and expires nothing.
#[derive(Clone, Default)]
pub struct Token {
    inner: Option<Arc<TokenInner>>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Token")
                .field("id", &inner.id)
                .field("initiating", &inner.initiating)
                .field("active", &inner.active.load(Ordering::Acquire))
                .finish(),
            None => f.write_str("Token(noop)"),
        }
    }
}

impl Token {
    pub fn noop() -> Self {
        Self::default()
    }

    pub(crate) fn new(id: TokenId, transaction: &Arc<Transaction>, initiating: SpanRef) -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                id,
                transaction: Arc::downgrade(transaction),
                initiating,
                active: AtomicBool::new(true),
            })),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> Option<TokenId> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.active.load(Ordering::Acquire))
    }

    /// The span that was on top of the stack when the token was created.
    pub fn initiating_span(&self) -> Option<SpanRef> {
        self.inner.as_ref().map(|inner| inner.initiating)
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.inner.as_ref()?.transaction.upgrade()
    }

    /// Releases the token's reference. Returns `false` if it was already expired.
    pub fn expire(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        if !self.deactivate() {
            return false;
        }
        match inner.transaction.upgrade() {
            Some(transaction) => transaction.token_expired(inner.id),
            None => false,
        }
    }

    /// Flips the token inactive without touching its transaction.
    pub(crate) fn deactivate(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| {
            inner
                .active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Binds `context`'s current activity to this token's transaction.
    pub fn link(&self, context: &mut ExecutionContext) -> bool {
        context.link(self)
    }

    pub fn link_and_expire(&self, context: &mut ExecutionContext) -> bool {
        let linked = self.link(context);
        let expired = self.expire();
        linked && expired
    }
}
