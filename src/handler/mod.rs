//! Handler registry.
//!
//! Items refer to their handler and completion callback by name
//! ([`HandlerRef`]). The registry resolves those names to callables at
//! dispatch time. A name with no registration is a handler failure for that
//! item, not an engine error.

use crate::model::{CompletionStatus, HandlerKind, HandlerRef, ItemId};
use crate::storage::TxContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error returned by user handlers and completion callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    pub cause: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            data: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Heuristic: the message, cause, or any string nested in `data`
    /// mentions a timeout.
    pub fn is_timeout(&self) -> bool {
        mentions_timeout(&self.message)
            || self.cause.as_deref().is_some_and(mentions_timeout)
            || self.data.as_ref().is_some_and(json_mentions_timeout)
    }

    /// JSON form stored as an item's `completion_result` on failure.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "message": self.message }))
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} (cause: {cause})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Lets transactional handlers use `?` on store operations such as
/// [`TxContext::enqueue`].
impl From<crate::error::Error> for HandlerError {
    fn from(e: crate::error::Error) -> Self {
        HandlerError::new(e.to_string())
    }
}

fn mentions_timeout(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

fn json_mentions_timeout(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => mentions_timeout(s),
        serde_json::Value::Array(values) => values.iter().any(json_mentions_timeout),
        serde_json::Value::Object(map) => map.values().any(json_mentions_timeout),
        _ => false,
    }
}

pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Runs inside the item's transaction. Its writes commit only on success.
pub type TransactionalFn =
    dyn Fn(&mut TxContext<'_>, &serde_json::Value) -> HandlerResult + Send + Sync;

/// Runs outside any transaction, possibly for a long time.
pub type ActionFn = dyn Fn(serde_json::Value) -> BoxFuture<HandlerResult> + Send + Sync;

/// Runs inside the transaction that deletes the item.
pub type CompletionFn =
    dyn Fn(&mut TxContext<'_>, &Completion) -> std::result::Result<(), HandlerError> + Send + Sync;

/// What a completion callback is told about the item it reports on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub item_id: ItemId,
    pub queue_id: String,
    pub status: CompletionStatus,
    pub result: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
}

/// A resolved primary handler.
#[derive(Clone)]
pub enum Handler {
    Transactional(Arc<TransactionalFn>),
    NonTransactional(Arc<ActionFn>),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Transactional(_) => HandlerKind::Transactional,
            Handler::NonTransactional(_) => HandlerKind::NonTransactional,
        }
    }
}

/// Registry of handlers and completion callbacks, indexed by name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    callbacks: HashMap<String, Arc<CompletionFn>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that runs inside a store transaction.
    ///
    /// The engine's store lock is held while it runs. The handler must do
    /// all store work through the supplied [`TxContext`]; calling back into
    /// an [`Engine`](crate::Engine) it captured deadlocks. A panic counts as
    /// a handler failure.
    pub fn transactional<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut TxContext<'_>, &serde_json::Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .insert(name.into(), Handler::Transactional(Arc::new(f)));
        self
    }

    /// Register a long-running handler executed under heartbeat.
    pub fn non_transactional<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let action: Arc<ActionFn> =
            Arc::new(move |payload| -> BoxFuture<HandlerResult> { Box::pin(f(payload)) });
        self.handlers
            .insert(name.into(), Handler::NonTransactional(action));
        self
    }

    /// Register a completion callback.
    ///
    /// Runs in the transaction that deletes the item, under the same rule
    /// as [`transactional`](Self::transactional): use the supplied
    /// [`TxContext`], never a captured [`Engine`](crate::Engine).
    pub fn on_complete<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut TxContext<'_>, &Completion) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(f));
        self
    }

    /// Look up a primary handler by reference.
    pub fn handler(&self, name: &HandlerRef) -> Option<&Handler> {
        self.handlers.get(name.as_str())
    }

    /// Look up a completion callback by reference.
    pub fn callback(&self, name: &HandlerRef) -> Option<&Arc<CompletionFn>> {
        self.callbacks.get(name.as_str())
    }
}
