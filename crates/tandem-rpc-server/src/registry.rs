//! Method handler registration and lookup.
//!
//! Multiple handlers may share a method name; dispatch fans out to every
//! entry in registration order, each in isolation. Typed entries declare an
//! expected parameter type and fail with `InvalidParams` on a decode
//! mismatch instead of running their callback.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use tandem_json_rpc::LazyValue;

use crate::context::StateTransition;

/// What a successful handler invocation produced: the response `result`
/// plus an optional execution-context transition.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub result: Value,
    pub transition: Option<StateTransition>,
}

impl HandlerOutcome {
    pub fn result(result: Value) -> Self {
        Self {
            result,
            transition: None,
        }
    }

    pub fn with_transition(mut self, transition: StateTransition) -> Self {
        self.transition = Some(transition);
        self
    }
}

impl From<Value> for HandlerOutcome {
    fn from(result: Value) -> Self {
        Self::result(result)
    }
}

/// Failures a handler invocation can surface. The dispatcher converts these
/// to wire error responses for calls; notifications only log them.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Parameter decode failed for a typed entry
    #[error("invalid params, expected {expected}: {message}")]
    InvalidParams {
        expected: &'static str,
        message: String,
    },

    /// The method itself failed; becomes an InternalError response
    #[error("{0}")]
    Failed(String),
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// Trait for handling an inbound call or notification.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one inbound message for the method this entry is registered
    /// under. `params` is the request's lazily-decoded payload, if any.
    async fn handle(
        &self,
        method: &str,
        params: Option<&LazyValue>,
    ) -> Result<HandlerOutcome, HandlerError>;

    /// Expected-parameter-type tag; `Some` makes the entry "typed".
    fn expected_params(&self) -> Option<&'static str> {
        None
    }
}

/// An untyped function-based handler.
struct FunctionHandler<F> {
    callback: F,
}

#[async_trait]
impl<F> RpcHandler for FunctionHandler<F>
where
    F: Fn(Option<LazyValue>) -> BoxFuture<'static, Result<HandlerOutcome, HandlerError>>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        _method: &str,
        params: Option<&LazyValue>,
    ) -> Result<HandlerOutcome, HandlerError> {
        (self.callback)(params.cloned()).await
    }
}

/// A typed handler: decodes params into `T` before invoking the callback,
/// reporting `InvalidParams` (naming the expected type) on a mismatch.
/// Absent params decode from JSON null, so `Option<T>` payloads work.
struct TypedHandler<T, F> {
    callback: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F> RpcHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T) -> BoxFuture<'static, Result<HandlerOutcome, HandlerError>> + Send + Sync,
{
    async fn handle(
        &self,
        _method: &str,
        params: Option<&LazyValue>,
    ) -> Result<HandlerOutcome, HandlerError> {
        let invalid = |error: serde_json::Error| HandlerError::InvalidParams {
            expected: std::any::type_name::<T>(),
            message: error.to_string(),
        };
        let decoded: T = match params {
            Some(lazy) => lazy.decode().map_err(invalid)?,
            None => serde_json::from_value(Value::Null).map_err(invalid)?,
        };
        (self.callback)(decoded).await
    }

    fn expected_params(&self) -> Option<&'static str> {
        Some(std::any::type_name::<T>())
    }
}

/// One registration: a unique id, the method name it answers, and the
/// handler object.
#[derive(Clone)]
pub struct HandlerEntry {
    pub id: u64,
    pub method: String,
    pub handler: Arc<dyn RpcHandler>,
}

/// Thread-safe method-name to handler mapping with ordered fan-out.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<String, Vec<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler object. Returns the registration id used by
    /// [`remove`](Self::remove).
    pub fn add(&self, method: impl Into<String>, handler: impl RpcHandler + 'static) -> u64 {
        self.add_arc(method, Arc::new(handler))
    }

    fn add_arc(&self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let method = method.into();
        let mut entries = self.entries.write();
        entries.entry(method.clone()).or_default().push(HandlerEntry {
            id,
            method,
            handler,
        });
        id
    }

    /// Register an untyped function handler.
    pub fn add_fn<F>(&self, method: impl Into<String>, callback: F) -> u64
    where
        F: Fn(Option<LazyValue>) -> BoxFuture<'static, Result<HandlerOutcome, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.add(method, FunctionHandler { callback })
    }

    /// Register a typed function handler for parameter type `T`.
    pub fn add_typed<T, F>(&self, method: impl Into<String>, callback: F) -> u64
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> BoxFuture<'static, Result<HandlerOutcome, HandlerError>> + Send + Sync + 'static,
    {
        self.add(
            method,
            TypedHandler {
                callback,
                _marker: PhantomData,
            },
        )
    }

    /// Remove exactly one registration by id; returns whether it existed.
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let mut found = false;
        for list in entries.values_mut() {
            if let Some(index) = list.iter().position(|entry| entry.id == id) {
                list.remove(index);
                found = true;
                break;
            }
        }
        if found {
            entries.retain(|_, list| !list.is_empty());
        }
        found
    }

    /// All entries for a method, in registration order.
    pub fn entries_for(&self, method: &str) -> Vec<HandlerEntry> {
        self.entries
            .read()
            .get(method)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    /// The expected-parameter-type tag of the first typed entry for a
    /// method, if any. This is the method-name to type mapping consumed by
    /// allow-list construction.
    pub fn expected_params_for(&self, method: &str) -> Option<&'static str> {
        self.entries
            .read()
            .get(method)?
            .iter()
            .find_map(|entry| entry.handler.expected_params())
    }

    /// All registered method names.
    pub fn method_names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
