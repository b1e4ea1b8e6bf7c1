//! Registration and dispatch of server-callable handlers.

use crate::binder::ParameterType;
use futures::future::BoxFuture;
use serde_json::Value;
use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};
use thiserror::Error;

/// Error surfaced by a handler callback; dispatch logs and swallows it so one
/// handler's failure never reaches the others or the receive loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Callback { message: String },
    #[error("argument extraction failed: {source}")]
    Arguments {
        #[from]
        source: serde_json::Error,
    },
}

impl HandlerError {
    pub fn callback(message: impl ToString) -> Self {
        HandlerError::Callback {
            message: message.to_string(),
        }
    }
}

/// Opaque registration state handed back to the handler on every dispatch.
pub type HandlerState = Arc<dyn Any + Send + Sync>;

pub type HandlerCallback = Arc<
    dyn Fn(Vec<Value>, HandlerState) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    key: u64,
    pub parameter_types: Vec<ParameterType>,
    pub callback: HandlerCallback,
    pub state: HandlerState,
}

/// Handler list reified per method name. Subscriptions reference the list
/// itself, so its identity is stable even after the registry drops the name.
#[derive(Default)]
pub(crate) struct HandlerList {
    entries: Mutex<Vec<HandlerEntry>>,
}

impl HandlerList {
    fn push(&self, entry: HandlerEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    fn remove(&self, key: u64) {
        self.entries.lock().unwrap().retain(|entry| entry.key != key);
    }

    fn snapshot(&self) -> Vec<HandlerEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn first_parameter_types(&self) -> Vec<ParameterType> {
        self.entries
            .lock()
            .unwrap()
            .first()
            .map(|entry| entry.parameter_types.clone())
            .unwrap_or_default()
    }
}

/// Token returned by handler registration. Dropping it removes exactly the
/// entry it was issued for; dropping it after the entry is already gone is a
/// no-op.
pub struct Subscription {
    list: Weak<HandlerList>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.key);
        }
    }
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    lists: Mutex<HashMap<String, Arc<HandlerList>>>,
    keys: AtomicU64,
}

impl HandlerRegistry {
    pub fn register(
        &self,
        target: &str,
        parameter_types: &[ParameterType],
        callback: HandlerCallback,
        state: HandlerState,
    ) -> Subscription {
        let key = self.keys.fetch_add(1, Ordering::Relaxed);
        let list = self
            .lists
            .lock()
            .unwrap()
            .entry(target.to_owned())
            .or_default()
            .clone();
        list.push(HandlerEntry {
            key,
            parameter_types: parameter_types.to_vec(),
            callback,
            state,
        });
        Subscription {
            list: Arc::downgrade(&list),
            key,
        }
    }

    /// Copies the list so dispatch runs outside the list lock.
    pub fn snapshot(&self, target: &str) -> Vec<HandlerEntry> {
        self.lists
            .lock()
            .unwrap()
            .get(target)
            .map(|list| list.snapshot())
            .unwrap_or_default()
    }

    /// Parameter types declared by the first registered handler for `target`.
    ///
    /// Later handlers' declarations are ignored for binding; this is a known
    /// limitation, not merged.
    pub fn parameter_types(&self, target: &str) -> Vec<ParameterType> {
        self.lists
            .lock()
            .unwrap()
            .get(target)
            .map(|list| list.first_parameter_types())
            .unwrap_or_default()
    }
}
