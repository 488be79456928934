//! Correlation registry.
//!
//! Maps correlation keys to feedback callbacks. Request paths register
//! under the key of the attribute they address; the receive path looks the
//! key up when a reply or publish line arrives and hands the callback the
//! parsed record.
//!
//! One callback per key: registering again replaces the earlier callback.
//! Every request for an attribute of a node installs an equivalent
//! callback, so the latest one is always the one that should run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use avlib_core::error::{Error, Result};

use crate::value::Value;

/// Callback invoked with the record carried by a reply or publish line.
pub type FeedbackCallback = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Outcome of [`Registry::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// A callback ran and accepted the record.
    Delivered,
    /// No callback is registered for the key.
    Unclaimed,
    /// The callback rejected the record.
    Failed(Error),
}

/// Key-to-callback map shared by request paths and the receive path.
#[derive(Default)]
pub struct Registry {
    callbacks: Mutex<HashMap<String, FeedbackCallback>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `key`.
    ///
    /// Returns `true` if an earlier callback was replaced.
    pub fn register(&self, key: impl Into<String>, callback: FeedbackCallback) -> bool {
        let key = key.into();
        let replaced = locked(&self.callbacks).insert(key.clone(), callback).is_some();
        if replaced {
            tracing::debug!(key = %key, "replaced feedback callback");
        }
        replaced
    }

    /// Remove the callback for `key`. Returns whether one was registered.
    pub fn unregister(&self, key: &str) -> bool {
        locked(&self.callbacks).remove(key).is_some()
    }

    /// Remove the callback for `key` only if it is `callback`.
    ///
    /// Returns whether it was removed. A key re-registered by someone else
    /// is left alone.
    pub fn unregister_if(&self, key: &str, callback: &FeedbackCallback) -> bool {
        let mut callbacks = locked(&self.callbacks);
        match callbacks.get(key) {
            Some(current) if Arc::ptr_eq(current, callback) => {
                callbacks.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        locked(&self.callbacks).contains_key(key)
    }

    pub fn len(&self) -> usize {
        locked(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `record` to the callback registered for `key`.
    ///
    /// The lock is released before the callback runs, so callbacks may
    /// register or unregister keys themselves.
    pub fn dispatch(&self, key: &str, record: &Value) -> Dispatch {
        let callback = locked(&self.callbacks).get(key).cloned();
        match callback {
            Some(callback) => match callback(record) {
                Ok(()) => Dispatch::Delivered,
                Err(e) => Dispatch::Failed(e),
            },
            None => {
                tracing::trace!(key = %key, "no callback registered, discarding");
                Dispatch::Unclaimed
            }
        }
    }
}
