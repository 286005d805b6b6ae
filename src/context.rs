//! Ambient caller context, optionally captured at submission time.
//!
//! Producers may install a [`CallerContext`] on their thread (e.g., a
//! correlation id or locale tag). When a pool is configured with
//! `capture_caller_context`, each submission snapshots the producer's
//! context and the executing worker restores it around the work item.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<CallerContext>> = const { RefCell::new(None) };
}

/// An immutable bag of string-keyed values describing the submitting
/// thread's ambient state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    values: Arc<HashMap<String, String>>,
}

impl CallerContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a context extended with one key-value pair.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values: HashMap<String, String> = (*self.values).clone();
        values.insert(key.into(), value.into());
        CallerContext {
            values: Arc::new(values),
        }
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Installs a context on the current thread, replacing any previous one.
pub fn set_current(context: Option<CallerContext>) {
    CURRENT.with(|cell| *cell.borrow_mut() = context);
}

/// Snapshots the current thread's context, if any.
pub fn current() -> Option<CallerContext> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Restores the previous context when dropped. Used by workers to scope a
/// captured context to a single work item.
pub(crate) struct ContextGuard {
    previous: Option<CallerContext>,
}

impl ContextGuard {
    pub(crate) fn install(context: Option<CallerContext>) -> Self {
        let previous = current();
        set_current(context);
        ContextGuard { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        set_current(self.previous.take());
    }
}
