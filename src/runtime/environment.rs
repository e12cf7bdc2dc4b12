//! Per-executor shared key/value store.
//!
//! One [`Environment`] lives inside each executor's job loop and is handed
//! to every task that executor runs, so tasks on the same worker can share
//! state across submissions. It is never visible to the parent except
//! through tasks that read or write it. Entries may carry a TTL; expiry is
//! lazy, on access.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Keyed store shared by all tasks of one executor.
///
/// # Examples
///
/// ```
/// use offload::runtime::Environment;
/// use serde_json::json;
///
/// let env = Environment::new();
/// env.set("counter", json!(1));
/// assert_eq!(env.get("counter"), Some(json!(1)));
/// assert!(env.delete("counter"));
/// assert_eq!(env.get("counter"), None);
/// ```
#[derive(Debug, Default)]
pub struct Environment {
    entries: DashMap<String, Entry>,
}

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the value under `key`, or `None` when absent or expired.
    /// An expired entry is removed on the way out.
    pub fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => {
                if entry.is_expired() {
                    true
                } else {
                    return Some(entry.value.clone());
                }
            },
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Stores `value` under `key` with no expiry.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    /// Stores `value` under `key`, expiring after `ttl`.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    /// Removes `key`. Returns true when a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => !entry.is_expired(),
            None => false,
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of live entries. Expired entries are swept before counting.
    pub fn len(&self) -> usize {
        self.entries.retain(|_, entry| !entry.is_expired());
        self.entries.len()
    }

    /// True when the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
