//! Tracks subscriptions to server-pushed keys and fans out notifications to
//! their handlers. Bindings persist across reconnects; the supervisor
//! re-subscribes them all before re-entering `Ready`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rmpv::Value;

pub type WatcherHandler = Box<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherToken(u64);

struct Binding {
    token: WatcherToken,
    handler: WatcherHandler,
}

pub struct WatcherRegistry {
    next_token: AtomicU64,
    bindings: Mutex<HashMap<String, Vec<Binding>>>,
}

impl WatcherRegistry {
    pub fn new() -> WatcherRegistry {
        WatcherRegistry {
            next_token: AtomicU64::new(1),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Record a binding. Returns the new token and whether this is the
    /// first handler registered for `key` (meaning the caller still owes
    /// the server an `IPROTO_WATCH`).
    pub fn register(&self, key: String, handler: WatcherHandler) -> (WatcherToken, bool) {
        let token = WatcherToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut bindings = self.bindings.lock().unwrap();
        let entry = bindings.entry(key).or_default();
        let first = entry.is_empty();
        entry.push(Binding { token, handler });
        (token, first)
    }

    /// Remove a binding. Returns the key it was registered under and
    /// whether it was the last binding for that key (meaning the caller now
    /// owes the server an `IPROTO_UNWATCH`).
    pub fn unregister(&self, token: WatcherToken) -> Option<(String, bool)> {
        let mut bindings = self.bindings.lock().unwrap();
        let mut found_key = None;
        for (key, list) in bindings.iter_mut() {
            if let Some(pos) = list.iter().position(|b| b.token == token) {
                list.remove(pos);
                found_key = Some((key.clone(), list.is_empty()));
                break;
            }
        }
        if let Some((ref key, true)) = found_key {
            bindings.remove(key);
        }
        found_key
    }

    /// Deliver an event to every handler registered for `key`, in
    /// registration order. Across different keys no ordering is implied.
    pub fn dispatch(&self, key: &str, value: &Value) {
        let bindings = self.bindings.lock().unwrap();
        if let Some(list) = bindings.get(key) {
            for binding in list {
                (binding.handler)(key, value);
            }
        }
    }

    /// Every key with at least one live binding — what the supervisor must
    /// re-`WATCH` after a reconnect.
    pub fn subscribed_keys(&self) -> Vec<String> {
        self.bindings.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
