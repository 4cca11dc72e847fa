use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Keyed store that outlives rebuilds of the component that uses it.
///
/// One registry exists per session. It is owned by the session and lent to each
/// short-lived UI component, so values put here survive every rebuild and are
/// dropped only when the session itself ends.
pub struct RetainedStateRegistry {
    session_id: u64,
    initialized: bool,
    entries: HashMap<String, Box<dyn Any + Send>>,
}

impl RetainedStateRegistry {
    #[must_use]
    pub fn new() -> Self {
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session_id, "retained state registry created");
        Self {
            session_id,
            initialized: false,
            entries: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns true on the first call for this session and false afterwards.
    pub fn first_time_in(&mut self) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        true
    }

    /// Stores `value` under `key`, replacing whatever was there.
    pub fn put<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Looks up `key`. A missing entry and an entry of another type both read as
    /// `None`; callers rebuild their state in that case.
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)?.downcast_mut::<T>()
    }

    /// Takes the value out of the registry. Entries of another type are left in place.
    pub fn remove<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        if !self.entries.get(key)?.is::<T>() {
            return None;
        }
        let boxed = self.entries.remove(key)?;
        boxed.downcast::<T>().ok().map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RetainedStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetainedStateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainedStateRegistry")
            .field("session_id", &self.session_id)
            .field("initialized", &self.initialized)
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for RetainedStateRegistry {
    fn drop(&mut self) {
        debug!(
            session_id = self.session_id,
            entries = self.entries.len(),
            "session ended; dropping retained state"
        );
    }
}
