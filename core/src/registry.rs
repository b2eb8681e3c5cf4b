//! Process-wide list of live top-level contexts, for diagnostics only.
//!
//! Registration is tied to the lifetime of a [`Registration`] value owned
//! by the context. Nothing mutates another thread's context through here.

use crate::debug::LockCounters;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct ContextInfo {
    thread: String,
    volume: String,
    started: DateTime<Utc>,
    lock_counters: Arc<LockCounters>,
}

static ACTIVE_CONTEXTS: Lazy<Mutex<BTreeMap<u64, ContextInfo>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Registration {
    id: u64,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        ACTIVE_CONTEXTS.lock().remove(&self.id);
    }
}

pub fn register(volume: &str, lock_counters: Arc<LockCounters>) -> Registration {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let current = std::thread::current();
    let thread = match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    };
    ACTIVE_CONTEXTS.lock().insert(
        id,
        ContextInfo {
            thread,
            volume: volume.to_string(),
            started: Utc::now(),
            lock_counters,
        },
    );
    Registration { id }
}

pub fn is_registered(id: u64) -> bool {
    ACTIVE_CONTEXTS.lock().contains_key(&id)
}

/// One line per live context.
pub fn dump_contexts() -> Vec<String> {
    // try_lock: a panic raised while the registry is locked must not deadlock.
    let Some(contexts) = ACTIVE_CONTEXTS.try_lock() else {
        return vec!["<context registry busy>".to_string()];
    };
    contexts
        .iter()
        .map(|(id, info)| {
            format!(
                "#{} thread={} volume={} since={} locks=[{}]",
                id,
                info.thread,
                info.volume,
                info.started.to_rfc3339(),
                info.lock_counters.snapshot()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::LockClass;

    #[test]
    fn test_registration_is_scoped() {
        let registration = register("vol0", Arc::new(LockCounters::new()));
        let id = registration.id();
        assert!(is_registered(id));
        drop(registration);
        assert!(!is_registered(id));
    }

    #[test]
    fn test_dump_shows_lock_counters() {
        let counters = Arc::new(LockCounters::new());
        counters.acquire(LockClass::TreeSpin);
        let registration = register("dumpvol", Arc::clone(&counters));

        let line = dump_contexts()
            .into_iter()
            .find(|line| line.starts_with(&format!("#{} ", registration.id())))
            .unwrap();
        assert!(line.contains("volume=dumpvol"));
        assert!(line.contains("spin_locked_tree: 1"));

        counters.release(LockClass::TreeSpin);
    }
}
