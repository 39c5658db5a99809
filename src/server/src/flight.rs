//! Per-reference build coalescing.
//!
//! At most one build runs per target reference. The first caller to
//! observe no entry for its key installs one, takes the write side, and
//! builds; every later caller takes the read side, which unblocks when
//! the builder releases, and returns without doing any work. The entry is
//! removed before the write lock is released, so the next request after a
//! failure starts a fresh build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use stratum_core::{Error, Result};

/// Single-flight gate keyed by target reference.
#[derive(Default)]
pub struct BuildGate {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

enum Role {
    Leader(OwnedRwLockWriteGuard<()>),
    Waiter(Arc<RwLock<()>>),
}

impl BuildGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `build` at most once concurrently for `key`.
    ///
    /// Returns `Ok(true)` for the caller that built, `Ok(false)` for
    /// callers that waited on it. A build failure is returned only to the
    /// caller that built.
    pub async fn run<F, Fut>(&self, key: &str, build: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let role = {
            let mut locks = self.locks.lock().unwrap();
            match locks.get(key) {
                Some(lock) => Role::Waiter(Arc::clone(lock)),
                None => {
                    let lock = Arc::new(RwLock::new(()));
                    // A freshly created lock has no holders.
                    let guard = Arc::clone(&lock)
                        .try_write_owned()
                        .map_err(|_| Error::Internal("fresh build lock held".to_string()))?;
                    locks.insert(key.to_string(), lock);
                    Role::Leader(guard)
                }
            }
        };

        match role {
            Role::Leader(guard) => {
                // Dropped in reverse order: the map entry goes away before
                // the write lock releases, including on cancellation.
                let _cleanup = EntryCleanup { gate: self, key };
                let result = build().await;
                drop(_cleanup);
                drop(guard);
                result.map(|()| true)
            }
            Role::Waiter(lock) => {
                let _unblocked = lock.read().await;
                Ok(false)
            }
        }
    }
}

struct EntryCleanup<'a> {
    gate: &'a BuildGate,
    key: &'a str,
}

impl Drop for EntryCleanup<'_> {
    fn drop(&mut self) {
        self.gate.locks.lock().unwrap().remove(self.key);
    }
}
