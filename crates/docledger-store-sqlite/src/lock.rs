//! Advisory locks keyed by a 64-bit hash of a derived identity.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use docledger_core::LedgerError;
use parking_lot::{Condvar, Mutex};

/// Exclusive advisory lock over 64-bit keys.
///
/// Implementations MUST block until the key is free or `deadline` passes.
pub trait KeyedLock: Send + Sync {
    /// # Errors
    /// Returns [`LedgerError::Timeout`] once `deadline` passes without the key being released.
    fn acquire(&self, key: i64, deadline: Option<Instant>) -> Result<LockGuard, LedgerError>;
}

/// Releases its key on drop.
pub struct LockGuard {
    key: i64,
    release: Option<Box<dyn FnOnce(i64) + Send>>,
}

impl LockGuard {
    pub fn new(key: i64, release: impl FnOnce(i64) + Send + 'static) -> Self {
        Self { key, release: Some(Box::new(release)) }
    }

    #[must_use]
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.key);
        }
    }
}

#[derive(Default)]
struct Held {
    keys: Mutex<HashSet<i64>>,
    released: Condvar,
}

/// Lock table shared by every connection in this process.
///
/// Cross-process writers still serialize on SQLite's own write lock.
#[derive(Clone, Default)]
pub struct InProcessKeyedLock {
    held: Arc<Held>,
}

impl InProcessKeyedLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance used by [`crate::UnitOfWork::begin`].
    #[must_use]
    pub fn global() -> Arc<dyn KeyedLock> {
        static GLOBAL: OnceLock<Arc<InProcessKeyedLock>> = OnceLock::new();
        let lock: Arc<InProcessKeyedLock> = Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())));
        lock
    }

    #[must_use]
    pub fn is_held(&self, key: i64) -> bool {
        self.held.keys.lock().contains(&key)
    }
}

impl fmt::Debug for InProcessKeyedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessKeyedLock").field("held", &self.held.keys.lock().len()).finish()
    }
}

impl KeyedLock for InProcessKeyedLock {
    fn acquire(&self, key: i64, deadline: Option<Instant>) -> Result<LockGuard, LedgerError> {
        let mut keys = self.held.keys.lock();
        while keys.contains(&key) {
            match deadline {
                Some(deadline) => {
                    if self.held.released.wait_until(&mut keys, deadline).timed_out() && keys.contains(&key) {
                        tracing::warn!(key, "keyed lock wait timed out");
                        return Err(LedgerError::Timeout(format!("lock {key} still held at deadline")));
                    }
                }
                None => self.held.released.wait(&mut keys),
            }
        }
        keys.insert(key);
        drop(keys);

        let held = Arc::clone(&self.held);
        Ok(LockGuard::new(key, move |key| {
            held.keys.lock().remove(&key);
            held.released.notify_all();
        }))
    }
}
