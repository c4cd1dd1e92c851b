use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use time::OffsetDateTime;
use ulid::Generator;

use crate::error::LedgerError;
use crate::ids::VersionId;

/// Source of "now" in integer milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn at(now_ms: i64) -> Self {
        Self { now: AtomicI64::new(now_ms) }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub trait VersionIdGenerator: Send + Sync {
    /// Next id, ordered after every id previously returned by this generator.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the id space for `now_ms` is exhausted.
    fn next_version(&self, now_ms: i64) -> Result<VersionId, LedgerError>;
}

/// Monotonic ULID generator.
///
/// Ids minted within the same millisecond increment the random part, so
/// `version` order always matches issue order inside one process.
pub struct UlidGenerator {
    inner: Mutex<Generator>,
}

impl UlidGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(Generator::new()) }
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UlidGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UlidGenerator").finish_non_exhaustive()
    }
}

impl VersionIdGenerator for UlidGenerator {
    fn next_version(&self, now_ms: i64) -> Result<VersionId, LedgerError> {
        let millis = u64::try_from(now_ms.max(0)).unwrap_or(0);
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(millis);
        let mut generator = self.inner.lock();
        generator
            .generate_from_datetime(at)
            .map(VersionId)
            .map_err(|err| LedgerError::Storage(format!("version id generation failed: {err}")))
    }
}
