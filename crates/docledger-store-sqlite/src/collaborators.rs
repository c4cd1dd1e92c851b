use std::fmt;
use std::sync::{Arc, OnceLock};

use docledger_core::{
    Clock, ContentHasher, HalfOpenIntervals, IntervalComputer, LedgerError, NoncePolicy, Sha256Hasher,
    SystemClock, UlidGenerator, VersionId, VersionIdGenerator, DELETED_MARKER_KEY,
};

/// Pluggable services every store draws on.
#[derive(Clone)]
pub struct Collaborators {
    pub hasher: Arc<dyn ContentHasher>,
    pub ids: Arc<dyn VersionIdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub intervals: Arc<dyn IntervalComputer>,
}

impl Collaborators {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn VersionIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn with_intervals(mut self, intervals: Arc<dyn IntervalComputer>) -> Self {
        self.intervals = intervals;
        self
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn next_version(&self, now_ms: i64) -> Result<VersionId, LedgerError> {
        self.ids.next_version(now_ms)
    }
}

impl Default for Collaborators {
    /// SHA-256, the system clock, half-open periods, and one ULID generator
    /// shared across the process so versions stay monotonic between stores.
    fn default() -> Self {
        static IDS: OnceLock<Arc<UlidGenerator>> = OnceLock::new();
        let ids: Arc<UlidGenerator> = Arc::clone(IDS.get_or_init(|| Arc::new(UlidGenerator::new())));
        Self {
            hasher: Arc::new(Sha256Hasher),
            ids,
            clock: Arc::new(SystemClock),
            intervals: Arc::new(HalfOpenIntervals),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Per-store content settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoreConfig {
    pub nonce_policy: NoncePolicy,
    /// Doc member a tombstoning soft delete sets to `true`.
    pub tombstone_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { nonce_policy: NoncePolicy::ExcludeUuid, tombstone_key: DELETED_MARKER_KEY.to_string() }
    }
}
