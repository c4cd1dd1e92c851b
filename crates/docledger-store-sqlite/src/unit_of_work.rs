use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docledger_core::LedgerError;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::SqlContext;
use crate::lock::{InProcessKeyedLock, KeyedLock, LockGuard};

/// Busy timeout restored on the connection when a unit has no deadline.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// One atomic write scope: an `IMMEDIATE` SQLite transaction plus the keyed
/// locks taken inside it.
///
/// Locks are released only after the transaction commits or rolls back.
/// Dropping an uncommitted unit rolls it back.
pub struct UnitOfWork<'conn> {
    // Field order matters: the transaction must end before guards drop.
    tx: Transaction<'conn>,
    guards: Vec<LockGuard>,
    held: HashSet<i64>,
    locks: Arc<dyn KeyedLock>,
    deadline: Option<Instant>,
}

impl<'conn> UnitOfWork<'conn> {
    /// Begin a unit using the process-wide lock table and no deadline.
    ///
    /// # Errors
    /// Returns [`LedgerError::Busy`] when the write lock cannot be taken within the busy timeout.
    pub fn begin(conn: &'conn mut Connection) -> Result<Self, LedgerError> {
        Self::begin_with(conn, InProcessKeyedLock::global(), None)
    }

    /// Begin a unit whose engine and keyed-lock waits are bounded by `timeout`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Busy`] when the write lock cannot be taken before the deadline.
    pub fn begin_with_deadline(conn: &'conn mut Connection, timeout: Duration) -> Result<Self, LedgerError> {
        Self::begin_with(conn, InProcessKeyedLock::global(), Some(timeout))
    }

    /// # Errors
    /// Returns [`LedgerError::Busy`] when the write lock cannot be taken, or
    /// [`LedgerError::Storage`] when the timeout cannot be applied.
    pub fn begin_with(
        conn: &'conn mut Connection,
        locks: Arc<dyn KeyedLock>,
        timeout: Option<Duration>,
    ) -> Result<Self, LedgerError> {
        conn.busy_timeout(timeout.unwrap_or(DEFAULT_BUSY_TIMEOUT))
            .db("failed to set busy timeout")?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .db("failed to begin immediate transaction")?;
        Ok(Self {
            tx,
            guards: Vec::new(),
            held: HashSet::new(),
            locks,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        })
    }

    /// Take the advisory lock for `key` until this unit ends. Re-entrant.
    ///
    /// # Errors
    /// Returns [`LedgerError::Timeout`] when the deadline passes first.
    pub fn lock(&mut self, key: i64) -> Result<(), LedgerError> {
        if self.held.contains(&key) {
            return Ok(());
        }
        let guard = self.locks.acquire(key, self.deadline)?;
        self.held.insert(key);
        self.guards.push(guard);
        Ok(())
    }

    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    #[must_use]
    pub fn holds(&self, key: i64) -> bool {
        self.held.contains(&key)
    }

    /// # Errors
    /// Returns [`LedgerError::Busy`] or [`LedgerError::Storage`] when the commit fails;
    /// the transaction is rolled back in that case.
    pub fn commit(self) -> Result<(), LedgerError> {
        let Self { tx, guards, .. } = self;
        let committed = tx.commit().db("failed to commit unit of work");
        drop(guards);
        committed
    }

    /// # Errors
    /// Returns [`LedgerError::Storage`] when the rollback itself fails.
    pub fn rollback(self) -> Result<(), LedgerError> {
        let Self { tx, guards, .. } = self;
        let rolled_back = tx.rollback().db("failed to roll back unit of work");
        drop(guards);
        rolled_back
    }
}

impl Deref for UnitOfWork<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}
