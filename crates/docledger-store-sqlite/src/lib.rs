//! SQLite backend for the document ledger.
//!
//! Stores never own a connection: reads take a `&Connection` and writes take
//! the caller's [`UnitOfWork`], so several stores can share one transaction.

pub mod changelog;
mod codec;
pub mod collaborators;
mod error;
pub mod ledger;
pub mod linkage;
pub mod lock;
pub mod pipeline;
pub mod query;
pub mod raw_journal;
pub mod schema;
pub mod snapshot;
pub mod unit_of_work;
pub mod versioned_raw;

pub use changelog::ChangeLog;
pub use collaborators::{Collaborators, StoreConfig};
pub use ledger::{ForeignKeyViolation, IntegrityReport, SqliteLedger};
pub use linkage::{Link, LinkageStore};
pub use lock::{InProcessKeyedLock, KeyedLock, LockGuard};
pub use pipeline::{
    DuplicatePolicy, InternalWrite, PipelineOptions, PipelineOptionsBuilder, RawIngest, Routing,
    TransformOutcome, TransformPipeline,
};
pub use query::{Column, CompiledQuery, Direction, Field, Logical, Op, Operand, Query};
pub use raw_journal::RawJournal;
pub use schema::{CatalogEntry, SchemaStatus, TableKind, LATEST_SCHEMA_VERSION};
pub use snapshot::{SnapshotStore, SoftDelete};
pub use unit_of_work::{UnitOfWork, DEFAULT_BUSY_TIMEOUT};
pub use versioned_raw::{RawAppend, VersionedRawChangeLog};
