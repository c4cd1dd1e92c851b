//! Engine-independent core of the document ledger: identities, content
//! hashing, merge patch, envelopes, provenance, and the collaborator traits a
//! storage backend plugs into.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod identity;
pub mod ids;
pub mod patch;
pub mod period;
pub mod provenance;
pub mod transform;

pub use clock::{Clock, ManualClock, SystemClock, UlidGenerator, VersionIdGenerator};
pub use envelope::{
    doc_uuid, require_object, with_uuid, Envelope, EnvelopeShape, VersionRow, WriteStatus,
    NESTED_META_KEY,
};
pub use error::{LedgerError, LedgerResult, TransformError};
pub use hash::{canonical_json, ContentHasher, Nonce, NoncePolicy, Sha256Hasher};
pub use ids::{TableName, VersionId};
pub use patch::{is_empty_patch, merge_absent, merge_patch, merged};
pub use period::{HalfOpenIntervals, IntervalComputer, Period, ValidityBounds};
pub use provenance::{
    InterfaceInfo, ProvenanceStamp, SourceRef, TransformInfo, DEFAULT_SCHEMA_VERSION,
};
pub use transform::{Candidate, Candidates, FnTransformer, Transformer};

/// Member every stored document carries with its own identity.
pub const UUID_KEY: &str = "uuid";

/// Doc member set by tombstoning soft deletes.
pub const DELETED_MARKER_KEY: &str = "_deleted";
