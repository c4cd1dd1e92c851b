//! The transformer capability the ingest pipeline drives.

use serde_json::Value;
use uuid::Uuid;

use crate::error::{LedgerError, TransformError};
use crate::identity;
use crate::provenance::TransformInfo;

/// One internal document a transformer wants written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Candidate {
    pub doc: Value,
    pub meta: Option<Value>,
    pub uuid: Option<Uuid>,
    pub kind: Option<String>,
    pub key: Option<String>,
    pub sat: Option<String>,
    pub stream: Option<String>,
}

impl Candidate {
    #[must_use]
    pub fn new(doc: Value) -> Self {
        Self { doc, ..Self::default() }
    }

    #[must_use]
    pub fn keyed(doc: Value, kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self { doc, kind: Some(kind.into()), key: Some(key.into()), ..Self::default() }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn with_sat(mut self, sat: impl Into<String>) -> Self {
        self.sat = Some(sat.into());
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Internal identity of this candidate.
    ///
    /// Precedence: the explicit `uuid` field, then `(kind, key)` derived under
    /// the `if_uuid` namespace. A `uuid` member inside `doc` is upstream data
    /// and never decides identity; the pipeline overwrites it.
    ///
    /// # Errors
    /// Returns [`LedgerError::ContractViolation`] when neither is present.
    pub fn resolve_uuid(&self, if_uuid: &str) -> Result<Uuid, LedgerError> {
        if let Some(uuid) = self.uuid {
            return Ok(uuid);
        }
        match (self.kind.as_deref(), self.key.as_deref()) {
            (Some(kind), Some(key)) if !kind.is_empty() => {
                Ok(identity::stable_id_sourced(if_uuid, kind, key))
            }
            _ => Err(LedgerError::contract(
                "transform candidate MUST carry a uuid or a non-empty (kind, key) pair",
            )),
        }
    }
}

/// Lazily produced candidates; an `Err` item aborts the whole ingest.
pub type Candidates<'a> = Box<dyn Iterator<Item = Result<Candidate, TransformError>> + 'a>;

pub trait Transformer {
    /// Name, version, and config hash recorded in each output's provenance.
    fn info(&self) -> TransformInfo;

    fn transform<'a>(&'a self, raw: &'a Value, meta: &'a Value, ext_id: Option<&'a str>) -> Candidates<'a>;
}

/// Adapter that lets a plain function act as a [`Transformer`].
pub struct FnTransformer<F> {
    info: TransformInfo,
    func: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(&Value, &Value, Option<&str>) -> Result<Vec<Candidate>, TransformError>,
{
    pub fn new(name: impl Into<String>, version: impl Into<String>, func: F) -> Self {
        Self {
            info: TransformInfo { name: name.into(), version: version.into(), config_hash: None },
            func,
        }
    }

    #[must_use]
    pub fn with_config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.info.config_hash = Some(config_hash.into());
        self
    }
}

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(&Value, &Value, Option<&str>) -> Result<Vec<Candidate>, TransformError>,
{
    fn info(&self) -> TransformInfo {
        self.info.clone()
    }

    fn transform<'a>(&'a self, raw: &'a Value, meta: &'a Value, ext_id: Option<&'a str>) -> Candidates<'a> {
        match (self.func)(raw, meta, ext_id) {
            Ok(candidates) => Box::new(candidates.into_iter().map(Ok)),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }
}
