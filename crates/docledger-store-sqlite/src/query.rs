//! Immutable, chainable query values compiled to parameterized SQL.
//!
//! Table names come from a validated [`TableName`] and columns from the closed
//! [`Column`] enum; every caller-supplied value and JSON path is bound as a
//! parameter.

use std::fmt;

use docledger_core::{Envelope, LedgerError, Nonce, Period, TableName, VersionId};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SqlContext;
use crate::schema::TableKind;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Column {
    Uuid,
    Version,
    Doc,
    Meta,
    Iat,
    Uat,
    Dat,
    Sat,
    Nonce,
    ExtId,
    Source,
    Stream,
    PeriodStart,
    PeriodEnd,
}

impl Column {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Version => "version",
            Self::Doc => "doc",
            Self::Meta => "meta",
            Self::Iat => "iat",
            Self::Uat => "uat",
            Self::Dat => "dat",
            Self::Sat => "sat",
            Self::Nonce => "nonce",
            Self::ExtId => "ext_id",
            Self::Source => "source",
            Self::Stream => "stream",
            Self::PeriodStart => "period_start",
            Self::PeriodEnd => "period_end",
        }
    }

    #[must_use]
    pub fn exists_in(self, kind: TableKind) -> bool {
        use TableKind::{ChangeLog, Linkage, RawJournal, Snapshot, VersionedRaw};
        match self {
            Self::Uuid | Self::Version | Self::Doc | Self::Meta | Self::Iat | Self::Sat | Self::Nonce => {
                kind != Linkage
            }
            Self::Uat => kind == Snapshot,
            Self::Dat => matches!(kind, Snapshot | ChangeLog),
            Self::ExtId => matches!(kind, RawJournal | VersionedRaw),
            Self::Source | Self::Stream => kind == VersionedRaw,
            Self::PeriodStart | Self::PeriodEnd => matches!(kind, ChangeLog | VersionedRaw),
        }
    }
}

/// Something a predicate or ordering can reference.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Field {
    Column(Column),
    /// JSON path into `doc`, read with `json_extract`.
    DocPath(String),
    /// JSON path into `meta`.
    MetaPath(String),
}

impl Field {
    /// `"a.b"` and `"$.a.b"` address the same member.
    #[must_use]
    pub fn doc(path: &str) -> Self {
        Self::DocPath(json_path(path))
    }

    #[must_use]
    pub fn meta(path: &str) -> Self {
        Self::MetaPath(json_path(path))
    }

    fn render(&self, kind: TableKind, params: &mut Vec<SqlValue>) -> Result<String, LedgerError> {
        match self {
            Self::Column(column) => {
                if !column.exists_in(kind) {
                    return Err(LedgerError::configuration(format!(
                        "column {} does not exist in {kind} tables",
                        column.as_sql()
                    )));
                }
                Ok(column.as_sql().to_string())
            }
            Self::DocPath(path) => {
                params.push(SqlValue::Text(path.clone()));
                Ok("json_extract(doc, ?)".to_string())
            }
            Self::MetaPath(path) => {
                params.push(SqlValue::Text(path.clone()));
                Ok("json_extract(meta, ?)".to_string())
            }
        }
    }
}

impl From<Column> for Field {
    fn from(column: Column) -> Self {
        Self::Column(column)
    }
}

fn json_path(path: &str) -> String {
    if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
    In,
    NotIn,
}

impl Op {
    fn binary_sql(self) -> Option<&'static str> {
        match self {
            Self::Eq => Some("="),
            Self::Ne => Some("<>"),
            Self::Lt => Some("<"),
            Self::Le => Some("<="),
            Self::Gt => Some(">"),
            Self::Ge => Some(">="),
            Self::Like => Some("LIKE"),
            Self::NotLike => Some("NOT LIKE"),
            Self::IsNull | Self::IsNotNull | Self::In | Self::NotIn => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Logical {
    #[default]
    And,
    Or,
}

impl Logical {
    fn as_sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    One(SqlValue),
    Many(Vec<SqlValue>),
}

impl From<SqlValue> for Operand {
    fn from(value: SqlValue) -> Self {
        Self::One(value)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Self::One(SqlValue::Text(value.to_string()))
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Self::One(SqlValue::Text(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::One(SqlValue::Integer(value))
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self::One(SqlValue::Integer(i64::from(value)))
    }
}

impl From<Uuid> for Operand {
    fn from(value: Uuid) -> Self {
        Self::One(SqlValue::Text(value.to_string()))
    }
}

impl From<VersionId> for Operand {
    fn from(value: VersionId) -> Self {
        Self::One(SqlValue::Text(value.to_string()))
    }
}

impl From<Nonce> for Operand {
    fn from(value: Nonce) -> Self {
        Self::One(SqlValue::Blob(value.as_bytes().to_vec()))
    }
}

impl From<&Value> for Operand {
    fn from(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::Many(items.iter().map(json_to_sql).collect()),
            other => Self::One(json_to_sql(other)),
        }
    }
}

impl<T: Into<Operand>> From<Vec<T>> for Operand {
    fn from(values: Vec<T>) -> Self {
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match value.into() {
                Self::None => {}
                Self::One(value) => out.push(value),
                Self::Many(values) => out.extend(values),
            }
        }
        Self::Many(out)
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        composite @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(composite.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    logical: Logical,
    field: Field,
    op: Op,
    operand: Operand,
}

impl Predicate {
    fn render(&self, kind: TableKind, params: &mut Vec<SqlValue>) -> Result<String, LedgerError> {
        let mut field_params = Vec::new();
        let field = self.field.render(kind, &mut field_params)?;
        let rendered = match (self.op, &self.operand) {
            (Op::IsNull, _) | (Op::Eq, Operand::One(SqlValue::Null)) => format!("{field} IS NULL"),
            (Op::IsNotNull, _) | (Op::Ne, Operand::One(SqlValue::Null)) => format!("{field} IS NOT NULL"),
            (Op::In | Op::NotIn, operand) => {
                let values = match operand {
                    Operand::None => Vec::new(),
                    Operand::One(value) => vec![value.clone()],
                    Operand::Many(values) => values.clone(),
                };
                if values.is_empty() {
                    // IN () matches nothing, NOT IN () matches everything.
                    return Ok(if self.op == Op::In { "1=0" } else { "1=1" }.to_string());
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                params.append(&mut field_params);
                params.extend(values);
                let keyword = if self.op == Op::In { "IN" } else { "NOT IN" };
                return Ok(format!("{field} {keyword} ({placeholders})"));
            }
            (op, Operand::One(value)) => {
                let Some(sql_op) = op.binary_sql() else {
                    return Err(LedgerError::validation(format!("operator {op:?} takes no value")));
                };
                params.append(&mut field_params);
                params.push(value.clone());
                return Ok(format!("{field} {sql_op} ?"));
            }
            (op, _) => {
                return Err(LedgerError::validation(format!("operator {op:?} needs exactly one value")));
            }
        };
        params.append(&mut field_params);
        Ok(rendered)
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl fmt::Display for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -- {:?}", self.sql, self.params)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: TableName,
    kind: TableKind,
    predicates: Vec<Predicate>,
    order: Vec<(Field, Direction)>,
    limit: Option<u64>,
}

impl Query {
    #[must_use]
    pub fn new(table: TableName, kind: TableKind) -> Self {
        Self { table, kind, predicates: Vec::new(), order: Vec::new(), limit: None }
    }

    /// Latest row for `uuid`, ordered by `iat DESC, version DESC`.
    #[must_use]
    pub fn latest(table: TableName, kind: TableKind, uuid: Uuid) -> Self {
        Self::new(table, kind).by_uuid(uuid).newest_first().first()
    }

    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    #[must_use]
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    #[must_use]
    pub fn filter(self, field: impl Into<Field>, op: Op, operand: impl Into<Operand>) -> Self {
        self.push(Logical::And, field.into(), op, operand.into())
    }

    #[must_use]
    pub fn or_filter(self, field: impl Into<Field>, op: Op, operand: impl Into<Operand>) -> Self {
        self.push(Logical::Or, field.into(), op, operand.into())
    }

    #[must_use]
    pub fn is_null(self, field: impl Into<Field>) -> Self {
        self.push(Logical::And, field.into(), Op::IsNull, Operand::None)
    }

    #[must_use]
    pub fn is_not_null(self, field: impl Into<Field>) -> Self {
        self.push(Logical::And, field.into(), Op::IsNotNull, Operand::None)
    }

    #[must_use]
    pub fn by_uuid(self, uuid: Uuid) -> Self {
        self.filter(Column::Uuid, Op::Eq, uuid)
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<Field>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    #[must_use]
    pub fn newest_first(self) -> Self {
        self.order_by(Column::Iat, Direction::Desc).order_by(Column::Version, Direction::Desc)
    }

    #[must_use]
    pub fn oldest_first(self) -> Self {
        self.order_by(Column::Iat, Direction::Asc).order_by(Column::Version, Direction::Asc)
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn first(self) -> Self {
        self.limit(1)
    }

    fn push(mut self, logical: Logical, field: Field, op: Op, operand: Operand) -> Self {
        self.predicates.push(Predicate { logical, field, op, operand });
        self
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] for columns absent from this table
    /// kind and [`LedgerError::Validation`] for operator/operand mismatches.
    pub fn compile(&self) -> Result<CompiledQuery, LedgerError> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT {} FROM {} WHERE 1=1", projection(self.kind)?, self.table.quoted());
        for (index, predicate) in self.predicates.iter().enumerate() {
            // The first predicate always narrows the seed clause.
            let logical = if index == 0 { Logical::And } else { predicate.logical };
            let rendered = predicate.render(self.kind, &mut params)?;
            sql.push(' ');
            sql.push_str(logical.as_sql());
            sql.push(' ');
            sql.push_str(&rendered);
        }
        if !self.order.is_empty() {
            let mut terms = Vec::with_capacity(self.order.len());
            for (field, direction) in &self.order {
                let rendered = field.render(self.kind, &mut params)?;
                let direction = match direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                terms.push(format!("{rendered} {direction}"));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let compiled = CompiledQuery { sql, params };
        tracing::trace!(query = %compiled, "compiled ledger query");
        Ok(compiled)
    }

    /// # Errors
    /// Returns compile errors, storage errors, or serialization errors for corrupt rows.
    pub fn fetch_all(&self, conn: &Connection) -> Result<Vec<Envelope>, LedgerError> {
        let compiled = self.compile()?;
        let mut stmt = conn.prepare(&compiled.sql).db(&format!("failed to prepare query on {}", self.table))?;
        let rows = stmt
            .query_map(params_from_iter(compiled.params.iter()), RawRow::read)
            .db(&format!("failed to query {}", self.table))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.db("failed to read row")?.into_envelope()?);
        }
        Ok(out)
    }

    /// # Errors
    /// See [`Query::fetch_all`].
    pub fn fetch_one(&self, conn: &Connection) -> Result<Option<Envelope>, LedgerError> {
        Ok(self.clone().first().fetch_all(conn)?.into_iter().next())
    }

    /// Number of rows matching the predicates; ordering and limit are ignored.
    ///
    /// # Errors
    /// See [`Query::fetch_all`].
    pub fn count(&self, conn: &Connection) -> Result<u64, LedgerError> {
        let unordered = Self { order: Vec::new(), limit: None, ..self.clone() };
        let compiled = unordered.compile()?;
        let sql = format!("SELECT COUNT(*) FROM ({})", compiled.sql);
        let count = conn
            .query_row(&sql, params_from_iter(compiled.params.iter()), |row| row.get::<_, i64>(0))
            .db(&format!("failed to count rows in {}", self.table))?;
        u64::try_from(count).map_err(|err| LedgerError::Storage(format!("negative row count: {err}")))
    }
}

fn projection(kind: TableKind) -> Result<&'static str, LedgerError> {
    match kind {
        TableKind::Snapshot => {
            Ok("uuid, version, doc, meta, iat, uat, dat, sat, nonce, NULL, NULL, NULL")
        }
        TableKind::ChangeLog => {
            Ok("uuid, version, doc, meta, iat, NULL, dat, sat, nonce, NULL, period_start, period_end")
        }
        TableKind::RawJournal => {
            Ok("uuid, version, doc, meta, iat, NULL, NULL, sat, nonce, ext_id, NULL, NULL")
        }
        TableKind::VersionedRaw => {
            Ok("uuid, version, doc, meta, iat, NULL, NULL, sat, nonce, ext_id, period_start, period_end")
        }
        TableKind::Linkage => Err(LedgerError::configuration("linkage tables are read through LinkageStore")),
    }
}

/// Columns as SQLite hands them back, before domain parsing.
struct RawRow {
    uuid: String,
    version: String,
    doc: String,
    meta: String,
    iat: i64,
    uat: Option<i64>,
    dat: Option<i64>,
    sat: Option<String>,
    nonce: Vec<u8>,
    ext_id: Option<String>,
    period_start: Option<i64>,
    period_end: Option<i64>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            version: row.get(1)?,
            doc: row.get(2)?,
            meta: row.get(3)?,
            iat: row.get(4)?,
            uat: row.get(5)?,
            dat: row.get(6)?,
            sat: row.get(7)?,
            nonce: row.get(8)?,
            ext_id: row.get(9)?,
            period_start: row.get(10)?,
            period_end: row.get(11)?,
        })
    }

    fn into_envelope(self) -> Result<Envelope, LedgerError> {
        Ok(Envelope {
            uuid: parse_uuid(&self.uuid)?,
            version: self.version.parse()?,
            doc: serde_json::from_str(&self.doc)?,
            meta: serde_json::from_str(&self.meta)?,
            iat: self.iat,
            uat: self.uat,
            dat: self.dat,
            sat: self.sat,
            nonce: Nonce::from_slice(&self.nonce)?,
            ext_id: self.ext_id,
            period: self.period_start.map(|start| Period { start, end: self.period_end }),
        })
    }
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(raw).map_err(|err| LedgerError::Storage(format!("stored uuid {raw} is invalid: {err}")))
}
