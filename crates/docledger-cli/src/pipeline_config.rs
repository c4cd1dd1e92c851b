//! YAML pipeline definitions and the declarative `fan_out` transformer.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use docledger_core::{
    Candidate, Candidates, ContentHasher, Sha256Hasher, TableName, TransformError, TransformInfo, Transformer,
};
use docledger_store_sqlite::{DuplicatePolicy, PipelineOptions, Routing};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub interface: String,
    #[serde(default)]
    pub interface_id: Option<String>,
    #[serde(default)]
    pub interface_instance: Option<String>,
    pub if_uuid: String,
    pub stream: String,
    pub raw_table: String,
    pub link_table: String,
    pub log: RouteSpec,
    pub state: RouteSpec,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub uuid_scope: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    pub transform: FanOutSpec,
}

/// `log: orders_log` routes to a table, `log: false` disables it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RouteSpec {
    Table(String),
    Enabled(bool),
}

impl RouteSpec {
    fn routing(&self, name: &str) -> Result<Routing> {
        match self {
            Self::Table(table) => Ok(Routing::Table(TableName::new(table.as_str())?)),
            Self::Enabled(false) => Ok(Routing::Disabled),
            Self::Enabled(true) => bail!("{name} must be a table name or false"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FanOutSpec {
    pub name: String,
    pub version: String,
    /// Candidate kind; combined with the key under the pipeline's `if_uuid`.
    pub kind: String,
    /// Dotted path of the key inside each element.
    #[serde(default)]
    pub key_field: Option<String>,
    /// Dotted path of an array to fan out over; the whole payload when unset.
    #[serde(default)]
    pub items: Option<String>,
    /// Fields copied into each candidate; everything when empty.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config {}", path.display()))?;
        serde_yaml::from_str(&body).with_context(|| format!("invalid pipeline config {}", path.display()))
    }

    pub fn raw_table(&self) -> Result<TableName> {
        Ok(TableName::new(self.raw_table.as_str())?)
    }

    pub fn link_table(&self) -> Result<TableName> {
        Ok(TableName::new(self.link_table.as_str())?)
    }

    pub fn options(&self) -> Result<PipelineOptions> {
        let mut builder = PipelineOptions::builder(self.interface.clone())
            .if_uuid(self.if_uuid.clone())
            .stream(self.stream.clone())
            .log(self.log.routing("log")?)
            .state(self.state.routing("state")?)
            .on_duplicate(self.on_duplicate)
            .transform_version(self.transform.version.clone());
        if let Some(id) = &self.interface_id {
            builder = builder.interface_id(id.clone());
        }
        if let Some(instance) = &self.interface_instance {
            builder = builder.interface_instance(instance.clone());
        }
        if let Some(source_name) = &self.source_name {
            builder = builder.source_name(source_name.clone());
        }
        if let Some(scope) = &self.uuid_scope {
            builder = builder.uuid_scope(scope.clone());
        }
        if let Some(actor) = &self.actor {
            builder = builder.actor(actor.clone());
        }
        if let Some(schema_version) = &self.schema_version {
            builder = builder.schema_version(schema_version.clone());
        }
        Ok(builder.build()?)
    }
}

pub struct FanOut {
    spec: FanOutSpec,
    config_hash: String,
}

impl FanOut {
    pub fn new(spec: FanOutSpec) -> Result<Self> {
        if spec.kind.is_empty() {
            bail!("transform kind must not be empty");
        }
        let config_hash = Sha256Hasher.digest(&serde_json::to_value(&spec)?).to_hex();
        Ok(Self { spec, config_hash })
    }

    fn candidates(&self, raw: &Value, ext_id: Option<&str>) -> Result<Vec<Candidate>, TransformError> {
        let elements: Vec<&Value> = match &self.spec.items {
            Some(path) => lookup(raw, path)
                .and_then(Value::as_array)
                .ok_or_else(|| TransformError::from(format!("items path `{path}` is not an array")))?
                .iter()
                .collect(),
            None => vec![raw],
        };

        let mut out = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let key = match (&self.spec.key_field, &self.spec.items) {
                (Some(field), _) => scalar_text(lookup(element, field))
                    .ok_or_else(|| TransformError::from(format!("key field `{field}` missing in element {index}")))?,
                (None, Some(_)) => index.to_string(),
                (None, None) => ext_id
                    .map(str::to_string)
                    .ok_or_else(|| TransformError::from("no key field configured and no ext id given"))?,
            };
            let mut candidate = Candidate::keyed(self.project(element), self.spec.kind.clone(), key);
            if let Some(stream) = &self.spec.stream {
                candidate = candidate.with_stream(stream.clone());
            }
            out.push(candidate);
        }
        Ok(out)
    }

    fn project(&self, element: &Value) -> Value {
        let Some(object) = element.as_object() else {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), element.clone());
            return Value::Object(wrapped);
        };
        if self.spec.fields.is_empty() {
            return Value::Object(object.clone());
        }
        let mut projected = Map::new();
        for field in &self.spec.fields {
            if let Some(value) = lookup(element, field) {
                projected.insert(field.clone(), value.clone());
            }
        }
        Value::Object(projected)
    }
}

impl Transformer for FanOut {
    fn info(&self) -> TransformInfo {
        TransformInfo {
            name: self.spec.name.clone(),
            version: self.spec.version.clone(),
            config_hash: Some(self.config_hash.clone()),
        }
    }

    fn transform<'a>(&'a self, raw: &'a Value, _meta: &'a Value, ext_id: Option<&'a str>) -> Candidates<'a> {
        match self.candidates(raw, ext_id) {
            Ok(candidates) => Box::new(candidates.into_iter().map(Ok)),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        other => other.get(segment),
    })
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid JSON argument: {err}"))
}
