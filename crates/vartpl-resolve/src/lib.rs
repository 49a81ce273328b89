//!
//! Resolver for deployment variable templates.
//!
//! Responsibilities:
//! - Walk a `Reference` through a caller-supplied `ResolutionContext`.
//! - Substitute every reference in a template, all-or-nothing.
//! - Resolve many templates against one context (`batch_resolve`).
//!
//! Assumptions:
//! - The context is a snapshot built by the caller; it is only read, never retained.
//! - Templates never dereference each other here. Chaining is done by the caller feeding
//!   earlier outputs into the context of later ones.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vartpl_ast::{ParseError, ParsedTemplate, RefKind, Reference, TemplatePart};
use vartpl_parser::parse_parts;

mod batch;

pub use batch::{batch_resolve, batch_resolve_with, BatchOptions, BatchOutcome, BatchSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// A value inside a service or project record.
///
/// Only scalars can be substituted into a template.
pub enum Value {
    Null,
    Bool(bool),
    /// Integers keep their exact decimal form.
    Number(serde_json::Number),
    String(String),
    Record(BTreeMap<String, Value>),
}

impl Value {
    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Locale-independent string form of a scalar; `None` for null and records.
    pub fn as_scalar_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(number_to_string(n)),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Record(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
/// Non-finite floats have no JSON form and become `Null`.
impl From<f64> for Value {
    fn from(n: f64) -> Self { serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number) }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self { Value::Number(n.into()) }
}
impl From<u64> for Value {
    fn from(n: u64) -> Self { Value::Number(n.into()) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

fn number_to_string(n: &serde_json::Number) -> String {
    // serde_json writes integral floats as `8080.0`; std's Display writes `8080`.
    match n.as_f64() {
        Some(f) if n.is_f64() => f.to_string(),
        _ => n.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("resolution context must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("malformed resolution context: {0}")]
    Shape(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Snapshot of everything a template may reference.
///
/// Keys are entity names (`api`, `shop`, `NODE_ENV`).
pub struct ResolutionContext {
    pub services: HashMap<String, Value>,
    pub projects: HashMap<String, Value>,
    pub env: HashMap<String, String>,
}

impl ResolutionContext {
    pub fn new() -> Self { Self::default() }

    pub fn with_service(mut self, name: impl Into<String>, value: Value) -> Self {
        self.services.insert(name.into(), value);
        self
    }

    pub fn with_project(mut self, name: impl Into<String>, value: Value) -> Self {
        self.projects.insert(name.into(), value);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Builds a context from `{ "services": {...}, "projects": {...}, "env": {...} }`.
    ///
    /// Missing sections are empty. A non-object root, a `null` section or an array value
    /// is a `ContextError`.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ContextError> {
        let kind = match &json {
            serde_json::Value::Object(_) => return Ok(serde_json::from_value(json)?),
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "a boolean",
            serde_json::Value::Number(_) => "a number",
            serde_json::Value::String(_) => "a string",
            serde_json::Value::Array(_) => "an array",
        };
        Err(ContextError::NotAnObject(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionErrorKind {
    ResolutionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ResolutionError {
    #[serde(rename = "type")]
    pub kind: ResolutionErrorKind,
    pub message: String,
    /// Full dotted path of the failing reference.
    pub reference: String,
    pub raw: String,
}

impl ResolutionError {
    pub fn unresolved(reference: &Reference) -> Self {
        Self::new(format!("Cannot resolve reference: {}", reference.full_path), reference)
    }

    pub fn non_scalar(reference: &Reference) -> Self {
        Self::new(format!("Cannot resolve reference to non-scalar value: {}", reference.full_path), reference)
    }

    /// Explains why a template could not be resolved at all.
    pub fn from_parse(error: &ParseError) -> Self {
        Self {
            kind: ResolutionErrorKind::ResolutionError,
            message: format!("Invalid template: {}", error.message),
            reference: error.raw.clone(),
            raw: error.raw.clone(),
        }
    }

    fn new(message: String, reference: &Reference) -> Self {
        Self {
            kind: ResolutionErrorKind::ResolutionError,
            message,
            reference: reference.full_path.clone(),
            raw: reference.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome of resolving one template.
///
/// When `success` is false, `resolved` is the original template, untouched.
pub struct ResolutionResult {
    pub success: bool,
    pub resolved: String,
    pub errors: Vec<ResolutionError>,
}

impl ResolutionResult {
    pub fn resolved(output: String) -> Self {
        Self { success: true, resolved: output, errors: Vec::new() }
    }

    pub fn failed(template: &str, errors: Vec<ResolutionError>) -> Self {
        Self { success: false, resolved: template.to_string(), errors }
    }
}

/// Looks a single reference up in the context.
///
/// Missing entities, missing path segments, indexing into a scalar and `null` leaves are all
/// `ResolutionError`s. A record where a scalar is needed is a non-scalar error.
pub fn resolve_reference(reference: &Reference, ctx: &ResolutionContext) -> Result<String, ResolutionError> {
    let root = match reference.kind {
        RefKind::Env => {
            return ctx.env.get(&reference.name).cloned().ok_or_else(|| ResolutionError::unresolved(reference));
        }
        RefKind::Service => ctx.services.get(&reference.name),
        RefKind::Project => ctx.projects.get(&reference.name),
    }
    .ok_or_else(|| ResolutionError::unresolved(reference))?;

    let leaf = reference
        .property_path()
        .try_fold(root, |value, segment| value.get(segment))
        .ok_or_else(|| ResolutionError::unresolved(reference))?;

    match leaf {
        Value::Record(_) => Err(ResolutionError::non_scalar(reference)),
        Value::Null => Err(ResolutionError::unresolved(reference)),
        scalar => scalar.as_scalar_string().ok_or_else(|| ResolutionError::unresolved(reference)),
    }
}

/// Resolves an already parsed template, collecting every failing reference.
pub fn resolve_parsed(parsed: &ParsedTemplate, ctx: &ResolutionContext) -> ResolutionResult {
    let mut output = String::with_capacity(parsed.source.len());
    let mut errors = Vec::new();

    for part in &parsed.parts {
        match part {
            TemplatePart::Literal { text } => output.push_str(text),
            TemplatePart::Reference(reference) => match resolve_reference(reference, ctx) {
                Ok(value) => output.push_str(&value),
                Err(e) => {
                    tracing::debug!(reference = %reference.full_path, "{}", e.message);
                    errors.push(e);
                }
            },
        }
    }

    if errors.is_empty() {
        ResolutionResult::resolved(output)
    } else {
        ResolutionResult::failed(&parsed.source, errors)
    }
}

/// Parses and resolves one template.
///
/// A template that does not parse is returned unchanged with a single error explaining why.
pub fn resolve_template(template: &str, ctx: &ResolutionContext) -> ResolutionResult {
    let parsed = match parse_parts(template) {
        Ok(parsed) => parsed,
        Err(e) => return ResolutionResult::failed(template, vec![ResolutionError::from_parse(&e)]),
    };
    let result = resolve_parsed(&parsed, ctx);
    tracing::debug!(success = result.success, errors = result.errors.len(), "resolved template");
    result
}
