//!
//! Data model for deployment variable templates.
//!
//! Shared by:
//! - the parser (template text -> `ParsedTemplate` / `ParseResult`),
//! - the resolver (substitutes references from a `ResolutionContext`),
//! - the deploy-time checks (cycle detection, catalog validation).
//!
//! Key features:
//! - `Reference`: one parsed `${type.name[.property]}` span.
//! - `ParseError` / `ParseResult`: the parse-time error taxonomy.
//! - `extract_dependencies`: which services, projects and env vars a template touches.
//! - `template_hash`: stable hash of the canonical JSON of a parsed template (dedupe / caching).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The entity family a reference points into.
pub enum RefKind {
    Service,
    Project,
    Env,
}

impl RefKind {
    /// The first path segment used in template text (`services`, `projects`, `env`).
    pub fn prefix(self) -> &'static str {
        match self {
            RefKind::Service => "services",
            RefKind::Project => "projects",
            RefKind::Env => "env",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "services" => Some(RefKind::Service),
            "projects" => Some(RefKind::Project),
            "env" => Some(RefKind::Env),
            _ => None,
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefKind::Service => "service",
            RefKind::Project => "project",
            RefKind::Env => "env",
        })
    }
}

/// Byte range inside the template, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}
impl Span {
    pub fn new(start: usize, end: usize) -> Self { Self { start, end } }
    pub fn len(&self) -> usize { self.end - self.start }
    pub fn is_empty(&self) -> bool { self.start == self.end }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A parsed `${...}` reference like `${services.api.url}`.
///
/// `full_path` is always rebuilt from `kind`, `name` and `property`, never copied from `raw`.
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: RefKind,
    pub name: String,
    /// Dotted remainder after the name; empty for env references.
    pub property: String,
    pub full_path: String,
    /// Exact template text including `${` and `}`.
    pub raw: String,
    pub span: Span,
}

impl Reference {
    pub fn new(kind: RefKind, name: impl Into<String>, property: impl Into<String>, raw: impl Into<String>, span: Span) -> Self {
        let name = name.into();
        let property = property.into();
        let full_path = canonical_path(kind, &name, &property);
        Self { kind, name, property, full_path, raw: raw.into(), span }
    }

    pub fn property_path(&self) -> impl Iterator<Item = &str> {
        self.property.split('.').filter(|s| !s.is_empty())
    }
}

/// Builds `{prefix}.{name}[.{property}]`.
pub fn canonical_path(kind: RefKind, name: &str, property: &str) -> String {
    if property.is_empty() {
        format!("{}.{}", kind.prefix(), name)
    } else {
        format!("{}.{}.{}", kind.prefix(), name, property)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// `${` with no closing `}`.
    SyntaxError,
    /// `${}`.
    EmptyReference,
    /// Content that does not match `type.name[.property...]`.
    InvalidReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ParseError {
    #[serde(rename = "type")]
    pub kind: ParseErrorKind,
    pub message: String,
    /// Byte offset in the template.
    pub position: usize,
    pub raw: String,
}

impl ParseError {
    pub fn syntax(position: usize, raw: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::SyntaxError,
            message: format!("Unclosed variable reference starting at position {position}"),
            position,
            raw: raw.into(),
        }
    }

    pub fn empty(position: usize, raw: impl Into<String>) -> Self {
        Self {
            kind: ParseErrorKind::EmptyReference,
            message: format!("Empty variable reference at position {position}"),
            position,
            raw: raw.into(),
        }
    }

    pub fn invalid(position: usize, raw: impl Into<String>, content: &str) -> Self {
        Self {
            kind: ParseErrorKind::InvalidReference,
            message: format!("Invalid variable reference: {content}"),
            position,
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplatePart {
    Literal { text: String },
    Reference(Reference),
}

/// A template split into literal text and references, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTemplate {
    pub source: String,
    pub parts: Vec<TemplatePart>,
}

impl ParsedTemplate {
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Reference(r) => Some(r),
            TemplatePart::Literal { .. } => None,
        })
    }

    pub fn has_references(&self) -> bool { self.references().next().is_some() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Outcome of parsing one template.
///
/// `is_valid == errors.is_empty()`, and `references` is empty whenever an error exists.
pub struct ParseResult {
    pub is_valid: bool,
    pub references: Vec<Reference>,
    pub errors: Vec<ParseError>,
}

impl ParseResult {
    pub fn valid(references: Vec<Reference>) -> Self {
        Self { is_valid: true, references, errors: Vec::new() }
    }

    pub fn invalid(error: ParseError) -> Self {
        Self { is_valid: false, references: Vec::new(), errors: vec![error] }
    }
}

impl From<Result<ParsedTemplate, ParseError>> for ParseResult {
    fn from(r: Result<ParsedTemplate, ParseError>) -> Self {
        match r {
            Ok(parsed) => ParseResult::valid(parsed.references().cloned().collect()),
            Err(e) => ParseResult::invalid(e),
        }
    }
}

pub fn canonical_json(parsed: &ParsedTemplate) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(parsed)
}

/// SHA-256 hex digest of the canonical JSON; equal templates hash equally.
pub fn template_hash(parsed: &ParsedTemplate) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&canonical_json(parsed)?)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Entity names a template refers to, grouped by kind.
///
/// This powers:
/// - impact analysis ("which variables break if service X is removed?"),
/// - catalog validation before a configuration is saved.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    pub services: BTreeSet<String>,
    pub projects: BTreeSet<String>,
    pub env: BTreeSet<String>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.projects.is_empty() && self.env.is_empty()
    }

    pub fn contains(&self, kind: RefKind, name: &str) -> bool {
        match kind {
            RefKind::Service => self.services.contains(name),
            RefKind::Project => self.projects.contains(name),
            RefKind::Env => self.env.contains(name),
        }
    }
}

pub fn extract_dependencies(parsed: &ParsedTemplate) -> Dependencies {
    let mut d = Dependencies::default();
    for r in parsed.references() {
        let set = match r.kind {
            RefKind::Service => &mut d.services,
            RefKind::Project => &mut d.projects,
            RefKind::Env => &mut d.env,
        };
        set.insert(r.name.clone());
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ParsedTemplate {
        let api = Reference::new(RefKind::Service, "api", "url", "${services.api.url}", Span::new(4, 23));
        let env = Reference::new(RefKind::Env, "NODE_ENV", "", "${env.NODE_ENV}", Span::new(24, 39));
        ParsedTemplate {
            source: "url=${services.api.url}/${env.NODE_ENV}".into(),
            parts: vec![
                TemplatePart::Literal { text: "url=".into() },
                TemplatePart::Reference(api),
                TemplatePart::Literal { text: "/".into() },
                TemplatePart::Reference(env),
            ],
        }
    }

    #[test]
    fn full_path_is_rebuilt_from_parts() {
        let r = Reference::new(RefKind::Project, "shop", "config.database.host", "${ projects.shop.config.database.host }", Span::new(0, 39));
        assert_eq!(r.full_path, "projects.shop.config.database.host");
        let e = Reference::new(RefKind::Env, "PORT", "", "${env.PORT}", Span::new(0, 11));
        assert_eq!(e.full_path, "env.PORT");
        assert_eq!(e.property_path().count(), 0);
    }

    #[test]
    fn prefixes_round_trip() {
        for kind in [RefKind::Service, RefKind::Project, RefKind::Env] {
            assert_eq!(RefKind::from_prefix(kind.prefix()), Some(kind));
        }
        assert_eq!(RefKind::from_prefix("service"), None);
    }

    #[test]
    fn parse_result_from_error_has_no_references() {
        let r = ParseResult::from(Err(ParseError::syntax(0, "${unclosed")));
        assert!(!r.is_valid);
        assert!(r.references.is_empty());
        assert_eq!(r.errors[0].kind, ParseErrorKind::SyntaxError);
    }

    #[test]
    fn serializes_with_wire_names() {
        let r = Reference::new(RefKind::Service, "api", "url", "${services.api.url}", Span::new(0, 19));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "service");
        assert_eq!(v["fullPath"], "services.api.url");

        let e = serde_json::to_value(ParseError::empty(2, "${}")).unwrap();
        assert_eq!(e["type"], "empty_reference");
        assert_eq!(e["position"], 2);

        let p = serde_json::to_value(ParseResult::valid(vec![])).unwrap();
        assert_eq!(p["isValid"], true);
    }

    #[test]
    fn dependencies_group_names_by_kind() {
        let d = extract_dependencies(&sample());
        assert!(d.contains(RefKind::Service, "api"));
        assert!(d.contains(RefKind::Env, "NODE_ENV"));
        assert!(d.projects.is_empty());
        assert!(!d.is_empty());
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = sample();
        assert_eq!(template_hash(&a).unwrap(), template_hash(&a.clone()).unwrap());
        assert_eq!(template_hash(&a).unwrap().len(), 64);

        let mut b = a.clone();
        b.parts[2] = TemplatePart::Literal { text: ":".into() };
        assert_ne!(template_hash(&a).unwrap(), template_hash(&b).unwrap());
    }

    #[test]
    fn canonical_json_carries_parts() {
        let v = canonical_json(&sample()).unwrap();
        assert_eq!(v["parts"][0]["kind"], "literal");
        assert_eq!(v["parts"][1]["fullPath"], "services.api.url");
    }
}
