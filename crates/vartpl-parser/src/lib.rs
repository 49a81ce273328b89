//!
//! Parser for deployment variable templates.
//!
//! Turns template text such as `https://${services.api.host}:${env.PORT}` into the
//! shared model in `vartpl-ast`.
//!
//! Two stages:
//! 1. `Scanner` walks the text once, splitting literal text from raw `${...}` spans.
//! 2. `classify` checks each span's content against the reference grammar
//!    (`services.NAME[.prop...]`, `projects.NAME[.prop...]`, `env.NAME`).
//!
//! Parsing is fail-fast: the first error ends the template and no references are returned.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use vartpl_ast::{ParseError, ParseResult, ParsedTemplate, RefKind, Reference, Span, TemplatePart};

#[derive(Parser)]
#[grammar = "reference.pest"]
struct ReferenceParser;

/// One piece of scanner output, borrowed from the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPart<'a> {
    Literal { text: &'a str, start: usize },
    /// `raw` includes `${` and `}`; `content` is what sits between them.
    Reference { raw: &'a str, content: &'a str, start: usize },
}

/// Left-to-right scanner yielding one part at a time.
///
/// `\$` is kept as literal text and never opens a reference. A `$` not followed by `{` is
/// literal. Reaching the end inside `${` yields a `syntax_error` at the offset of that `$`,
/// after which the scanner is exhausted.
#[derive(Debug, Clone)]
pub struct Scanner<'a> {
    template: &'a str,
    pos: usize,
    done: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(template: &'a str) -> Self { Self { template, pos: 0, done: false } }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Result<RawPart<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let template = self.template;
        let bytes = template.as_bytes();
        let start = self.pos;
        let mut i = start;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' if bytes.get(i + 1) == Some(&b'$') => i += 2,
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    if start < i {
                        self.pos = i;
                        return Some(Ok(RawPart::Literal { text: &template[start..i], start }));
                    }
                    let content_start = i + 2;
                    return Some(match template[content_start..].find('}') {
                        Some(offset) => {
                            let close = content_start + offset;
                            self.pos = close + 1;
                            Ok(RawPart::Reference {
                                raw: &template[i..=close],
                                content: &template[content_start..close],
                                start: i,
                            })
                        }
                        None => {
                            self.done = true;
                            Err(ParseError::syntax(i, &template[i..]))
                        }
                    });
                }
                _ => i += 1,
            }
        }

        self.done = true;
        (start < bytes.len()).then(|| Ok(RawPart::Literal { text: &template[start..], start }))
    }
}

/// Splits a whole template into literal and raw reference parts.
pub fn scan(template: &str) -> Result<Vec<RawPart<'_>>, ParseError> {
    Scanner::new(template).collect()
}

/// Classifies the content of one `${...}` span.
///
/// `position` is the byte offset of the content (just after `${`); the reference's span
/// starts two bytes earlier and covers `raw`.
pub fn classify(content: &str, position: usize, raw: &str) -> Result<Reference, ParseError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ParseError::empty(position, raw));
    }
    if trimmed.contains(['{', '}']) {
        return Err(ParseError::invalid(position, raw, trimmed));
    }

    let invalid = || ParseError::invalid(position, raw, trimmed);
    let mut pairs = ReferenceParser::parse(Rule::reference, trimmed).map_err(|_| invalid())?;
    let reference = pairs.next().ok_or_else(invalid)?;
    let body = reference.into_inner().next().ok_or_else(invalid)?;

    let kind = match body.as_rule() {
        Rule::service_ref => RefKind::Service,
        Rule::project_ref => RefKind::Project,
        Rule::env_ref => RefKind::Env,
        _ => return Err(invalid()),
    };
    let (name, property) = name_and_property(body).ok_or_else(invalid)?;

    let open = position.saturating_sub(2);
    Ok(Reference::new(kind, name, property, raw, Span::new(open, open + raw.len())))
}

fn name_and_property(body: Pair<'_, Rule>) -> Option<(&str, &str)> {
    let mut inner = body.into_inner();
    let name = inner.next().filter(|p| p.as_rule() == Rule::segment)?.as_str();
    let property = inner.next().map(|p| p.as_str()).unwrap_or("");
    Some((name, property))
}

/// Parses a template into ordered literal and reference parts.
///
/// Each span is classified as soon as it closes, so the error reported is always the
/// leftmost malformed span.
pub fn parse_parts(template: &str) -> Result<ParsedTemplate, ParseError> {
    let parts = Scanner::new(template)
        .map(|part| match part? {
            RawPart::Literal { text, .. } => Ok(TemplatePart::Literal { text: text.to_string() }),
            RawPart::Reference { raw, content, start } => classify(content, start + 2, raw).map(TemplatePart::Reference),
        })
        .collect::<Result<Vec<_>, _>>()
        .inspect_err(|e| {
            tracing::debug!(kind = ?e.kind, position = e.position, "template failed to parse: {}", e.message);
        })?;

    Ok(ParsedTemplate { source: template.to_string(), parts })
}

/// Parses a template and reports its references or its first error.
pub fn parse_template(template: &str) -> ParseResult {
    parse_parts(template).into()
}
