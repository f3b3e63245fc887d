//! Request matching logic.
//!
//! Compiles trigger expressions once and matches inbound messages against
//! them. Three strategies exist:
//!
//! - **regex**: the pattern, compiled with dot-matches-newline, must match
//!   anywhere in the body
//! - **gson**: a JSON path must resolve to an existing value in the body
//! - **jsonpath**: a JSONPath expression, optionally compared against a JSON
//!   literal, must evaluate to boolean `true`

use crate::message::Message;
use jsonpath_rust::JsonPath;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Check expected headers against a message.
///
/// Each expected header must be present, and its expected value must equal one
/// of the `;`-separated, trimmed segments of the message's value.
pub fn matches_headers(expected: &BTreeMap<String, String>, message: &Message) -> bool {
    expected.iter().all(|(name, value)| {
        message
            .headers
            .get(name)
            .map(|actual| actual.split(';').any(|segment| segment.trim() == value))
            .unwrap_or(false)
    })
}

/// A trigger expression compiled for one matching strategy.
pub enum CompiledExpression {
    Regex(Regex),
    JsonExists(JsonLookup),
    JsonPathBoolean(JsonPredicate),
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledExpression::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            CompiledExpression::JsonExists(_) => f.write_str("JsonExists"),
            CompiledExpression::JsonPathBoolean(_) => f.write_str("JsonPathBoolean"),
        }
    }
}

impl CompiledExpression {
    pub fn regex(pattern: &str) -> Result<Self, String> {
        RegexBuilder::new(pattern)
            .dot_matches_new_line(true)
            .build()
            .map(CompiledExpression::Regex)
            .map_err(|e| format!("Invalid regex: {}", e))
    }

    pub fn json_exists(expression: &str) -> Result<Self, String> {
        JsonLookup::parse(expression).map(CompiledExpression::JsonExists)
    }

    pub fn json_path_boolean(expression: &str) -> Result<Self, String> {
        JsonPredicate::parse(expression).map(CompiledExpression::JsonPathBoolean)
    }

    /// Match a message body.
    pub fn matches(&self, body: &str) -> bool {
        match self {
            CompiledExpression::Regex(regex) => regex.is_match(body),
            CompiledExpression::JsonExists(lookup) => match serde_json::from_str::<Value>(body) {
                Ok(json) => lookup.exists(&json),
                Err(_) => false,
            },
            CompiledExpression::JsonPathBoolean(predicate) => {
                match serde_json::from_str::<Value>(body) {
                    Ok(json) => predicate.evaluate(&json),
                    Err(e) => {
                        tracing::debug!(error = %e, "Message body is not valid JSON");
                        false
                    }
                }
            }
        }
    }
}

fn compile_json_path(expression: &str) -> Result<JsonPath, String> {
    JsonPath::try_from(expression).map_err(|e| format!("Invalid JSON path '{}': {}", expression, e))
}

/// Normalize a JSONPath result into the list of values it selected.
fn selected_values(path: &JsonPath, json: &Value) -> Vec<Value> {
    match path.find(json) {
        Value::Null => Vec::new(),
        Value::Array(values) => values,
        other => vec![other],
    }
}

/// Path used by the existence strategy.
pub enum JsonLookup {
    /// `$`-prefixed JSONPath
    JsonPath(JsonPath),
    /// Dotted path such as `user.tags.0` or `items.#`
    Dotted(Vec<PathSegment>),
}

/// One segment of a dotted path.
pub enum PathSegment {
    Key(String),
    Wildcard(globset::GlobMatcher),
    /// `#`: the length of an array
    Count,
}

impl JsonLookup {
    fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err("JSON path cannot be empty".to_string());
        }
        if expression.starts_with('$') {
            return compile_json_path(expression).map(JsonLookup::JsonPath);
        }

        split_dotted(expression)
            .into_iter()
            .map(|raw| {
                if raw.segment == "#" && !raw.escaped {
                    Ok(PathSegment::Count)
                } else if !raw.escaped && raw.segment.contains(['*', '?']) {
                    globset::Glob::new(&raw.segment)
                        .map(|glob| PathSegment::Wildcard(glob.compile_matcher()))
                        .map_err(|e| format!("Invalid wildcard '{}': {}", raw.segment, e))
                } else {
                    Ok(PathSegment::Key(raw.segment))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(JsonLookup::Dotted)
    }

    pub fn exists(&self, json: &Value) -> bool {
        match self {
            JsonLookup::JsonPath(path) => !selected_values(path, json).is_empty(),
            JsonLookup::Dotted(segments) => dotted_exists(json, segments),
        }
    }
}

struct RawSegment {
    segment: String,
    escaped: bool,
}

/// Split on unescaped dots; `\.` and `\\` escape literally.
fn split_dotted(path: &str) -> Vec<RawSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut chars = path.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    escaped = true;
                }
            }
            '.' => {
                segments.push(RawSegment {
                    segment: std::mem::take(&mut current),
                    escaped,
                });
                escaped = false;
            }
            _ => current.push(ch),
        }
    }
    segments.push(RawSegment {
        segment: current,
        escaped,
    });

    segments
}

fn dotted_exists(value: &Value, segments: &[PathSegment]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };

    match first {
        // `#` yields the array length, and `items.#.name` maps over elements
        PathSegment::Count => value.is_array(),
        PathSegment::Key(key) => match value {
            Value::Object(map) => map.get(key).is_some_and(|v| dotted_exists(v, rest)),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx))
                .is_some_and(|v| dotted_exists(v, rest)),
            _ => false,
        },
        PathSegment::Wildcard(glob) => match value {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| glob.is_match(k) && dotted_exists(v, rest)),
            _ => false,
        },
    }
}

/// Boolean JSONPath evaluation, optionally comparing the selected value.
pub struct JsonPredicate {
    path: JsonPath,
    comparison: Option<(CompareOp, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(self, left: &Value, right: &Value) -> bool {
        let order = || json_order(left, right);
        match self {
            CompareOp::Eq => json_equal(left, right),
            CompareOp::Ne => !json_equal(left, right),
            CompareOp::Lt => order() == Some(Ordering::Less),
            CompareOp::Le => matches!(order(), Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Gt => order() == Some(Ordering::Greater),
            CompareOp::Ge => matches!(order(), Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

fn json_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn json_order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

impl JsonPredicate {
    fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        if !expression.starts_with('$') {
            return Err(format!("JSON path must start with '$': {}", expression));
        }

        match find_comparison(expression) {
            Some((idx, op, len)) => {
                let path = compile_json_path(expression[..idx].trim())?;
                let literal = parse_literal(expression[idx + len..].trim())?;
                Ok(Self {
                    path,
                    comparison: Some((op, literal)),
                })
            }
            None => Ok(Self {
                path: compile_json_path(expression)?,
                comparison: None,
            }),
        }
    }

    pub fn evaluate(&self, json: &Value) -> bool {
        let values = selected_values(&self.path, json);
        match &self.comparison {
            Some((op, literal)) => values.iter().any(|v| op.apply(v, literal)),
            None => matches!(values.as_slice(), [Value::Bool(true)]),
        }
    }
}

/// Locate a top-level comparison operator, ignoring brackets and quoted text.
fn find_comparison(expression: &str) -> Option<(usize, CompareOp, usize)> {
    let bytes = expression.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
        } else {
            match b {
                b'\'' | b'"' => quote = Some(b),
                b'[' | b'(' => depth += 1,
                b']' | b')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => {
                    let next = bytes.get(i + 1).copied();
                    let op = match (b, next) {
                        (b'=', Some(b'=')) => Some((CompareOp::Eq, 2)),
                        (b'!', Some(b'=')) => Some((CompareOp::Ne, 2)),
                        (b'<', Some(b'=')) => Some((CompareOp::Le, 2)),
                        (b'>', Some(b'=')) => Some((CompareOp::Ge, 2)),
                        (b'<', _) => Some((CompareOp::Lt, 1)),
                        (b'>', _) => Some((CompareOp::Gt, 1)),
                        _ => None,
                    };
                    if let Some((op, len)) = op {
                        return Some((i, op, len));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    None
}

/// Parse the right-hand side of a comparison. Single-quoted strings are accepted.
fn parse_literal(raw: &str) -> Result<Value, String> {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    serde_json::from_str(raw).map_err(|e| format!("Invalid comparison literal '{}': {}", raw, e))
}
