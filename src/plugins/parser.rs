//! Tool call markup parser
//!
//! Scans model output for blocks of the form
//!
//! ```text
//! <<<[TOOL_REQUEST]>>>
//! tool_name:「始」Echo「末」,
//! text:「始」hello, world「末」
//! <<<[END_TOOL_REQUEST]>>>
//! ```
//!
//! Each block is tokenized on its own; a broken block is counted and skipped
//! without affecting its neighbours.

use super::protocol::{Arguments, ToolCallRequest};
use std::ops::Range;
use thiserror::Error;
use tracing::debug;

pub const MARKER_START: &str = "<<<[TOOL_REQUEST]>>>";
pub const MARKER_END: &str = "<<<[END_TOOL_REQUEST]>>>";
pub const VALUE_OPEN: &str = "「始」";
pub const VALUE_CLOSE: &str = "「末」";
pub const TOOL_NAME_KEY: &str = "tool_name";

/// Why a marked span was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("start marker without a matching end marker")]
    Unterminated,

    #[error("empty request block")]
    Empty,

    #[error("expected ':' after key at offset {0}")]
    MissingColon(usize),

    #[error("empty key at offset {0}")]
    EmptyKey(usize),

    #[error("value for '{0}' is not wrapped")]
    UnwrappedValue(String),

    #[error("value for '{0}' is never closed")]
    UnterminatedValue(String),

    #[error("expected ',' after value of '{0}'")]
    MissingSeparator(String),

    #[error("first key must be tool_name, found '{0}'")]
    MissingToolName(String),

    #[error("tool_name is empty")]
    EmptyToolName,
}

/// A span that was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedSpan {
    pub span: Range<usize>,
    pub reason: MalformedReason,
}

/// Everything found in one piece of text
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub requests: Vec<ToolCallRequest>,
    /// Skipped spans in source order
    pub malformed: Vec<MalformedSpan>,
}

/// Parse all tool call requests in `text`
pub fn parse(text: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    for item in RequestScanner::new(text) {
        match item {
            Ok(request) => outcome.requests.push(request),
            Err(bad) => {
                debug!("Skipping malformed tool request at {:?}: {}", bad.span, bad.reason);
                outcome.malformed.push(bad);
            }
        }
    }
    outcome
}

/// Check whether text contains any start marker
pub fn contains_tool_call(text: &str) -> bool {
    text.contains(MARKER_START)
}

/// Single-pass scanner over the marked spans of a text
pub struct RequestScanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> RequestScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl<'a> Iterator for RequestScanner<'a> {
    type Item = Result<ToolCallRequest, MalformedSpan>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.text.get(self.pos..)?;
        let start = self.pos + rest.find(MARKER_START)?;
        let body_start = start + MARKER_START.len();
        let after = &self.text[body_start..];

        let end = after.find(MARKER_END).map(|i| body_start + i);
        let next_start = after.find(MARKER_START).map(|i| body_start + i);

        match (end, next_start) {
            (Some(end), next) if next.map_or(true, |n| end < n) => {
                let span_end = end + MARKER_END.len();
                self.pos = span_end;
                let span = start..span_end;
                Some(match parse_block(&self.text[body_start..end]) {
                    Ok((tool_name, arguments)) => Ok(ToolCallRequest {
                        tool_name,
                        arguments,
                        span,
                    }),
                    Err(reason) => Err(MalformedSpan { span, reason }),
                })
            }
            (_, Some(next)) => {
                self.pos = next;
                Some(Err(MalformedSpan {
                    span: start..next,
                    reason: MalformedReason::Unterminated,
                }))
            }
            _ => {
                self.pos = self.text.len();
                Some(Err(MalformedSpan {
                    span: start..self.text.len(),
                    reason: MalformedReason::Unterminated,
                }))
            }
        }
    }
}

/// Tokenize the body between the markers
fn parse_block(body: &str) -> Result<(String, Arguments), MalformedReason> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut pos = skip_whitespace(body, 0);

    while pos < body.len() {
        let (key, after_colon) = read_key(body, pos)?;
        let value_start = skip_whitespace(body, after_colon);
        if !body[value_start..].starts_with(VALUE_OPEN) {
            return Err(MalformedReason::UnwrappedValue(key));
        }
        let (value, after_value) = read_wrapped(body, value_start)
            .ok_or_else(|| MalformedReason::UnterminatedValue(key.clone()))?;

        pos = skip_whitespace(body, after_value);
        if pos < body.len() {
            if !body[pos..].starts_with(',') {
                return Err(MalformedReason::MissingSeparator(key));
            }
            pos = skip_whitespace(body, pos + 1);
        }
        pairs.push((key, value));
    }

    let mut pairs = pairs.into_iter();
    let (first_key, tool_name) = pairs.next().ok_or(MalformedReason::Empty)?;
    if first_key != TOOL_NAME_KEY {
        return Err(MalformedReason::MissingToolName(first_key));
    }
    if tool_name.is_empty() {
        return Err(MalformedReason::EmptyToolName);
    }

    Ok((tool_name, pairs.collect()))
}

/// Read `key:` starting at `pos`; returns the trimmed key and the offset after ':'
fn read_key(body: &str, pos: usize) -> Result<(String, usize), MalformedReason> {
    let rest = &body[pos..];
    let colon = rest.find(':').ok_or(MalformedReason::MissingColon(pos))?;
    let raw = &rest[..colon];
    if raw.contains(',') || raw.contains(VALUE_OPEN) || raw.contains(VALUE_CLOSE) {
        return Err(MalformedReason::MissingColon(pos));
    }
    let key = raw.trim();
    if key.is_empty() {
        return Err(MalformedReason::EmptyKey(pos));
    }
    Ok((key.to_string(), pos + colon + 1))
}

/// Read a wrapped value whose opening token starts at `pos`.
///
/// Nested wrapper pairs are balanced, so the value ends at the close token
/// that brings the depth back to zero. Returns the trimmed inner text and the
/// offset after the closing token.
fn read_wrapped(body: &str, pos: usize) -> Option<(String, usize)> {
    let inner_start = pos + VALUE_OPEN.len();
    let mut depth = 1usize;
    let mut cursor = inner_start;

    while depth > 0 {
        let rest = &body[cursor..];
        let open = rest.find(VALUE_OPEN);
        let close = rest.find(VALUE_CLOSE)?;
        match open {
            Some(o) if o < close => {
                depth += 1;
                cursor += o + VALUE_OPEN.len();
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    let inner = &body[inner_start..cursor + close];
                    return Some((inner.trim().to_string(), cursor + close + VALUE_CLOSE.len()));
                }
                cursor += close + VALUE_CLOSE.len();
            }
        }
    }
    None
}

fn skip_whitespace(body: &str, pos: usize) -> usize {
    body[pos..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map_or(body.len(), |(i, _)| pos + i)
}

impl ToolCallRequest {
    /// Render the canonical markup for this request
    pub fn to_markup(&self) -> String {
        let mut lines = vec![format!("{}:{}{}{}", TOOL_NAME_KEY, VALUE_OPEN, self.tool_name, VALUE_CLOSE)];
        lines.extend(
            self.arguments
                .iter()
                .map(|(k, v)| format!("{}:{}{}{}", k, VALUE_OPEN, v, VALUE_CLOSE)),
        );
        format!("{}\n{}\n{}", MARKER_START, lines.join(",\n"), MARKER_END)
    }
}
