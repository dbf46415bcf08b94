//! `${…}` placeholder scanning and template rendering
//!
//! Any string value in a resource template is one of three things: a plain
//! literal, a single whole-string expression (`"${expr}"`, preserving the
//! expression's type), or a mixed string where every `${…}` fragment is
//! string-coerced and concatenated with the literal parts. `$$` escapes a
//! literal dollar sign.

use crate::ast::Expr;
use crate::error::{ExprError, Result};
use crate::eval::{eval, Bindings};
use crate::parser::parse;
use serde_json::Value;

/// A raw scanned segment of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// The expression source between `${` and its matching `}`.
    Expr(String),
}

/// A template string with its expressions parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<ParsedSegment>,
}

#[derive(Debug, Clone, PartialEq)]
enum ParsedSegment {
    Literal(String),
    Expr(Expr),
}

/// Quick check whether a string contains any unescaped `${` marker.
pub fn is_template(input: &str) -> bool {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' {
            if bytes[i + 1] == b'$' {
                i += 2;
                continue;
            }
            if bytes[i + 1] == b'{' {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Split a template string into literal and expression segments.
///
/// Braces inside expression sources are tracked so map literals and nested
/// indexing survive: `${ {'a': 1}['a'] }` is one segment. String literals
/// inside expressions may contain braces freely.
pub fn scan(input: &str) -> Result<Vec<Segment>> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'$') {
            literal.push('$');
            i += 2;
            continue;
        }
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if !literal.is_empty() {
                out.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let start = i + 2;
            let end = find_closing_brace(input, start)?;
            out.push(Segment::Expr(input[start..end].to_string()));
            i = end + 1;
            continue;
        }
        let ch_len = input[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        literal.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }

    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    Ok(out)
}

fn find_closing_brace(input: &str, start: usize) -> Result<usize> {
    let bytes = input.as_bytes();
    let mut depth = 1usize;
    let mut i = start;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
        } else {
            match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    Err(ExprError::parse(start, "unterminated '${' placeholder"))
}

impl Template {
    /// Parse every placeholder in a template string.
    pub fn parse(input: &str) -> Result<Template> {
        let mut segments = Vec::new();
        for seg in scan(input)? {
            segments.push(match seg {
                Segment::Literal(s) => ParsedSegment::Literal(s),
                Segment::Expr(src) => ParsedSegment::Expr(parse(&src)?),
            });
        }
        Ok(Template { segments })
    }

    /// All parsed expressions, in order of appearance.
    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|s| match s {
            ParsedSegment::Expr(e) => Some(e),
            ParsedSegment::Literal(_) => None,
        })
    }

    /// True when the template is exactly one expression with no literal
    /// text, in which case rendering preserves the expression's type.
    pub fn is_whole_expr(&self) -> bool {
        matches!(self.segments.as_slice(), [ParsedSegment::Expr(_)])
    }

    /// True when the template contains at least one expression.
    pub fn has_exprs(&self) -> bool {
        self.exprs().next().is_some()
    }

    /// Render against live bindings.
    ///
    /// Whole-string expressions yield whatever value the expression
    /// produces; mixed templates coerce each fragment to a string.
    pub fn render(&self, bindings: &Bindings) -> Result<Value> {
        if let [ParsedSegment::Expr(e)] = self.segments.as_slice() {
            return eval(e, bindings);
        }

        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                ParsedSegment::Literal(s) => out.push_str(s),
                ParsedSegment::Expr(e) => {
                    let v = eval(e, bindings)?;
                    out.push_str(&coerce_to_string(&v)?);
                }
            }
        }
        Ok(Value::String(out))
    }
}

fn coerce_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ExprError::Eval(format!(
            "cannot splice a {} into a string template",
            match other {
                Value::Null => "null",
                Value::Array(_) => "list",
                Value::Object(_) => "object",
                _ => unreachable!(),
            }
        ))),
    }
}
