//! Parsing of terminal atom strings
//!
//! An atom is the string form of a leaf field:
//! `baseType ( '|' attribute )*`, e.g.
//! `integer | default=3 | minimum=1 | description="replica count"`.

use crate::error::{Result, SchemaError};
use crate::types::Validation;
use serde_json::Value;

/// A parsed atom, before named-type resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// `string`, `integer`, `number`, `boolean`, `map[string]T`, or a
    /// named type from the RGD `types` section
    pub base: BaseRef,
    pub attrs: Attrs,
}

/// Attribute payload of an atom.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attrs {
    pub required: Option<bool>,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub enum_values: Option<Vec<Value>>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub pattern: Option<String>,
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
    pub validations: Vec<Validation>,
}

/// Unresolved base type reference.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseRef {
    String,
    Integer,
    Number,
    Boolean,
    /// `map[string]<inner>`; the inner part is parsed recursively
    Map(Box<BaseRef>),
    /// Looked up in the `types` section during compilation
    Named(String),
}

/// Parse one atom string. `path` is only used for error reporting.
pub fn parse_atom(src: &str, path: &str) -> Result<Atom> {
    let parts = split_atom(src);
    let mut iter = parts.into_iter();
    let base_src = iter
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SchemaError::InvalidStructure {
            path: path.to_string(),
            detail: "empty type".to_string(),
        })?;

    let base = parse_base(&base_src, path)?;

    let mut attrs = Attrs::default();
    for part in iter {
        let part = part.trim();
        if part.is_empty() {
            return Err(SchemaError::MalformedAttribute {
                path: path.to_string(),
                detail: "empty attribute".to_string(),
            });
        }
        let (key, raw) = part.split_once('=').ok_or_else(|| SchemaError::MalformedAttribute {
            path: path.to_string(),
            detail: format!("expected key=value, found '{}'", part),
        })?;
        apply_attr(&mut attrs, key.trim(), raw.trim(), path)?;
    }

    Ok(Atom { base, attrs })
}

fn parse_base(src: &str, path: &str) -> Result<BaseRef> {
    match src {
        "string" => Ok(BaseRef::String),
        "integer" => Ok(BaseRef::Integer),
        "number" => Ok(BaseRef::Number),
        "boolean" => Ok(BaseRef::Boolean),
        _ => {
            if let Some(rest) = src.strip_prefix("map[") {
                let (key, value) = rest.split_once(']').ok_or_else(|| {
                    SchemaError::MalformedAttribute {
                        path: path.to_string(),
                        detail: format!("malformed map type '{}'", src),
                    }
                })?;
                if key.trim() != "string" {
                    return Err(SchemaError::UnknownType {
                        path: path.to_string(),
                        name: format!("map key '{}' (only string keys are supported)", key.trim()),
                    });
                }
                let inner = parse_base(value.trim(), path)?;
                return Ok(BaseRef::Map(Box::new(inner)));
            }
            // named types must look like identifiers
            if !src.is_empty()
                && src.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
                && src.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                Ok(BaseRef::Named(src.to_string()))
            } else {
                Err(SchemaError::UnknownType {
                    path: path.to_string(),
                    name: src.to_string(),
                })
            }
        }
    }
}

fn apply_attr(attrs: &mut Attrs, key: &str, raw: &str, path: &str) -> Result<()> {
    let malformed = |detail: String| SchemaError::MalformedAttribute {
        path: path.to_string(),
        detail,
    };

    match key {
        "required" => {
            attrs.required = Some(match raw {
                "true" => true,
                "false" => false,
                other => return Err(malformed(format!("required must be true or false, got '{}'", other))),
            });
        }
        "default" => {
            attrs.default = Some(parse_literal(raw));
        }
        "description" => {
            attrs.description = Some(unquote(raw).to_string());
        }
        "enum" => {
            match parse_literal(raw) {
                Value::Array(items) => attrs.enum_values = Some(items),
                _ => return Err(malformed(format!("enum must be a JSON array, got '{}'", raw))),
            };
        }
        "minimum" => {
            attrs.minimum = Some(
                raw.parse::<f64>()
                    .map_err(|_| malformed(format!("minimum must be a number, got '{}'", raw)))?,
            );
        }
        "maximum" => {
            attrs.maximum = Some(
                raw.parse::<f64>()
                    .map_err(|_| malformed(format!("maximum must be a number, got '{}'", raw)))?,
            );
        }
        "pattern" => {
            attrs.pattern = Some(unquote(raw).to_string());
        }
        "minLength" => {
            attrs.min_length = Some(
                raw.parse::<i64>()
                    .map_err(|_| malformed(format!("minLength must be an integer, got '{}'", raw)))?,
            );
        }
        "maxLength" => {
            attrs.max_length = Some(
                raw.parse::<i64>()
                    .map_err(|_| malformed(format!("maxLength must be an integer, got '{}'", raw)))?,
            );
        }
        "validation" => {
            let parsed: Value = serde_json::from_str(raw)
                .map_err(|e| malformed(format!("validation must be a JSON array: {}", e)))?;
            let items = match parsed {
                Value::Array(items) => items,
                _ => return Err(malformed("validation must be a JSON array".to_string())),
            };
            for item in items {
                let expression = item
                    .get("expression")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| malformed("validation entry missing 'expression'".to_string()))?
                    .to_string();
                let message = item
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                attrs.validations.push(Validation { expression, message });
            }
        }
        other => {
            return Err(malformed(format!("unknown attribute '{}'", other)));
        }
    }
    Ok(())
}

/// Parse an attribute payload: JSON when it parses, bare string otherwise
/// (`default=nginx` is shorthand for `default="nginx"`).
fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn unquote(raw: &str) -> &str {
    let r = raw.trim();
    if r.len() >= 2 && ((r.starts_with('"') && r.ends_with('"')) || (r.starts_with('\'') && r.ends_with('\''))) {
        &r[1..r.len() - 1]
    } else {
        r
    }
}

/// Split an atom on top-level `|`, respecting quotes and brackets so JSON
/// payloads like `enum=["a","b"]` or `validation=[{…}]` stay intact.
fn split_atom(src: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '[' | '{' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '|' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}
