//! Expression evaluation over live JSON values

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, Result};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Top-level value bindings for evaluation: `schema` plus one root per
/// materialized resource.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    roots: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.roots.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.roots.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roots.contains_key(name)
    }
}

/// Evaluate an expression against bound values.
pub fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Number((*i).into())),
        Expr::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| ExprError::Eval("non-finite float".to_string())),
        Expr::Str(s) => Ok(Value::String(s.clone())),

        Expr::Ident(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::MissingData(name.clone())),

        Expr::Member { base, field } => {
            let base_val = eval(base, bindings)?;
            match base_val {
                Value::Object(map) => map
                    .get(field)
                    .cloned()
                    .ok_or_else(|| ExprError::MissingData(path_of(expr))),
                Value::Null => Err(ExprError::MissingData(path_of(expr))),
                other => Err(ExprError::Eval(format!(
                    "cannot access field '{}' on {}",
                    field,
                    kind_of(&other)
                ))),
            }
        }

        Expr::Index { base, index } => {
            let base_val = eval(base, bindings)?;
            let index_val = eval(index, bindings)?;
            match (&base_val, &index_val) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n
                        .as_i64()
                        .ok_or_else(|| ExprError::Eval("list index must be an integer".into()))?;
                    if i < 0 || i as usize >= items.len() {
                        return Err(ExprError::MissingData(path_of(expr)));
                    }
                    Ok(items[i as usize].clone())
                }
                (Value::Object(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ExprError::MissingData(path_of(expr))),
                (base, index) => Err(ExprError::Eval(format!(
                    "cannot index {} with {}",
                    kind_of(base),
                    kind_of(index)
                ))),
            }
        }

        Expr::Unary { op, expr } => {
            let v = eval(expr, bindings)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(ExprError::Eval(format!(
                        "'!' requires bool, got {}",
                        kind_of(&other)
                    ))),
                },
                UnaryOp::Neg => match v {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::Number((-i).into()))
                        } else {
                            let f = n.as_f64().unwrap_or(f64::NAN);
                            Number::from_f64(-f)
                                .map(Value::Number)
                                .ok_or_else(|| ExprError::Eval("non-finite float".into()))
                        }
                    }
                    other => Err(ExprError::Eval(format!(
                        "'-' requires a number, got {}",
                        kind_of(&other)
                    ))),
                },
            }
        }

        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, bindings),

        Expr::Ternary { cond, then, otherwise } => {
            match eval(cond, bindings)? {
                Value::Bool(true) => eval(then, bindings),
                Value::Bool(false) => eval(otherwise, bindings),
                other => Err(ExprError::Eval(format!(
                    "ternary condition must be bool, got {}",
                    kind_of(&other)
                ))),
            }
        }

        Expr::Call { target, name, args } => eval_call(target.as_deref(), name, args, bindings),

        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, bindings)?);
            }
            Ok(Value::Array(out))
        }

        Expr::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match eval(k, bindings)? {
                    Value::String(s) => s,
                    other => {
                        return Err(ExprError::Eval(format!(
                            "map keys must be strings, got {}",
                            kind_of(&other)
                        )))
                    }
                };
                map.insert(key, eval(v, bindings)?);
            }
            Ok(Value::Object(map))
        }
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, bindings: &Bindings) -> Result<Value> {
    use BinaryOp::*;

    // short-circuit forms first
    if matches!(op, And | Or) {
        let l = match eval(lhs, bindings)? {
            Value::Bool(b) => b,
            other => {
                return Err(ExprError::Eval(format!(
                    "'{}' requires bool operands, got {}",
                    op.symbol(),
                    kind_of(&other)
                )))
            }
        };
        if (op == And && !l) || (op == Or && l) {
            return Ok(Value::Bool(l));
        }
        return match eval(rhs, bindings)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(ExprError::Eval(format!(
                "'{}' requires bool operands, got {}",
                op.symbol(),
                kind_of(&other)
            ))),
        };
    }

    let l = eval(lhs, bindings)?;
    let r = eval(rhs, bindings)?;

    match op {
        Eq => Ok(Value::Bool(values_equal(&l, &r))),
        Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        Lt | Le | Gt | Ge => {
            let ord = compare_values(&l, &r)?;
            let b = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(b))
        }
        Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => numeric_op(op, &l, &r),
        },
        Sub | Mul | Div | Rem => numeric_op(op, &l, &r),
        And | Or => unreachable!("handled above"),
    }
}

fn numeric_op(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    let (ln, rn) = match (l, r) {
        (Value::Number(a), Value::Number(b)) => (a, b),
        _ => {
            return Err(ExprError::Eval(format!(
                "'{}' requires numeric operands, got {} and {}",
                op.symbol(),
                kind_of(l),
                kind_of(r)
            )))
        }
    };

    // integer arithmetic when both sides are integers, float otherwise
    if let (Some(a), Some(b)) = (ln.as_i64(), rn.as_i64()) {
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(ExprError::Eval("division by zero".into()));
                }
                a.checked_div(b)
            }
            BinaryOp::Rem => {
                if b == 0 {
                    return Err(ExprError::Eval("division by zero".into()));
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return out
            .map(|v| Value::Number(v.into()))
            .ok_or_else(|| ExprError::Eval("integer overflow".into()));
    }

    let a = ln.as_f64().unwrap_or(f64::NAN);
    let b = rn.as_f64().unwrap_or(f64::NAN);
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(ExprError::Eval("division by zero".into()));
            }
            a / b
        }
        BinaryOp::Rem => a % b,
        _ => unreachable!(),
    };
    Number::from_f64(out)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Eval("non-finite float result".into()))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                x == y
            } else {
                a.as_f64() == b.as_f64()
            }
        }
        (a, b) => a == b,
    }
}

fn compare_values(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                Ok(x.cmp(&y))
            } else {
                let x = a.as_f64().unwrap_or(f64::NAN);
                let y = b.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y)
                    .ok_or_else(|| ExprError::Eval("cannot order NaN".into()))
            }
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Eval(format!(
            "cannot order {} and {}",
            kind_of(l),
            kind_of(r)
        ))),
    }
}

fn eval_call(
    target: Option<&Expr>,
    name: &str,
    args: &[Expr],
    bindings: &Bindings,
) -> Result<Value> {
    let mut all: Vec<&Expr> = Vec::with_capacity(args.len() + 1);
    if let Some(t) = target {
        all.push(t);
    }
    all.extend(args.iter());

    let expected = match name {
        "has" | "size" | "string" | "int" | "lower" | "upper" | "trim" => 1,
        "startsWith" | "endsWith" | "contains" | "matches" | "default" | "join" => 2,
        other => return Err(ExprError::Eval(format!("unknown function '{}'", other))),
    };
    if all.len() != expected {
        return Err(ExprError::Eval(format!(
            "{}() expects {} argument(s), got {}",
            name,
            expected,
            all.len()
        )));
    }

    match name {
        // presence check: absence is an answer, not an error
        "has" => match eval(all[0], bindings) {
            Ok(Value::Null) => Ok(Value::Bool(false)),
            Ok(_) => Ok(Value::Bool(true)),
            Err(e) if e.is_missing_data() => Ok(Value::Bool(false)),
            Err(e) => Err(e),
        },
        // null and absent both fall through to the fallback
        "default" => match eval(all[0], bindings) {
            Ok(Value::Null) => eval(all[1], bindings),
            Ok(v) => Ok(v),
            Err(e) if e.is_missing_data() => eval(all[1], bindings),
            Err(e) => Err(e),
        },
        "size" => match eval(all[0], bindings)? {
            Value::String(s) => Ok(Value::Number((s.chars().count() as i64).into())),
            Value::Array(items) => Ok(Value::Number((items.len() as i64).into())),
            Value::Object(map) => Ok(Value::Number((map.len() as i64).into())),
            other => Err(ExprError::Eval(format!(
                "size() requires a string, list, or map, got {}",
                kind_of(&other)
            ))),
        },
        "startsWith" | "endsWith" | "contains" | "matches" => {
            let subject = string_arg(name, all[0], bindings)?;
            let pattern = string_arg(name, all[1], bindings)?;
            let out = match name {
                "startsWith" => subject.starts_with(&pattern),
                "endsWith" => subject.ends_with(&pattern),
                "contains" => subject.contains(&pattern),
                "matches" => regex::Regex::new(&pattern)
                    .map_err(|e| ExprError::Eval(format!("invalid pattern: {}", e)))?
                    .is_match(&subject),
                _ => unreachable!(),
            };
            Ok(Value::Bool(out))
        }
        "string" => match eval(all[0], bindings)? {
            Value::String(s) => Ok(Value::String(s)),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(ExprError::Eval(format!(
                "string() cannot convert {}",
                kind_of(&other)
            ))),
        },
        "int" => match eval(all[0], bindings)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| ExprError::Eval("int() overflow".into())),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|_| ExprError::Eval(format!("int() cannot parse '{}'", s))),
            Value::Bool(b) => Ok(Value::Number(i64::from(b).into())),
            other => Err(ExprError::Eval(format!(
                "int() cannot convert {}",
                kind_of(&other)
            ))),
        },
        "join" => {
            let list = match eval(all[0], bindings)? {
                Value::Array(items) => items,
                other => {
                    return Err(ExprError::Eval(format!(
                        "join() requires a list, got {}",
                        kind_of(&other)
                    )))
                }
            };
            let sep = string_arg(name, all[1], bindings)?;
            let mut parts = Vec::with_capacity(list.len());
            for item in list {
                match item {
                    Value::String(s) => parts.push(s),
                    other => {
                        return Err(ExprError::Eval(format!(
                            "join() requires string elements, got {}",
                            kind_of(&other)
                        )))
                    }
                }
            }
            Ok(Value::String(parts.join(&sep)))
        }
        "lower" => Ok(Value::String(string_arg(name, all[0], bindings)?.to_lowercase())),
        "upper" => Ok(Value::String(string_arg(name, all[0], bindings)?.to_uppercase())),
        "trim" => Ok(Value::String(string_arg(name, all[0], bindings)?.trim().to_string())),
        other => Err(ExprError::Eval(format!("unknown function '{}'", other))),
    }
}

fn string_arg(func: &str, expr: &Expr, bindings: &Bindings) -> Result<String> {
    match eval(expr, bindings)? {
        Value::String(s) => Ok(s),
        other => Err(ExprError::Eval(format!(
            "{}() requires a string, got {}",
            func,
            kind_of(&other)
        ))),
    }
}

/// Best-effort dotted rendering of a member/index chain, for error messages.
pub(crate) fn path_of(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member { base, field } => format!("{}.{}", path_of(base), field),
        Expr::Index { base, index } => match index.as_ref() {
            Expr::Int(i) => format!("{}[{}]", path_of(base), i),
            Expr::Str(s) => format!("{}['{}']", path_of(base), s),
            _ => format!("{}[..]", path_of(base)),
        },
        _ => "<expression>".to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.bind(
            "schema",
            json!({
                "name": "web",
                "replicas": 3,
                "ingress": {"enabled": false},
                "tags": ["a", "b"],
            }),
        );
        b.bind(
            "deployment",
            json!({
                "metadata": {"name": "web"},
                "status": {"availableReplicas": 2},
            }),
        );
        b
    }

    fn eval_src(src: &str) -> Result<Value> {
        eval(&parse(src).unwrap(), &bindings())
    }

    #[test]
    fn member_and_arithmetic() {
        assert_eq!(eval_src("schema.replicas + 1").unwrap(), json!(4));
        assert_eq!(
            eval_src("deployment.status.availableReplicas").unwrap(),
            json!(2)
        );
        assert_eq!(eval_src("schema.replicas / 2").unwrap(), json!(1));
        assert_eq!(eval_src("7 % 3").unwrap(), json!(1));
    }

    #[test]
    fn missing_field_is_missing_data() {
        let err = eval_src("deployment.status.readyReplicas").unwrap_err();
        assert!(err.is_missing_data());
        let err = eval_src("service.spec.clusterIP").unwrap_err();
        assert!(err.is_missing_data());
    }

    #[test]
    fn string_concat_and_comparison() {
        assert_eq!(eval_src("schema.name + '-svc'").unwrap(), json!("web-svc"));
        assert_eq!(eval_src("schema.name == 'web'").unwrap(), json!(true));
        assert_eq!(eval_src("'a' < 'b'").unwrap(), json!(true));
    }

    #[test]
    fn short_circuit_skips_missing_data() {
        // rhs references an unbound root; && must not evaluate it
        assert_eq!(
            eval_src("false && service.spec.ready").unwrap(),
            json!(false)
        );
        assert_eq!(eval_src("true || service.spec.ready").unwrap(), json!(true));
    }

    #[test]
    fn has_and_default() {
        assert_eq!(eval_src("has(schema.ingress.enabled)").unwrap(), json!(true));
        assert_eq!(eval_src("has(schema.ingress.host)").unwrap(), json!(false));
        assert_eq!(eval_src("default(schema.missing, 'x')").unwrap(), json!("x"));
        assert_eq!(eval_src("default(schema.name, 'x')").unwrap(), json!("web"));
    }

    #[test]
    fn conversions_and_string_functions() {
        assert_eq!(eval_src("string(schema.replicas)").unwrap(), json!("3"));
        assert_eq!(eval_src("int('42')").unwrap(), json!(42));
        assert_eq!(eval_src("join(schema.tags, ',')").unwrap(), json!("a,b"));
        assert_eq!(eval_src("size(schema.tags)").unwrap(), json!(2));
        assert_eq!(eval_src("upper(schema.name)").unwrap(), json!("WEB"));
        assert_eq!(eval_src("schema.name.matches('^w.b$')").unwrap(), json!(true));
    }

    #[test]
    fn division_by_zero() {
        assert!(!eval_src("1 / 0").unwrap_err().is_missing_data());
    }

    #[test]
    fn ternary() {
        assert_eq!(
            eval_src("schema.ingress.enabled ? 'on' : 'off'").unwrap(),
            json!("off")
        );
    }

    #[test]
    fn index_out_of_range_is_missing() {
        assert!(eval_src("schema.tags[9]").unwrap_err().is_missing_data());
        assert_eq!(eval_src("schema.tags[1]").unwrap(), json!("b"));
    }

    #[test]
    fn equality_across_number_reprs() {
        assert_eq!(eval_src("1 == 1.0").unwrap(), json!(true));
        assert_eq!(eval_src("1.5 + 1").unwrap(), json!(2.5));
    }
}
