//! Static type checking against a typing environment

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, Result};
use crate::types::{Type, TypeEnv};

/// Type-check an expression, returning its result type.
pub fn check(expr: &Expr, env: &TypeEnv) -> Result<Type> {
    match expr {
        Expr::Null => Ok(Type::Null),
        Expr::Bool(_) => Ok(Type::Bool),
        Expr::Int(_) => Ok(Type::Int),
        Expr::Float(_) => Ok(Type::Double),
        Expr::Str(_) => Ok(Type::String),

        Expr::Ident(name) => env
            .lookup(name)
            .cloned()
            .ok_or_else(|| ExprError::Type(format!("unknown identifier '{}'", name))),

        Expr::Member { base, field } => {
            let base_ty = check(base, env)?;
            member_type(&base_ty, field)
        }

        Expr::Index { base, index } => {
            let base_ty = check(base, env)?;
            let index_ty = check(index, env)?;
            match base_ty {
                Type::List(elem) => {
                    if !index_ty.assignable_to(&Type::Int) {
                        return Err(ExprError::Type(format!(
                            "list index must be int, got {}",
                            index_ty
                        )));
                    }
                    Ok(*elem)
                }
                Type::Map(key, value) => {
                    if !index_ty.assignable_to(&key) {
                        return Err(ExprError::Type(format!(
                            "map key must be {}, got {}",
                            key, index_ty
                        )));
                    }
                    Ok(*value)
                }
                Type::Object(fields) => match &**index {
                    Expr::Str(name) => fields.get(name).cloned().ok_or_else(|| {
                        ExprError::Type(format!("object has no field '{}'", name))
                    }),
                    _ => Ok(Type::Dyn),
                },
                Type::Dyn => Ok(Type::Dyn),
                other => Err(ExprError::Type(format!("cannot index into {}", other))),
            }
        }

        Expr::Unary { op, expr } => {
            let ty = check(expr, env)?;
            match op {
                UnaryOp::Not => {
                    if ty.assignable_to(&Type::Bool) {
                        Ok(Type::Bool)
                    } else {
                        Err(ExprError::Type(format!("'!' requires bool, got {}", ty)))
                    }
                }
                UnaryOp::Neg => {
                    if ty.is_numeric() {
                        Ok(if ty == Type::Dyn { Type::Dyn } else { ty })
                    } else {
                        Err(ExprError::Type(format!("'-' requires a number, got {}", ty)))
                    }
                }
            }
        }

        Expr::Binary { op, lhs, rhs } => {
            let lt = check(lhs, env)?;
            let rt = check(rhs, env)?;
            check_binary(*op, &lt, &rt)
        }

        Expr::Ternary { cond, then, otherwise } => {
            let ct = check(cond, env)?;
            if !ct.assignable_to(&Type::Bool) {
                return Err(ExprError::Type(format!(
                    "ternary condition must be bool, got {}",
                    ct
                )));
            }
            let tt = check(then, env)?;
            let ot = check(otherwise, env)?;
            Ok(tt.unify(&ot))
        }

        Expr::Call { target, name, args } => check_call(target.as_deref(), name, args, env),

        Expr::List(items) => {
            let mut elem = Type::Dyn;
            for (i, item) in items.iter().enumerate() {
                let ty = check(item, env)?;
                elem = if i == 0 { ty } else { elem.unify(&ty) };
            }
            Ok(Type::List(Box::new(elem)))
        }

        Expr::Map(entries) => {
            let mut key = Type::Dyn;
            let mut value = Type::Dyn;
            for (i, (k, v)) in entries.iter().enumerate() {
                let kt = check(k, env)?;
                let vt = check(v, env)?;
                if i == 0 {
                    key = kt;
                    value = vt;
                } else {
                    key = key.unify(&kt);
                    value = value.unify(&vt);
                }
            }
            Ok(Type::Map(Box::new(key), Box::new(value)))
        }
    }
}

fn member_type(base: &Type, field: &str) -> Result<Type> {
    match base {
        Type::Object(fields) => fields
            .get(field)
            .cloned()
            .ok_or_else(|| ExprError::Type(format!("no such field '{}'", field))),
        Type::Map(key, value) => {
            if !Type::String.assignable_to(key) {
                return Err(ExprError::Type(format!(
                    "cannot access field '{}' on map keyed by {}",
                    field, key
                )));
            }
            Ok((**value).clone())
        }
        Type::Dyn => Ok(Type::Dyn),
        other => Err(ExprError::Type(format!(
            "cannot access field '{}' on {}",
            field, other
        ))),
    }
}

fn check_binary(op: BinaryOp, lt: &Type, rt: &Type) -> Result<Type> {
    use BinaryOp::*;
    match op {
        And | Or => {
            if lt.assignable_to(&Type::Bool) && rt.assignable_to(&Type::Bool) {
                Ok(Type::Bool)
            } else {
                Err(ExprError::Type(format!(
                    "'{}' requires bool operands, got {} and {}",
                    op.symbol(),
                    lt,
                    rt
                )))
            }
        }
        Eq | Ne => {
            if lt.assignable_to(rt) || rt.assignable_to(lt) || *lt == Type::Null || *rt == Type::Null {
                Ok(Type::Bool)
            } else {
                Err(ExprError::Type(format!(
                    "cannot compare {} and {}",
                    lt, rt
                )))
            }
        }
        Lt | Le | Gt | Ge => {
            let ordered = (lt.is_numeric() && rt.is_numeric())
                || (lt.assignable_to(&Type::String) && rt.assignable_to(&Type::String));
            if ordered {
                Ok(Type::Bool)
            } else {
                Err(ExprError::Type(format!(
                    "'{}' requires two numbers or two strings, got {} and {}",
                    op.symbol(),
                    lt,
                    rt
                )))
            }
        }
        Add => {
            if lt.is_numeric() && rt.is_numeric() {
                Ok(lt.unify(rt))
            } else if lt.assignable_to(&Type::String) && rt.assignable_to(&Type::String) {
                Ok(Type::String)
            } else if matches!(lt, Type::List(_)) && matches!(rt, Type::List(_)) {
                Ok(lt.unify(rt))
            } else {
                Err(ExprError::Type(format!(
                    "'+' requires numbers, strings, or lists, got {} and {}",
                    lt, rt
                )))
            }
        }
        Sub | Mul | Div | Rem => {
            if lt.is_numeric() && rt.is_numeric() {
                Ok(lt.unify(rt))
            } else {
                Err(ExprError::Type(format!(
                    "'{}' requires numeric operands, got {} and {}",
                    op.symbol(),
                    lt,
                    rt
                )))
            }
        }
    }
}

/// Whitelisted functions. Method form normalizes the receiver into the
/// first argument: `x.size()` == `size(x)`.
fn check_call(target: Option<&Expr>, name: &str, args: &[Expr], env: &TypeEnv) -> Result<Type> {
    let mut all: Vec<&Expr> = Vec::with_capacity(args.len() + 1);
    if let Some(t) = target {
        all.push(t);
    }
    all.extend(args.iter());

    let arity = |n: usize| -> Result<()> {
        if all.len() == n {
            Ok(())
        } else {
            Err(ExprError::Type(format!(
                "{}() expects {} argument(s), got {}",
                name,
                n,
                all.len()
            )))
        }
    };

    match name {
        "has" => {
            arity(1)?;
            // has() inspects presence, so its argument must be a member path;
            // the path itself may be absent at runtime, but must still name a
            // field that could exist under the environment.
            match all[0] {
                Expr::Member { .. } | Expr::Index { .. } => {
                    check(all[0], env)?;
                    Ok(Type::Bool)
                }
                _ => Err(ExprError::Type(
                    "has() requires a field selection argument".to_string(),
                )),
            }
        }
        "size" => {
            arity(1)?;
            let ty = check(all[0], env)?;
            match ty {
                Type::String | Type::List(_) | Type::Map(_, _) | Type::Object(_) | Type::Dyn => {
                    Ok(Type::Int)
                }
                other => Err(ExprError::Type(format!(
                    "size() requires a string, list, or map, got {}",
                    other
                ))),
            }
        }
        "startsWith" | "endsWith" | "contains" | "matches" => {
            arity(2)?;
            for arg in &all {
                let ty = check(arg, env)?;
                if !ty.assignable_to(&Type::String) {
                    return Err(ExprError::Type(format!(
                        "{}() requires string arguments, got {}",
                        name, ty
                    )));
                }
            }
            Ok(Type::Bool)
        }
        "default" => {
            arity(2)?;
            let a = check(all[0], env)?;
            let b = check(all[1], env)?;
            Ok(a.unify(&b))
        }
        "string" => {
            arity(1)?;
            let ty = check(all[0], env)?;
            match ty {
                Type::String | Type::Int | Type::Double | Type::Bool | Type::Dyn => Ok(Type::String),
                other => Err(ExprError::Type(format!(
                    "string() cannot convert {}",
                    other
                ))),
            }
        }
        "int" => {
            arity(1)?;
            let ty = check(all[0], env)?;
            match ty {
                Type::String | Type::Int | Type::Double | Type::Bool | Type::Dyn => Ok(Type::Int),
                other => Err(ExprError::Type(format!("int() cannot convert {}", other))),
            }
        }
        "join" => {
            arity(2)?;
            let list = check(all[0], env)?;
            let sep = check(all[1], env)?;
            let elem_ok = match &list {
                Type::List(elem) => elem.assignable_to(&Type::String),
                Type::Dyn => true,
                _ => false,
            };
            if !elem_ok {
                return Err(ExprError::Type(format!(
                    "join() requires a list of strings, got {}",
                    list
                )));
            }
            if !sep.assignable_to(&Type::String) {
                return Err(ExprError::Type(format!(
                    "join() separator must be a string, got {}",
                    sep
                )));
            }
            Ok(Type::String)
        }
        "lower" | "upper" | "trim" => {
            arity(1)?;
            let ty = check(all[0], env)?;
            if ty.assignable_to(&Type::String) {
                Ok(Type::String)
            } else {
                Err(ExprError::Type(format!(
                    "{}() requires a string, got {}",
                    name, ty
                )))
            }
        }
        other => Err(ExprError::Type(format!("unknown function '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn env() -> TypeEnv {
        let mut env = TypeEnv::new();
        env.bind(
            "schema",
            Type::object([
                ("name".to_string(), Type::String),
                ("replicas".to_string(), Type::Int),
                (
                    "ingress".to_string(),
                    Type::object([("enabled".to_string(), Type::Bool)]),
                ),
                ("tags".to_string(), Type::List(Box::new(Type::String))),
            ]),
        );
        env.bind("deployment", Type::Dyn);
        env
    }

    fn check_src(src: &str) -> Result<Type> {
        check(&parse(src).unwrap(), &env())
    }

    #[test]
    fn member_access_types() {
        assert_eq!(check_src("schema.name").unwrap(), Type::String);
        assert_eq!(check_src("schema.replicas").unwrap(), Type::Int);
        assert_eq!(check_src("schema.ingress.enabled").unwrap(), Type::Bool);
        assert_eq!(check_src("deployment.status.anything").unwrap(), Type::Dyn);
    }

    #[test]
    fn unknown_field_is_an_error() {
        assert!(check_src("schema.nope").is_err());
        assert!(check_src("missing.name").is_err());
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(check_src("schema.replicas + 1").unwrap(), Type::Int);
        assert_eq!(check_src("schema.replicas / 2.0").unwrap(), Type::Double);
        assert_eq!(check_src("schema.replicas >= 3").unwrap(), Type::Bool);
        assert!(check_src("schema.name + 1").is_err());
        assert!(check_src("schema.name < 1").is_err());
    }

    #[test]
    fn logical_operators_require_bool() {
        assert_eq!(
            check_src("schema.ingress.enabled && schema.replicas > 0").unwrap(),
            Type::Bool
        );
        assert!(check_src("schema.name && true").is_err());
    }

    #[test]
    fn string_concat() {
        assert_eq!(check_src("schema.name + '-svc'").unwrap(), Type::String);
    }

    #[test]
    fn functions() {
        assert_eq!(check_src("has(schema.ingress.enabled)").unwrap(), Type::Bool);
        assert_eq!(check_src("size(schema.tags)").unwrap(), Type::Int);
        assert_eq!(check_src("schema.name.startsWith('web')").unwrap(), Type::Bool);
        assert_eq!(check_src("default(schema.name, 'app')").unwrap(), Type::String);
        assert_eq!(check_src("string(schema.replicas)").unwrap(), Type::String);
        assert_eq!(check_src("join(schema.tags, ',')").unwrap(), Type::String);
        assert!(check_src("frobnicate(schema.name)").is_err());
        assert!(check_src("has(schema)").is_err());
        assert!(check_src("size(schema.replicas)").is_err());
    }

    #[test]
    fn ternary_unifies_branches() {
        assert_eq!(
            check_src("schema.ingress.enabled ? 'on' : 'off'").unwrap(),
            Type::String
        );
        assert_eq!(check_src("true ? 1 : 2.0").unwrap(), Type::Double);
        assert!(check_src("schema.name ? 1 : 2").is_err());
    }

    #[test]
    fn index_typing() {
        assert_eq!(check_src("schema.tags[0]").unwrap(), Type::String);
        assert!(check_src("schema.tags['a']").is_err());
        assert!(check_src("schema.replicas[0]").is_err());
    }
}
