//! The SimpleSchema type model

use serde_json::Value;

/// A compiled SimpleSchema type.
///
/// Object fields keep their declaration order; the CRD schema and typing
/// environment derived from them are both order-stable.
#[derive(Debug, Clone, PartialEq)]
pub enum SimpleType {
    String,
    Integer,
    Number,
    Boolean,
    Object(Vec<(String, FieldSpec)>),
    Array(Box<FieldSpec>),
    /// `map[string]V`; CRD object keys are always strings
    Map(Box<FieldSpec>),
    /// Accepts any JSON value (`x-kubernetes-preserve-unknown-fields`)
    Any,
}

impl SimpleType {
    /// Human-readable name used in error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            SimpleType::String => "string",
            SimpleType::Integer => "integer",
            SimpleType::Number => "number",
            SimpleType::Boolean => "boolean",
            SimpleType::Object(_) => "object",
            SimpleType::Array(_) => "array",
            SimpleType::Map(_) => "map",
            SimpleType::Any => "any",
        }
    }

    /// Whether a JSON literal inhabits this type (used for default checks).
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (SimpleType::String, Value::String(_)) => true,
            (SimpleType::Integer, Value::Number(n)) => n.as_i64().is_some(),
            (SimpleType::Number, Value::Number(_)) => true,
            (SimpleType::Boolean, Value::Bool(_)) => true,
            (SimpleType::Array(elem), Value::Array(items)) => {
                items.iter().all(|item| elem.ty.admits(item))
            }
            (SimpleType::Map(value_spec), Value::Object(map)) => {
                map.values().all(|v| value_spec.ty.admits(v))
            }
            (SimpleType::Object(fields), Value::Object(map)) => map.iter().all(|(k, v)| {
                fields
                    .iter()
                    .find(|(name, _)| name == k)
                    .map(|(_, spec)| spec.ty.admits(v))
                    .unwrap_or(false)
            }),
            (SimpleType::Any, _) => true,
            _ => false,
        }
    }

    /// Convert to the expression engine's type lattice.
    pub fn to_expr_type(&self) -> kro_expr::Type {
        match self {
            SimpleType::String => kro_expr::Type::String,
            SimpleType::Integer => kro_expr::Type::Int,
            SimpleType::Number => kro_expr::Type::Double,
            SimpleType::Boolean => kro_expr::Type::Bool,
            SimpleType::Object(fields) => kro_expr::Type::object(
                fields
                    .iter()
                    .map(|(name, spec)| (name.clone(), spec.ty.to_expr_type())),
            ),
            SimpleType::Array(elem) => kro_expr::Type::List(Box::new(elem.ty.to_expr_type())),
            SimpleType::Map(value) => kro_expr::Type::Map(
                Box::new(kro_expr::Type::String),
                Box::new(value.ty.to_expr_type()),
            ),
            SimpleType::Any => kro_expr::Type::Dyn,
        }
    }
}

/// One field of an object type, with its attached attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldSpec {
    pub ty: SimpleType,
    pub required: bool,
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

impl Default for SimpleType {
    fn default() -> Self {
        SimpleType::Any
    }
}

impl FieldSpec {
    pub fn of(ty: SimpleType) -> Self {
        FieldSpec {
            ty,
            ..Default::default()
        }
    }
}

/// A CEL-style validation rule: expression plus user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub expression: String,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn admits_checks_shapes() {
        assert!(SimpleType::String.admits(&json!("x")));
        assert!(!SimpleType::String.admits(&json!(1)));
        assert!(SimpleType::Integer.admits(&json!(3)));
        assert!(!SimpleType::Integer.admits(&json!(3.5)));
        assert!(SimpleType::Number.admits(&json!(3.5)));
        let strings = SimpleType::Array(Box::new(FieldSpec::of(SimpleType::String)));
        assert!(strings.admits(&json!(["a", "b"])));
        assert!(!strings.admits(&json!(["a", 1])));
        assert!(SimpleType::Any.admits(&json!({"free": "form"})));
    }

    #[test]
    fn expr_type_projection() {
        let obj = SimpleType::Object(vec![
            ("name".to_string(), FieldSpec::of(SimpleType::String)),
            ("replicas".to_string(), FieldSpec::of(SimpleType::Integer)),
        ]);
        match obj.to_expr_type() {
            kro_expr::Type::Object(fields) => {
                assert_eq!(fields.get("name"), Some(&kro_expr::Type::String));
                assert_eq!(fields.get("replicas"), Some(&kro_expr::Type::Int));
            }
            other => panic!("unexpected type {:?}", other),
        }
    }
}
