//! Status schema inference and projection
//!
//! Every leaf of the RGD `status` section is a `${…}` expression. Its type
//! is not declared; once the analyzer has built the full typing environment
//! (instance spec plus every resource's emitted type), the expressions are
//! checked and their result types projected into the status subresource's
//! OpenAPI schema. At reconcile time the same parsed templates are rendered
//! against live values; fields whose data is not available yet are omitted.

use crate::error::{Result, SchemaError};
use crate::openapi::expr_type_to_openapi;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kro_expr::{Bindings, Template, Type, TypeEnv};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A status section compiled against a typing environment.
#[derive(Debug, Clone, Default)]
pub struct StatusProjection {
    fields: Vec<StatusField>,
}

#[derive(Debug, Clone)]
struct StatusField {
    /// Path below `.status`
    path: Vec<String>,
    template: Template,
    ty: Type,
}

impl StatusProjection {
    /// Compile the raw `status` section, inferring every leaf's type.
    pub fn compile(status: &Value, env: &TypeEnv) -> Result<StatusProjection> {
        let mut fields = Vec::new();
        match status {
            Value::Null => {}
            Value::Object(map) => collect(map, &mut Vec::new(), env, &mut fields)?,
            _ => {
                return Err(SchemaError::InvalidStructure {
                    path: "status".to_string(),
                    detail: "status section must be an object".to_string(),
                })
            }
        }
        Ok(StatusProjection { fields })
    }

    /// The inferred OpenAPI schema of the status subtree.
    pub fn openapi(&self) -> JSONSchemaProps {
        let mut root = Type::Object(BTreeMap::new());
        for field in &self.fields {
            insert_type(&mut root, &field.path, &field.ty);
        }
        expr_type_to_openapi(&root)
    }

    /// Render the status object against live values.
    ///
    /// A field whose expression fails because data is missing is omitted,
    /// not zeroed; any other evaluation failure is returned.
    pub fn render(&self, bindings: &Bindings) -> kro_expr::Result<Value> {
        let mut out = Map::new();
        for field in &self.fields {
            match field.template.render(bindings) {
                Ok(value) => insert_value(&mut out, &field.path, value),
                Err(e) if e.is_missing_data() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Value::Object(out))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every expression used by the status section, for dependency
    /// extraction.
    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.fields.iter().map(|f| &f.template)
    }
}

fn collect(
    map: &Map<String, Value>,
    path: &mut Vec<String>,
    env: &TypeEnv,
    out: &mut Vec<StatusField>,
) -> Result<()> {
    for (name, value) in map {
        path.push(name.clone());
        match value {
            Value::Object(inner) => collect(inner, path, env, out)?,
            Value::String(src) => {
                let dotted = path.join(".");
                let template = Template::parse(src).map_err(|e| SchemaError::MalformedValidation {
                    path: format!("status.{}", dotted),
                    detail: e.to_string(),
                })?;
                if !template.has_exprs() {
                    return Err(SchemaError::StatusLeafNotExpression {
                        path: format!("status.{}", dotted),
                    });
                }
                let ty = if template.is_whole_expr() {
                    let expr = template.exprs().next().expect("whole template has one expr");
                    kro_expr::check(expr, env).map_err(|e| SchemaError::MalformedValidation {
                        path: format!("status.{}", dotted),
                        detail: e.to_string(),
                    })?
                } else {
                    // mixed templates always concatenate to a string, but
                    // every fragment must still type-check
                    for expr in template.exprs() {
                        kro_expr::check(expr, env).map_err(|e| SchemaError::MalformedValidation {
                            path: format!("status.{}", dotted),
                            detail: e.to_string(),
                        })?;
                    }
                    Type::String
                };
                out.push(StatusField {
                    path: path.clone(),
                    template,
                    ty,
                });
            }
            _ => {
                return Err(SchemaError::StatusLeafNotExpression {
                    path: format!("status.{}", path.join(".")),
                });
            }
        }
        path.pop();
    }
    Ok(())
}

fn insert_type(root: &mut Type, path: &[String], ty: &Type) {
    let Type::Object(fields) = root else { return };
    match path {
        [] => {}
        [leaf] => {
            fields.insert(leaf.clone(), ty.clone());
        }
        [head, rest @ ..] => {
            let entry = fields
                .entry(head.clone())
                .or_insert_with(|| Type::Object(BTreeMap::new()));
            insert_type(entry, rest, ty);
        }
    }
}

fn insert_value(out: &mut Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            out.insert(leaf.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = out
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_value(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> TypeEnv {
        let mut env = TypeEnv::new();
        env.bind("schema", Type::object([("name".to_string(), Type::String)]));
        env.bind("deployment", Type::Dyn);
        env
    }

    #[test]
    fn infers_leaf_types() {
        let status = json!({
            "availableReplicas": "${deployment.status.availableReplicas}",
            "url": "http://${schema.name}.example.com"
        });
        let projection = StatusProjection::compile(&status, &env()).unwrap();
        let schema = projection.openapi();
        let props = schema.properties.unwrap();
        // dyn leaf: unconstrained; mixed template: string
        assert_eq!(
            props["availableReplicas"].x_kubernetes_preserve_unknown_fields,
            Some(true)
        );
        assert_eq!(props["url"].type_.as_deref(), Some("string"));
    }

    #[test]
    fn renders_and_omits_missing() {
        let status = json!({
            "availableReplicas": "${deployment.status.availableReplicas}",
            "name": "${schema.name}"
        });
        let projection = StatusProjection::compile(&status, &env()).unwrap();

        let mut bindings = Bindings::new();
        bindings.bind("schema", json!({"name": "web"}));
        // deployment not materialized yet: its field is omitted, not zeroed
        let rendered = projection.render(&bindings).unwrap();
        assert_eq!(rendered, json!({"name": "web"}));

        bindings.bind("deployment", json!({"status": {"availableReplicas": 2}}));
        let rendered = projection.render(&bindings).unwrap();
        assert_eq!(rendered, json!({"availableReplicas": 2, "name": "web"}));
    }

    #[test]
    fn nested_paths() {
        let status = json!({"network": {"host": "${schema.name}"}});
        let projection = StatusProjection::compile(&status, &env()).unwrap();
        let mut bindings = Bindings::new();
        bindings.bind("schema", json!({"name": "web"}));
        assert_eq!(
            projection.render(&bindings).unwrap(),
            json!({"network": {"host": "web"}})
        );
    }

    #[test]
    fn non_expression_leaf_is_rejected() {
        let status = json!({"fixed": "not an expression"});
        assert!(matches!(
            StatusProjection::compile(&status, &env()),
            Err(SchemaError::StatusLeafNotExpression { .. })
        ));
        let status = json!({"count": 3});
        assert!(matches!(
            StatusProjection::compile(&status, &env()),
            Err(SchemaError::StatusLeafNotExpression { .. })
        ));
    }

    #[test]
    fn ill_typed_status_expression_is_rejected() {
        let status = json!({"bad": "${schema.name + 1}"});
        assert!(StatusProjection::compile(&status, &env()).is_err());
    }
}
