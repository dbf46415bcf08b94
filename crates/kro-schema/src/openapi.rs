//! OpenAPI (CRD) schema emission

use crate::types::{FieldSpec, SimpleType};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool, ValidationRule, JSON,
};
use std::collections::BTreeMap;

/// Render a compiled field tree as a `JSONSchemaProps` suitable for
/// embedding in a CustomResourceDefinition version.
pub fn field_to_openapi(field: &FieldSpec) -> JSONSchemaProps {
    let mut schema = match &field.ty {
        SimpleType::String => JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
        SimpleType::Integer => JSONSchemaProps {
            type_: Some("integer".to_string()),
            ..Default::default()
        },
        SimpleType::Number => JSONSchemaProps {
            type_: Some("number".to_string()),
            ..Default::default()
        },
        SimpleType::Boolean => JSONSchemaProps {
            type_: Some("boolean".to_string()),
            ..Default::default()
        },
        SimpleType::Object(fields) => {
            let mut properties = BTreeMap::new();
            let mut required = Vec::new();
            for (name, child) in fields {
                properties.insert(name.clone(), field_to_openapi(child));
                if child.required {
                    required.push(name.clone());
                }
            }
            required.sort();
            JSONSchemaProps {
                type_: Some("object".to_string()),
                properties: Some(properties),
                required: if required.is_empty() { None } else { Some(required) },
                ..Default::default()
            }
        }
        SimpleType::Array(elem) => JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(JSONSchemaPropsOrArray::Schema(Box::new(field_to_openapi(
                elem,
            )))),
            ..Default::default()
        },
        SimpleType::Map(value) => JSONSchemaProps {
            type_: Some("object".to_string()),
            additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(
                field_to_openapi(value),
            ))),
            ..Default::default()
        },
        SimpleType::Any => JSONSchemaProps {
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..Default::default()
        },
    };

    schema.description = field.description.clone();
    schema.default = field.default.clone().map(JSON);
    schema.enum_ = field
        .enum_values
        .clone()
        .map(|values| values.into_iter().map(JSON).collect());
    schema.minimum = field.minimum;
    schema.maximum = field.maximum;
    schema.pattern = field.pattern.clone();
    schema.min_length = field.min_length;
    schema.max_length = field.max_length;

    if !field.validations.is_empty() {
        schema.x_kubernetes_validations = Some(
            field
                .validations
                .iter()
                .map(|v| ValidationRule {
                    rule: v.expression.clone(),
                    message: v.message.clone(),
                    ..Default::default()
                })
                .collect(),
        );
    }

    schema
}

/// Render an inferred expression type as an OpenAPI schema; used for the
/// status subresource, whose shape is derived rather than declared.
pub fn expr_type_to_openapi(ty: &kro_expr::Type) -> JSONSchemaProps {
    match ty {
        kro_expr::Type::String => JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
        kro_expr::Type::Int => JSONSchemaProps {
            type_: Some("integer".to_string()),
            ..Default::default()
        },
        kro_expr::Type::Double => JSONSchemaProps {
            type_: Some("number".to_string()),
            ..Default::default()
        },
        kro_expr::Type::Bool => JSONSchemaProps {
            type_: Some("boolean".to_string()),
            ..Default::default()
        },
        kro_expr::Type::List(elem) => JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(JSONSchemaPropsOrArray::Schema(Box::new(
                expr_type_to_openapi(elem),
            ))),
            ..Default::default()
        },
        kro_expr::Type::Map(_, value) => JSONSchemaProps {
            type_: Some("object".to_string()),
            additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(
                expr_type_to_openapi(value),
            ))),
            ..Default::default()
        },
        kro_expr::Type::Object(fields) => JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(
                fields
                    .iter()
                    .map(|(name, t)| (name.clone(), expr_type_to_openapi(t)))
                    .collect(),
            ),
            ..Default::default()
        },
        // null or unknown: accept anything
        kro_expr::Type::Null | kro_expr::Type::Dyn => JSONSchemaProps {
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use serde_json::{json, Value};

    #[test]
    fn emits_types_constraints_and_defaults() {
        let spec = json!({
            "name": "string | required=true | minLength=1 | maxLength=63",
            "replicas": "integer | default=3 | minimum=1 | maximum=100",
            "tier": "string | enum=[\"dev\",\"prod\"] | default=dev"
        });
        let compiled = compile(&spec, &Value::Null, &[]).unwrap();
        let schema = &compiled.openapi;

        assert_eq!(schema.type_.as_deref(), Some("object"));
        assert_eq!(schema.required, Some(vec!["name".to_string()]));

        let props = schema.properties.as_ref().unwrap();
        let name = &props["name"];
        assert_eq!(name.min_length, Some(1));
        assert_eq!(name.max_length, Some(63));

        let replicas = &props["replicas"];
        assert_eq!(replicas.type_.as_deref(), Some("integer"));
        assert_eq!(replicas.minimum, Some(1.0));
        assert_eq!(replicas.default, Some(JSON(json!(3))));

        let tier = &props["tier"];
        assert_eq!(
            tier.enum_,
            Some(vec![JSON(json!("dev")), JSON(json!("prod"))])
        );
    }

    #[test]
    fn field_validations_become_cel_rules() {
        let spec = json!({
            "name": r#"string | validation=[{"expression": "self != 'kube-system'", "message": "reserved"}]"#
        });
        let compiled = compile(&spec, &Value::Null, &[]).unwrap();
        let props = compiled.openapi.properties.as_ref().unwrap();
        let rules = props["name"].x_kubernetes_validations.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule, "self != 'kube-system'");
        assert_eq!(rules[0].message.as_deref(), Some("reserved"));
    }

    #[test]
    fn maps_use_additional_properties() {
        let spec = json!({"labels": "map[string]string"});
        let compiled = compile(&spec, &Value::Null, &[]).unwrap();
        let props = compiled.openapi.properties.as_ref().unwrap();
        assert!(props["labels"].additional_properties.is_some());
        assert_eq!(props["labels"].type_.as_deref(), Some("object"));
    }

    #[test]
    fn inferred_status_types_render() {
        let schema = expr_type_to_openapi(&kro_expr::Type::Int);
        assert_eq!(schema.type_.as_deref(), Some("integer"));

        let dyn_schema = expr_type_to_openapi(&kro_expr::Type::Dyn);
        assert_eq!(dyn_schema.x_kubernetes_preserve_unknown_fields, Some(true));
        assert_eq!(dyn_schema.type_, None);
    }
}
