//! Cluster-backed schema resolution for the analyzer
//!
//! Reference type checking wants the schema of each referent kind. CRDs
//! publish theirs in `spec.versions[].schema.openAPIV3Schema`; builtins
//! would need the full OpenAPI discovery document, so they resolve to an
//! open type instead. Because the analyzer's `SchemaSource` trait is
//! synchronous, the RGD controller pre-fetches the types of every GVK the
//! graph mentions into a `StaticSchemaSource` before analysis runs.

use crate::error::Result;
use crate::instance::parse_gvk;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kro_expr::Type;
use kro_graph::{object_meta_type, StaticSchemaSource};
use kube::api::{Api, ListParams};
use kube::core::GroupVersionKind;
use kube::Client;
use std::collections::BTreeSet;
use tracing::debug;

/// Pre-fetch referent types for every GVK the resources mention.
pub async fn build_schema_source(
    client: &Client,
    resources: &[kro_graph::ResourceDefinition],
) -> Result<StaticSchemaSource> {
    let mut gvks: BTreeSet<(String, String)> = BTreeSet::new();
    for resource in resources {
        if let Some(template) = &resource.template {
            if let (Some(av), Some(kind)) = (
                template.get("apiVersion").and_then(|v| v.as_str()),
                template.get("kind").and_then(|v| v.as_str()),
            ) {
                gvks.insert((av.to_string(), kind.to_string()));
            }
        }
        if let Some(ext) = &resource.external_ref {
            gvks.insert((ext.api_version.clone(), ext.kind.clone()));
        }
    }

    let mut source = StaticSchemaSource::new();
    for (api_version, kind) in gvks {
        let gvk = parse_gvk(&api_version, &kind);
        if gvk.group.is_empty() {
            // builtins carry no CRD; leave them open
            continue;
        }
        if let Some(ty) = fetch_crd_type(client, &gvk).await? {
            debug!(group = %gvk.group, kind = %gvk.kind, "resolved CRD schema for analysis");
            source.insert(&api_version, &kind, ty);
        }
    }
    Ok(source)
}

/// Look up the CRD serving a GVK and convert its served version's schema.
async fn fetch_crd_type(client: &Client, gvk: &GroupVersionKind) -> Result<Option<Type>> {
    let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client.clone());
    let crds = api.list(&ListParams::default()).await?;
    for crd in crds {
        if crd.spec.group != gvk.group || crd.spec.names.kind != gvk.kind {
            continue;
        }
        let version = crd
            .spec
            .versions
            .iter()
            .find(|v| v.name == gvk.version)
            .or_else(|| crd.spec.versions.iter().find(|v| v.served));
        let schema = version
            .and_then(|v| v.schema.as_ref())
            .and_then(|s| s.open_api_v3_schema.as_ref());
        return Ok(schema.map(crd_schema_to_type));
    }
    Ok(None)
}

/// Convert a CRD's OpenAPI schema into the expression type lattice,
/// injecting the standard `metadata` shape.
pub fn crd_schema_to_type(schema: &apiextv1::JSONSchemaProps) -> Type {
    match json_schema_to_type(schema) {
        Type::Object(mut fields) => {
            fields.insert("apiVersion".to_string(), Type::String);
            fields.insert("kind".to_string(), Type::String);
            fields.insert("metadata".to_string(), object_meta_type());
            Type::Object(fields)
        }
        other => other,
    }
}

fn json_schema_to_type(schema: &apiextv1::JSONSchemaProps) -> Type {
    if schema.x_kubernetes_preserve_unknown_fields == Some(true) {
        return Type::Dyn;
    }
    match schema.type_.as_deref() {
        Some("string") => Type::String,
        Some("integer") => Type::Int,
        Some("number") => Type::Double,
        Some("boolean") => Type::Bool,
        Some("array") => {
            let elem = match &schema.items {
                Some(apiextv1::JSONSchemaPropsOrArray::Schema(inner)) => {
                    json_schema_to_type(inner)
                }
                _ => Type::Dyn,
            };
            Type::List(Box::new(elem))
        }
        Some("object") => {
            if let Some(props) = &schema.properties {
                Type::Object(
                    props
                        .iter()
                        .map(|(name, child)| (name.clone(), json_schema_to_type(child)))
                        .collect(),
                )
            } else if let Some(additional) = &schema.additional_properties {
                let value = match additional {
                    apiextv1::JSONSchemaPropsOrBool::Schema(inner) => json_schema_to_type(inner.as_ref()),
                    apiextv1::JSONSchemaPropsOrBool::Bool(_) => Type::Dyn,
                };
                Type::Map(Box::new(Type::String), Box::new(value))
            } else {
                Type::Dyn
            }
        }
        _ => Type::Dyn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: serde_json::Value) -> apiextv1::JSONSchemaProps {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn converts_scalar_and_nested_schemas() {
        let schema = props(json!({
            "type": "object",
            "properties": {
                "spec": {
                    "type": "object",
                    "properties": {
                        "defaultNamespace": {"type": "string"},
                        "quota": {"type": "integer"}
                    }
                }
            }
        }));
        let ty = crd_schema_to_type(&schema);
        let Type::Object(fields) = ty else { panic!("expected object") };
        assert_eq!(fields.get("kind"), Some(&Type::String));
        let Some(Type::Object(spec)) = fields.get("spec") else {
            panic!("expected spec object")
        };
        assert_eq!(spec.get("defaultNamespace"), Some(&Type::String));
        assert_eq!(spec.get("quota"), Some(&Type::Int));
    }

    #[test]
    fn preserve_unknown_is_dyn() {
        let schema = props(json!({
            "type": "object",
            "properties": {"spec": {"x-kubernetes-preserve-unknown-fields": true}}
        }));
        let Type::Object(fields) = crd_schema_to_type(&schema) else {
            panic!("expected object")
        };
        assert_eq!(fields.get("spec"), Some(&Type::Dyn));
    }

    #[test]
    fn arrays_and_maps() {
        let schema = props(json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}},
                "labels": {"type": "object", "additionalProperties": {"type": "string"}}
            }
        }));
        let Type::Object(fields) = crd_schema_to_type(&schema) else {
            panic!("expected object")
        };
        assert_eq!(
            fields.get("tags"),
            Some(&Type::List(Box::new(Type::String)))
        );
        assert_eq!(
            fields.get("labels"),
            Some(&Type::Map(Box::new(Type::String), Box::new(Type::String)))
        );
    }
}
