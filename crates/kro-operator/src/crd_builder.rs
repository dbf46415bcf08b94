//! CRD synthesis for accepted RGDs
//!
//! Builds the CustomResourceDefinition for an RGD's instance API: spec
//! schema from the SimpleSchema compiler, status schema inferred by the
//! analyzer plus the kro-injected `state`/`conditions` fields, printer
//! columns, and an always-on status subresource.

use crate::crd::{PrinterColumn, ResourceGraphDefinition};
use crate::plan::RgdPlan;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const RGD_LABEL: &str = "kro.run/resource-graph-definition";

/// Naive English pluralization, adequate for Kubernetes kind names.
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        // consonant + y -> ies
        match stem.chars().last() {
            Some('a') | Some('e') | Some('i') | Some('o') | Some('u') => format!("{}s", lower),
            _ => format!("{}ies", stem),
        }
    } else {
        format!("{}s", lower)
    }
}

/// Name of the CRD a plan synthesizes (`plural.group`).
pub fn crd_name(plan: &RgdPlan) -> String {
    format!("{}.{}", pluralize(&plan.gvk.kind), plan.gvk.group)
}

/// Build the full CRD for an accepted RGD.
pub fn build_instance_crd(rgd: &ResourceGraphDefinition, plan: &RgdPlan) -> CustomResourceDefinition {
    let gvk = &plan.gvk;
    let plural = pluralize(&gvk.kind);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "kro".to_string());
    labels.insert(RGD_LABEL.to_string(), rgd.name_any());

    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", plural, gvk.group)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: gvk.group.clone(),
            names: CustomResourceDefinitionNames {
                kind: gvk.kind.clone(),
                list_kind: Some(format!("{}List", gvk.kind)),
                plural: plural.clone(),
                singular: Some(gvk.kind.to_lowercase()),
                categories: Some(vec!["kro".to_string()]),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: gvk.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root_schema(plan)),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
                    ..Default::default()
                }),
                additional_printer_columns: Some(printer_columns(rgd)),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

fn root_schema(plan: &RgdPlan) -> JSONSchemaProps {
    let mut properties = BTreeMap::new();
    properties.insert(
        "apiVersion".to_string(),
        JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
    );
    properties.insert(
        "kind".to_string(),
        JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
    );
    properties.insert(
        "metadata".to_string(),
        JSONSchemaProps {
            type_: Some("object".to_string()),
            ..Default::default()
        },
    );
    properties.insert("spec".to_string(), plan.compiled.openapi.clone());
    properties.insert("status".to_string(), status_schema(plan));

    JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        ..Default::default()
    }
}

/// The analyzer-inferred status shape plus the fields kro itself manages.
fn status_schema(plan: &RgdPlan) -> JSONSchemaProps {
    let mut schema = plan.graph.status.openapi();
    let properties = schema.properties.get_or_insert_with(BTreeMap::new);
    properties.insert(
        "state".to_string(),
        JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
    );
    properties.insert(
        "conditions".to_string(),
        JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(JSONSchemaPropsOrArray::Schema(Box::new(JSONSchemaProps {
                type_: Some("object".to_string()),
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            }))),
            ..Default::default()
        },
    );
    schema.type_ = Some("object".to_string());
    schema
}

/// User-declared printer columns replace the defaults entirely.
fn printer_columns(rgd: &ResourceGraphDefinition) -> Vec<CustomResourceColumnDefinition> {
    let declared = &rgd.spec.schema.additional_printer_columns;
    if declared.is_empty() {
        return vec![
            CustomResourceColumnDefinition {
                name: "State".to_string(),
                type_: "string".to_string(),
                json_path: ".status.state".to_string(),
                ..Default::default()
            },
            CustomResourceColumnDefinition {
                name: "Age".to_string(),
                type_: "date".to_string(),
                json_path: ".metadata.creationTimestamp".to_string(),
                ..Default::default()
            },
        ];
    }
    declared.iter().map(to_column).collect()
}

fn to_column(col: &PrinterColumn) -> CustomResourceColumnDefinition {
    CustomResourceColumnDefinition {
        name: col.name.clone(),
        type_: col.type_.clone(),
        json_path: col.json_path.clone(),
        description: col.description.clone(),
        format: col.format.clone(),
        priority: col.priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ResourceGraphDefinitionSpec;
    use kro_graph::{analyze, AnalyzeInput, OpenSchemaSource};
    use kube::core::GroupVersionKind;
    use serde_json::{json, Value};

    fn sample_plan() -> (ResourceGraphDefinition, RgdPlan) {
        let spec: ResourceGraphDefinitionSpec = serde_json::from_value(json!({
            "schema": {
                "kind": "WebApplication",
                "apiVersion": "v1alpha1",
                "spec": {
                    "name": "string | required=true",
                    "replicas": "integer | default=3"
                },
                "status": {
                    "availableReplicas": "${deployment.status.availableReplicas}"
                }
            },
            "resources": [
                {"id": "deployment", "template": {
                    "apiVersion": "apps/v1", "kind": "Deployment",
                    "metadata": {"name": "${schema.name}"}
                }}
            ]
        }))
        .unwrap();

        let compiled = kro_schema::compile(
            &spec.schema.spec,
            &spec.schema.types,
            &spec.schema_validations(),
        )
        .unwrap();
        let definitions: Vec<_> = spec.resources.iter().map(|r| r.to_definition()).collect();
        let graph = analyze(AnalyzeInput {
            resources: &definitions,
            schema_type: compiled.expr_type.clone(),
            status: &spec.schema.status,
            source: &OpenSchemaSource,
        })
        .unwrap();

        let plan = RgdPlan {
            rgd_name: "web-application".to_string(),
            gvk: GroupVersionKind::gvk("kro.run", "v1alpha1", "WebApplication"),
            compiled,
            graph,
            service_accounts: Default::default(),
        };

        let mut rgd = ResourceGraphDefinition::new("web-application", spec);
        rgd.metadata.uid = Some("uid-1".to_string());
        (rgd, plan)
    }

    #[test]
    fn pluralization() {
        assert_eq!(pluralize("WebApplication"), "webapplications");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(pluralize("Gateway"), "gateways");
        assert_eq!(pluralize("Policy"), "policies");
        assert_eq!(pluralize("Batch"), "batches");
    }

    #[test]
    fn builds_namespaced_crd_with_status_subresource() {
        let (rgd, plan) = sample_plan();
        let crd = build_instance_crd(&rgd, &plan);

        assert_eq!(crd.name_unchecked(), "webapplications.kro.run");
        assert_eq!(crd.spec.group, "kro.run");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "WebApplication");
        assert_eq!(crd.spec.names.plural, "webapplications");

        let version = &crd.spec.versions[0];
        assert!(version.served && version.storage);
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());

        let schema = version
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .unwrap();
        let props = schema.properties.as_ref().unwrap();
        assert_eq!(
            props["spec"].required,
            Some(vec!["name".to_string()])
        );
        let status_props = props["status"].properties.as_ref().unwrap();
        assert!(status_props.contains_key("availableReplicas"));
        assert!(status_props.contains_key("conditions"));
        assert!(status_props.contains_key("state"));
    }

    #[test]
    fn default_printer_columns_unless_declared() {
        let (mut rgd, plan) = sample_plan();
        let crd = build_instance_crd(&rgd, &plan);
        let cols = crd.spec.versions[0]
            .additional_printer_columns
            .as_ref()
            .unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "State");

        rgd.spec.schema.additional_printer_columns = vec![PrinterColumn {
            name: "Replicas".to_string(),
            type_: "integer".to_string(),
            json_path: ".spec.replicas".to_string(),
            description: None,
            format: None,
            priority: None,
        }];
        let crd = build_instance_crd(&rgd, &plan);
        let cols = crd.spec.versions[0]
            .additional_printer_columns
            .as_ref()
            .unwrap();
        // declared columns replace the defaults
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "Replicas");
    }

    #[test]
    fn crd_labels_carry_owner() {
        let (rgd, plan) = sample_plan();
        let crd = build_instance_crd(&rgd, &plan);
        let labels = crd.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(RGD_LABEL).map(String::as_str), Some("web-application"));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some("kro"));
    }

    #[test]
    fn schema_compiles_to_stable_output() {
        // byte-equality of regenerated schemas backs the Active-RGD
        // invariant: same input, same CRD
        let (rgd, plan) = sample_plan();
        let a = serde_json::to_vec(&build_instance_crd(&rgd, &plan)).unwrap();
        let b = serde_json::to_vec(&build_instance_crd(&rgd, &plan)).unwrap();
        assert_eq!(a, b);
        let _: Value = serde_json::from_slice(&a).unwrap();
    }
}
