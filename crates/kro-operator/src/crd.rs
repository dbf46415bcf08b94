//! The ResourceGraphDefinition custom resource
//!
//! A ResourceGraphDefinition (RGD) binds a SimpleSchema definition of a new
//! API to a graph of templated resources. Accepting one synthesizes a CRD
//! and starts a dynamic controller for instances of the new kind.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Kinds must be UpperCamelCase, max 63 characters
static KIND_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-zA-Z0-9]{0,62}$").expect("static regex"));

/// Kubernetes API version names: v1, v1alpha1, v2beta3, …
static API_VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v[0-9]+(alpha[0-9]+|beta[0-9]+)?$").expect("static regex"));

/// DNS-1123 subdomain for API groups
static GROUP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static regex")
});

fn validate_kind(value: &str) -> Result<(), ValidationError> {
    if KIND_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_kind")
            .with_message(format!("'{}' is not an UpperCamelCase kind name", value).into()))
    }
}

fn validate_api_version(value: &str) -> Result<(), ValidationError> {
    if API_VERSION_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_api_version").with_message(
            format!("'{}' is not a valid API version (vN, vNalphaN, vNbetaN)", value).into(),
        ))
    }
}

fn validate_group(value: &str) -> Result<(), ValidationError> {
    if GROUP_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_group")
            .with_message(format!("'{}' is not a valid API group", value).into()))
    }
}

/// Free-form JSON subtree (`x-kubernetes-preserve-unknown-fields`).
fn preserve_unknown(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject::default();
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::json!(true),
    );
    schemars::schema::Schema::Object(obj)
}

/// String field that may not change once set (`self == oldSelf`).
fn immutable_string(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::String.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-validations".to_string(),
        serde_json::json!([{"rule": "self == oldSelf", "message": "field is immutable"}]),
    );
    schemars::schema::Schema::Object(obj)
}

/// ResourceGraphDefinition custom resource definition
///
/// Cluster-scoped blueprint binding a SimpleSchema-defined API to a graph
/// of templated resources. The operator validates, compiles, and analyzes
/// the definition, synthesizes a CRD for the new kind, and runs a dynamic
/// controller reconciling its instances.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    plural = "resourcegraphdefinitions",
    shortname = "rgd",
    status = "ResourceGraphDefinitionStatus",
    printcolumn = r#"{"name":"ApiVersion", "type":"string", "jsonPath":".spec.schema.apiVersion"}"#,
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.schema.kind"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"TopologicalOrder", "type":"string", "priority":1, "jsonPath":".status.topologicalOrder"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Schema of the API this RGD defines: GVK plus the SimpleSchema
    /// `spec`/`types`/`status` sections
    #[validate(nested)]
    pub schema: RgdSchema,

    /// Resource graph: templated manifests and external references
    #[serde(default)]
    pub resources: Vec<RgdResource>,

    /// Per-namespace service accounts the dynamic controller impersonates;
    /// the key `"*"` is the fallback for unmapped namespaces
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_service_accounts: BTreeMap<String, String>,
}

/// The schema section of an RGD.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RgdSchema {
    /// Kind of the synthesized API; immutable once accepted
    #[validate(custom(function = "validate_kind"))]
    #[schemars(schema_with = "immutable_string")]
    pub kind: String,

    /// Version of the synthesized API; immutable once accepted
    #[validate(custom(function = "validate_api_version"))]
    #[schemars(schema_with = "immutable_string")]
    pub api_version: String,

    /// API group of the synthesized kind
    #[serde(default = "default_group")]
    #[validate(custom(function = "validate_group"))]
    #[schemars(schema_with = "immutable_string")]
    pub group: String,

    /// SimpleSchema definition of the instance spec
    #[serde(default, skip_serializing_if = "Value::is_null")]
    #[schemars(schema_with = "preserve_unknown")]
    pub spec: Value,

    /// Named type definitions usable from `spec`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    #[schemars(schema_with = "preserve_unknown")]
    pub types: Value,

    /// Status projection: every leaf is a `${…}` expression evaluated
    /// against the materialized resources
    #[serde(default, skip_serializing_if = "Value::is_null")]
    #[schemars(schema_with = "preserve_unknown")]
    pub status: Value,

    /// Validation rules evaluated against the instance spec. `self` binds
    /// the spec object only; status is not visible to admission rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<RgdValidation>,

    /// Printer columns for the synthesized CRD; when set, replaces the
    /// defaults entirely
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_printer_columns: Vec<PrinterColumn>,
}

fn default_group() -> String {
    "kro.run".to_string()
}

/// One CEL-style validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct RgdValidation {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Printer column passthrough for the synthesized CRD.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrinterColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub json_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// One node of the resource graph.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RgdResource {
    /// Unique id, `[a-z][a-zA-Z0-9]*`; the name other expressions bind
    pub id: String,

    /// Templated Kubernetes manifest (exactly one of template/externalRef)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown")]
    pub template: Option<Value>,

    /// Read-only reference to a pre-existing object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<RgdExternalRef>,

    /// Readiness predicates; all must hold for the node to be Ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,

    /// Inclusion predicates; when false the node and its dependents are
    /// skipped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
}

/// Reference to an external object kro reads but never owns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RgdExternalRef {
    pub api_version: String,
    pub kind: String,
    pub metadata: RgdExternalRefMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RgdExternalRefMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// State of a ResourceGraphDefinition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RgdState {
    Active,
    Inactive,
}

/// Observed state of a ResourceGraphDefinition.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// Active once the CRD is registered and the dynamic controller runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RgdState>,

    /// Deterministic linearization of the resource graph
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,

    /// Latest observations of the RGD's state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-resource dependency information
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceInformation>,
}

/// Dependency information for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInformation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

/// One observed dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Dependency {
    pub id: String,
}

/// A standard condition entry, shared by RGDs and instances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub condition_type: String,
    /// `True`, `False`, or `Unknown`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Build a condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Condition {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Replace-or-append by condition type, preserving `lastTransitionTime`
/// when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        Some(existing) => {
            let transition = existing.status != new.status;
            let last_transition_time = if transition {
                new.last_transition_time.clone()
            } else {
                existing.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}

impl RgdResource {
    /// Convert to the analyzer's input model.
    pub fn to_definition(&self) -> kro_graph::ResourceDefinition {
        kro_graph::ResourceDefinition {
            id: self.id.clone(),
            template: self.template.clone(),
            external_ref: self.external_ref.as_ref().map(|e| kro_graph::ExternalRef {
                api_version: e.api_version.clone(),
                kind: e.kind.clone(),
                name: e.metadata.name.clone(),
                namespace: e.metadata.namespace.clone(),
            }),
            ready_when: self.ready_when.clone(),
            include_when: self.include_when.clone(),
        }
    }
}

impl ResourceGraphDefinitionSpec {
    /// GVK of the API this RGD synthesizes.
    pub fn instance_gvk(&self) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(
            &self.schema.group,
            &self.schema.api_version,
            &self.schema.kind,
        )
    }

    /// Validation rules converted for the schema compiler.
    pub fn schema_validations(&self) -> Vec<kro_schema::Validation> {
        self.schema
            .validation
            .iter()
            .map(|v| kro_schema::Validation {
                expression: v.expression.clone(),
                message: v.message.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_web_application_rgd() {
        let spec: ResourceGraphDefinitionSpec = serde_json::from_value(json!({
            "schema": {
                "kind": "WebApplication",
                "apiVersion": "v1alpha1",
                "spec": {
                    "name": "string | required=true",
                    "image": "string | default=nginx",
                    "replicas": "integer | default=3"
                },
                "status": {
                    "availableReplicas": "${deployment.status.availableReplicas}"
                }
            },
            "resources": [
                {"id": "deployment", "template": {"apiVersion": "apps/v1", "kind": "Deployment"}},
                {"id": "service", "template": {"apiVersion": "v1", "kind": "Service"}}
            ],
            "defaultServiceAccounts": {"*": "kro-runtime"}
        }))
        .unwrap();

        assert_eq!(spec.schema.kind, "WebApplication");
        assert_eq!(spec.schema.group, "kro.run");
        assert_eq!(spec.resources.len(), 2);
        assert_eq!(
            spec.default_service_accounts.get("*").map(String::as_str),
            Some("kro-runtime")
        );

        let gvk = spec.instance_gvk();
        assert_eq!(gvk.group, "kro.run");
        assert_eq!(gvk.version, "v1alpha1");
        assert_eq!(gvk.kind, "WebApplication");

        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_bad_kind_and_version() {
        let mut spec: ResourceGraphDefinitionSpec = serde_json::from_value(json!({
            "schema": {"kind": "WebApplication", "apiVersion": "v1alpha1"}
        }))
        .unwrap();

        spec.schema.kind = "webApplication".to_string();
        assert!(spec.validate().is_err());

        spec.schema.kind = "WebApplication".to_string();
        spec.schema.api_version = "1.0".to_string();
        assert!(spec.validate().is_err());

        spec.schema.api_version = "v2beta1".to_string();
        spec.schema.group = "Not A Group".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn external_ref_converts_to_definition() {
        let resource: RgdResource = serde_json::from_value(json!({
            "id": "projectConfig",
            "externalRef": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "project", "namespace": "infra"}
            }
        }))
        .unwrap();
        let def = resource.to_definition();
        let ext = def.external_ref.unwrap();
        assert_eq!(ext.name, "project");
        assert_eq!(ext.namespace.as_deref(), Some("infra"));
    }

    #[test]
    fn condition_transitions_keep_timestamps() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Ready", false, "Pending", "waiting"),
        );
        let first_time = conditions[0].last_transition_time.clone();

        // same status: timestamp preserved, message updated
        set_condition(
            &mut conditions,
            Condition::new("Ready", false, "Pending", "still waiting"),
        );
        assert_eq!(conditions[0].last_transition_time, first_time);
        assert_eq!(conditions[0].message.as_deref(), Some("still waiting"));

        // flipped status: new timestamp allowed
        set_condition(
            &mut conditions,
            Condition::new("Ready", true, "AllReady", "done"),
        );
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn crd_generation_is_cluster_scoped() {
        use kube::CustomResourceExt;
        let crd = ResourceGraphDefinition::crd();
        assert_eq!(crd.spec.group, "kro.run");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "ResourceGraphDefinition");
        assert_eq!(crd.spec.names.short_names, Some(vec!["rgd".to_string()]));
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
        assert_eq!(
            version.additional_printer_columns.as_ref().map(|c| c.len()),
            Some(5)
        );
    }
}
