//! Resource graph input model

use crate::error::{GraphError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Valid resource ids: lowerCamelCase starting with a letter
static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-zA-Z0-9]*$").expect("static regex"));

/// Names that cannot be used as resource ids because expressions already
/// bind them
const RESERVED_IDS: &[&str] = &["schema", "self"];

/// One entry of an RGD's `resources` list, before analysis.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub id: String,
    /// Partially-templated Kubernetes manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    /// Read-only reference to a pre-existing object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    /// Readiness predicates; all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,
    /// Inclusion predicates; all must hold for the node to materialize
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
}

/// A reference to an object kro reads but never owns or mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceDefinition {
    /// Validate the id and the template/externalRef exclusivity invariant.
    pub fn validate(&self) -> Result<()> {
        if !ID_REGEX.is_match(&self.id) {
            return Err(GraphError::InvalidId {
                id: self.id.clone(),
            });
        }
        if RESERVED_IDS.contains(&self.id.as_str()) {
            return Err(GraphError::ReservedId {
                id: self.id.clone(),
            });
        }
        match (&self.template, &self.external_ref) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(GraphError::InvalidResource {
                id: self.id.clone(),
                detail: "exactly one of template or externalRef must be provided".to_string(),
            }),
            (None, None) => Err(GraphError::InvalidResource {
                id: self.id.clone(),
                detail: "one of template or externalRef is required".to_string(),
            }),
        }
    }
}

/// One step into a JSON tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for PathStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStep::Key(k) => write!(f, ".{}", k),
            PathStep::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Render a site path as `.spec.containers[0].image`.
pub fn path_to_string(path: &[PathStep]) -> String {
    path.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_validation() {
        let mut r = ResourceDefinition {
            id: "deployment".to_string(),
            template: Some(json!({})),
            ..Default::default()
        };
        assert!(r.validate().is_ok());

        r.id = "Deployment".to_string();
        assert!(matches!(r.validate(), Err(GraphError::InvalidId { .. })));
        r.id = "1abc".to_string();
        assert!(matches!(r.validate(), Err(GraphError::InvalidId { .. })));
        r.id = "my-resource".to_string();
        assert!(matches!(r.validate(), Err(GraphError::InvalidId { .. })));
        r.id = "schema".to_string();
        assert!(matches!(r.validate(), Err(GraphError::ReservedId { .. })));
    }

    #[test]
    fn template_external_ref_exclusivity() {
        let both = ResourceDefinition {
            id: "x".to_string(),
            template: Some(json!({})),
            external_ref: Some(ExternalRef::default()),
            ..Default::default()
        };
        assert!(matches!(
            both.validate(),
            Err(GraphError::InvalidResource { .. })
        ));

        let neither = ResourceDefinition {
            id: "x".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            neither.validate(),
            Err(GraphError::InvalidResource { .. })
        ));
    }

    #[test]
    fn external_ref_deserializes_camel_case() {
        let r: ResourceDefinition = serde_json::from_value(json!({
            "id": "projectConfig",
            "externalRef": {
                "apiVersion": "v1alpha1",
                "kind": "Project",
                "name": "default-project"
            }
        }))
        .unwrap();
        let ext = r.external_ref.unwrap();
        assert_eq!(ext.kind, "Project");
        assert_eq!(ext.namespace, None);
    }
}
