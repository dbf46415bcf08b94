//! Resolution of resource types for reference checking
//!
//! The analyzer type-checks cross-resource references against the schema of
//! the referent's kind. Where that schema comes from is a deployment
//! concern (the operator resolves CRDs against the cluster), so analysis
//! only sees this trait.

use crate::error::Result;
use kro_expr::Type;
use std::collections::BTreeMap;

/// Provides the value type a resource of a given GVK emits at runtime.
pub trait SchemaSource {
    /// Type of a live object of `api_version`/`kind`. Implementations
    /// should fall back to an open (`Dyn`-heavy) type rather than failing
    /// for kinds they cannot describe precisely.
    fn resource_type(&self, api_version: &str, kind: &str) -> Result<Type>;
}

/// Schema source that types every object as open.
///
/// Every Kubernetes object still has typed `metadata`, so common
/// references like `x.metadata.name` check precisely even here.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSchemaSource;

impl SchemaSource for OpenSchemaSource {
    fn resource_type(&self, _api_version: &str, _kind: &str) -> Result<Type> {
        Ok(open_object_type())
    }
}

/// Fixed map from `apiVersion/kind` to a type; test and cache helper.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSource {
    types: BTreeMap<String, Type>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, api_version: &str, kind: &str, ty: Type) -> &mut Self {
        self.types.insert(format!("{}/{}", api_version, kind), ty);
        self
    }
}

impl SchemaSource for StaticSchemaSource {
    fn resource_type(&self, api_version: &str, kind: &str) -> Result<Type> {
        Ok(self
            .types
            .get(&format!("{}/{}", api_version, kind))
            .cloned()
            .unwrap_or_else(open_object_type))
    }
}

/// The standard `metadata` shape every Kubernetes object carries.
pub fn object_meta_type() -> Type {
    Type::object([
        ("name".to_string(), Type::String),
        ("namespace".to_string(), Type::String),
        ("uid".to_string(), Type::String),
        ("generation".to_string(), Type::Int),
        (
            "labels".to_string(),
            Type::Map(Box::new(Type::String), Box::new(Type::String)),
        ),
        (
            "annotations".to_string(),
            Type::Map(Box::new(Type::String), Box::new(Type::String)),
        ),
    ])
}

/// Fallback type for kinds whose schema is unavailable: fully open, so
/// member access into `spec`/`status` checks without false positives.
pub fn open_object_type() -> Type {
    Type::Dyn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_falls_back_to_open() {
        let mut source = StaticSchemaSource::new();
        source.insert(
            "apps/v1",
            "Deployment",
            Type::object([("metadata".to_string(), object_meta_type())]),
        );
        let known = source.resource_type("apps/v1", "Deployment").unwrap();
        assert!(matches!(known, Type::Object(_)));
        let unknown = source.resource_type("v1", "Service").unwrap();
        assert_eq!(unknown, Type::Dyn);
    }
}
