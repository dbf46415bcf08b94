//! # kro-graph
//!
//! Analysis of an RGD's resource graph. Given the compiled instance schema
//! and the list of resource definitions, this crate extracts every embedded
//! expression, type-checks it, derives the dependency DAG from the
//! references it makes, rejects cycles (naming one), fixes a deterministic
//! topological order, and compiles the status projection.
//!
//! Referent types are resolved through the [`SchemaSource`] trait so
//! analysis itself never talks to a cluster; the operator plugs in a
//! CRD-backed implementation and tests use [`StaticSchemaSource`].

#![forbid(unsafe_code)]

mod analyze;
mod error;
mod resource;
mod schema_source;

pub use analyze::{analyze, AnalyzeInput, AnalyzedResource, ExprSite, Graph, Node, TemplateNode};
pub use error::{GraphError, Result};
pub use resource::{path_to_string, ExternalRef, PathStep, ResourceDefinition};
pub use schema_source::{
    object_meta_type, open_object_type, OpenSchemaSource, SchemaSource, StaticSchemaSource,
};
