//! # kro-schema
//!
//! Compiler for kro's SimpleSchema DSL. An RGD declares the API of its
//! instances as a human-friendly schema (`spec`, `types`, `status`
//! sections); this crate turns that into everything the rest of the system
//! needs:
//!
//! - an OpenAPI v3 schema (`JSONSchemaProps`) for the synthesized CRD,
//!   including `x-kubernetes-validations` rules,
//! - a typing environment for the expression checker (`schema` binding),
//! - a defaults function applied to instance specs,
//! - the runtime-rechecked validation rules, and
//! - the inferred status subresource schema plus its projection.
//!
//! Leaf fields are written as atom strings such as
//! `integer | default=3 | minimum=1`; objects nest, arrays are written as
//! one-element lists, and `map[string]T` declares maps. Named types from
//! the `types` section are compiled once and may not be recursive.

#![forbid(unsafe_code)]

mod atom;
mod compile;
mod error;
mod openapi;
mod status;
mod types;

pub use compile::{apply_defaults, compile, CompiledSchema, CompiledValidation};
pub use error::{Result, SchemaError};
pub use openapi::{expr_type_to_openapi, field_to_openapi};
pub use status::StatusProjection;
pub use types::{FieldSpec, SimpleType, Validation};
