//! SimpleSchema compilation
//!
//! Turns the `spec`/`types` sections of an RGD schema into a typed field
//! tree, an OpenAPI schema for CRD embedding, a typing environment for the
//! expression checker, and the set of validation rules the reconciler
//! re-applies at runtime.

use crate::atom::{parse_atom, Atom, BaseRef};
use crate::error::{Result, SchemaError};
use crate::openapi::field_to_openapi;
use crate::types::{FieldSpec, SimpleType, Validation};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use serde_json::Value;
use std::collections::BTreeMap;

/// The compiled form of an RGD schema's `spec` section.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    /// Typed field tree of the instance spec
    pub spec: FieldSpec,
    /// OpenAPI schema for the CRD's `.spec` subtree, including
    /// `x-kubernetes-validations`
    pub openapi: JSONSchemaProps,
    /// Type of the `schema` binding seen by expressions
    pub expr_type: kro_expr::Type,
    /// All validation rules (top-level and per-field), pre-parsed for the
    /// runtime re-check
    pub validations: Vec<CompiledValidation>,
}

/// A validation rule bound to the field path it guards (empty for rules on
/// the whole spec).
#[derive(Debug, Clone)]
pub struct CompiledValidation {
    /// Dotted path below `.spec`, empty for top-level rules
    pub field_path: String,
    pub expression: String,
    pub message: Option<String>,
    pub ast: kro_expr::Expr,
}

/// Compile the `spec` and `types` sections plus top-level validation rules.
///
/// `spec` and `types` are the raw JSON sub-objects of the RGD schema;
/// either may be `Value::Null` when omitted.
pub fn compile(spec: &Value, types: &Value, validation: &[Validation]) -> Result<CompiledSchema> {
    let mut compiler = Compiler::new(types)?;

    let spec_field = match spec {
        Value::Null => FieldSpec::of(SimpleType::Object(Vec::new())),
        other => compiler.compile_value(other, "spec")?,
    };

    let expr_type = spec_field.ty.to_expr_type();

    // collect per-field rules, then top-level rules on the spec root
    let mut validations = Vec::new();
    collect_field_validations(&spec_field, "", &mut validations)?;
    for rule in validation {
        validations.push(compile_validation(rule, "")?);
    }
    // per-field rules are checked against their own field's type; rules
    // living under array/map elements see their element as `self`, which
    // the path cannot express, so they check against Dyn
    for v in validations.iter().filter(|v| !v.field_path.is_empty()) {
        let field_ty = match lookup_field_type(&spec_field, &v.field_path) {
            Some(SimpleType::Array(_) | SimpleType::Map(_)) | None => kro_expr::Type::Dyn,
            Some(ty) => ty.to_expr_type(),
        };
        check_validation_type(v, &field_ty)?;
    }
    for v in validations.iter().filter(|v| v.field_path.is_empty()) {
        check_validation_type(v, &expr_type)?;
    }

    let mut openapi = field_to_openapi(&spec_field);
    attach_root_validations(&mut openapi, validation);

    Ok(CompiledSchema {
        spec: spec_field,
        openapi,
        expr_type,
        validations,
    })
}

/// Fill in declared defaults, mirroring OpenAPI defaulting: a default
/// applies when its key is absent and its parent object is present.
pub fn apply_defaults(spec: &FieldSpec, value: &mut Value) {
    match (&spec.ty, value) {
        (SimpleType::Object(fields), Value::Object(map)) => {
            for (name, field) in fields {
                match map.get_mut(name) {
                    Some(existing) => apply_defaults(field, existing),
                    None => {
                        if let Some(default) = &field.default {
                            map.insert(name.clone(), default.clone());
                        }
                    }
                }
            }
        }
        (SimpleType::Array(elem), Value::Array(items)) => {
            for item in items {
                apply_defaults(elem, item);
            }
        }
        (SimpleType::Map(value_spec), Value::Object(map)) => {
            for v in map.values_mut() {
                apply_defaults(value_spec, v);
            }
        }
        _ => {}
    }
}

struct Compiler<'a> {
    named_raw: BTreeMap<String, &'a Value>,
    resolved: BTreeMap<String, FieldSpec>,
    resolving: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(types: &'a Value) -> Result<Self> {
        let mut named_raw = BTreeMap::new();
        match types {
            Value::Null => {}
            Value::Object(map) => {
                for (name, def) in map {
                    let trimmed = name.trim().to_string();
                    if matches!(trimmed.as_str(), "string" | "integer" | "number" | "boolean") {
                        return Err(SchemaError::DuplicateField {
                            path: "types".to_string(),
                            name: trimmed,
                        });
                    }
                    if named_raw.insert(trimmed.clone(), def).is_some() {
                        return Err(SchemaError::DuplicateField {
                            path: "types".to_string(),
                            name: trimmed,
                        });
                    }
                }
            }
            _ => {
                return Err(SchemaError::InvalidStructure {
                    path: "types".to_string(),
                    detail: "types section must be an object".to_string(),
                })
            }
        }
        Ok(Compiler {
            named_raw,
            resolved: BTreeMap::new(),
            resolving: Vec::new(),
        })
    }

    fn compile_value(&mut self, value: &Value, path: &str) -> Result<FieldSpec> {
        match value {
            Value::String(atom_src) => {
                let atom = parse_atom(atom_src, path)?;
                self.finish_atom(atom, path)
            }
            Value::Object(map) => {
                let mut fields: Vec<(String, FieldSpec)> = Vec::with_capacity(map.len());
                for (name, v) in map {
                    let trimmed = name.trim().to_string();
                    if fields.iter().any(|(existing, _)| *existing == trimmed) {
                        return Err(SchemaError::DuplicateField {
                            path: path.to_string(),
                            name: trimmed,
                        });
                    }
                    let child_path = format!("{}.{}", path, trimmed);
                    fields.push((trimmed, self.compile_value(v, &child_path)?));
                }
                Ok(FieldSpec::of(SimpleType::Object(fields)))
            }
            Value::Array(items) => {
                if items.len() != 1 {
                    return Err(SchemaError::InvalidStructure {
                        path: path.to_string(),
                        detail: format!(
                            "array type must have exactly one element describing its items, found {}",
                            items.len()
                        ),
                    });
                }
                let elem = self.compile_value(&items[0], &format!("{}[]", path))?;
                Ok(FieldSpec::of(SimpleType::Array(Box::new(elem))))
            }
            other => Err(SchemaError::InvalidStructure {
                path: path.to_string(),
                detail: format!("expected a type string, object, or array, found {}", other),
            }),
        }
    }

    fn finish_atom(&mut self, atom: Atom, path: &str) -> Result<FieldSpec> {
        let base = self.resolve_base(&atom.base, path)?;

        let mut field = match base {
            Resolved::Builtin(ty) => FieldSpec::of(ty),
            // named types pull in their whole compiled spec; attributes on
            // the use site override
            Resolved::Named(spec) => spec,
        };

        let attrs = atom.attrs;
        if let Some(required) = attrs.required {
            field.required = required;
        }
        if let Some(description) = attrs.description {
            field.description = Some(description);
        }
        if let Some(enum_values) = attrs.enum_values {
            for v in &enum_values {
                if !field.ty.admits(v) {
                    return Err(SchemaError::DefaultTypeMismatch {
                        path: format!("{} (enum)", path),
                        expected: field.ty.display_name().to_string(),
                    });
                }
            }
            field.enum_values = Some(enum_values);
        }
        if attrs.minimum.is_some() || attrs.maximum.is_some() {
            if !matches!(field.ty, SimpleType::Integer | SimpleType::Number) {
                return Err(SchemaError::MalformedAttribute {
                    path: path.to_string(),
                    detail: format!(
                        "minimum/maximum apply to numeric types, not {}",
                        field.ty.display_name()
                    ),
                });
            }
            field.minimum = attrs.minimum.or(field.minimum);
            field.maximum = attrs.maximum.or(field.maximum);
        }
        if attrs.pattern.is_some() || attrs.min_length.is_some() || attrs.max_length.is_some() {
            if !matches!(field.ty, SimpleType::String) {
                return Err(SchemaError::MalformedAttribute {
                    path: path.to_string(),
                    detail: format!(
                        "pattern/minLength/maxLength apply to strings, not {}",
                        field.ty.display_name()
                    ),
                });
            }
            field.pattern = attrs.pattern.or(field.pattern);
            field.min_length = attrs.min_length.or(field.min_length);
            field.max_length = attrs.max_length.or(field.max_length);
        }
        field.validations.extend(attrs.validations);

        if let Some(default) = attrs.default {
            if !field.ty.admits(&default) {
                return Err(SchemaError::DefaultTypeMismatch {
                    path: path.to_string(),
                    expected: field.ty.display_name().to_string(),
                });
            }
            if let Some(enum_values) = &field.enum_values {
                if !enum_values.contains(&default) {
                    return Err(SchemaError::DefaultTypeMismatch {
                        path: format!("{} (default not in enum)", path),
                        expected: field.ty.display_name().to_string(),
                    });
                }
            }
            field.default = Some(default);
        }

        Ok(field)
    }

    fn resolve_base(&mut self, base: &BaseRef, path: &str) -> Result<Resolved> {
        match base {
            BaseRef::String => Ok(Resolved::Builtin(SimpleType::String)),
            BaseRef::Integer => Ok(Resolved::Builtin(SimpleType::Integer)),
            BaseRef::Number => Ok(Resolved::Builtin(SimpleType::Number)),
            BaseRef::Boolean => Ok(Resolved::Builtin(SimpleType::Boolean)),
            BaseRef::Map(inner) => {
                let value_spec = match self.resolve_base(inner, path)? {
                    Resolved::Builtin(ty) => FieldSpec::of(ty),
                    Resolved::Named(spec) => spec,
                };
                Ok(Resolved::Builtin(SimpleType::Map(Box::new(value_spec))))
            }
            BaseRef::Named(name) => self.resolve_named(name, path).map(Resolved::Named),
        }
    }

    fn resolve_named(&mut self, name: &str, path: &str) -> Result<FieldSpec> {
        if let Some(done) = self.resolved.get(name) {
            return Ok(done.clone());
        }
        if self.resolving.iter().any(|n| n == name) {
            return Err(SchemaError::RecursiveType {
                name: name.to_string(),
            });
        }
        let raw = *self
            .named_raw
            .get(name)
            .ok_or_else(|| SchemaError::UnknownType {
                path: path.to_string(),
                name: name.to_string(),
            })?;

        self.resolving.push(name.to_string());
        let compiled = self.compile_value(raw, &format!("types.{}", name));
        self.resolving.pop();

        let compiled = compiled?;
        self.resolved.insert(name.to_string(), compiled.clone());
        Ok(compiled)
    }
}

enum Resolved {
    Builtin(SimpleType),
    Named(FieldSpec),
}

fn collect_field_validations(
    field: &FieldSpec,
    path: &str,
    out: &mut Vec<CompiledValidation>,
) -> Result<()> {
    for rule in &field.validations {
        out.push(compile_validation(rule, path)?);
    }
    match &field.ty {
        SimpleType::Object(fields) => {
            for (name, child) in fields {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", path, name)
                };
                collect_field_validations(child, &child_path, out)?;
            }
        }
        SimpleType::Array(elem) => collect_field_validations(elem, path, out)?,
        SimpleType::Map(value) => collect_field_validations(value, path, out)?,
        _ => {}
    }
    Ok(())
}

fn compile_validation(rule: &Validation, field_path: &str) -> Result<CompiledValidation> {
    let ast = kro_expr::parse(&rule.expression).map_err(|e| SchemaError::MalformedValidation {
        path: if field_path.is_empty() {
            "spec".to_string()
        } else {
            format!("spec.{}", field_path)
        },
        detail: e.to_string(),
    })?;
    Ok(CompiledValidation {
        field_path: field_path.to_string(),
        expression: rule.expression.clone(),
        message: rule.message.clone(),
        ast,
    })
}

fn check_validation_type(rule: &CompiledValidation, self_type: &kro_expr::Type) -> Result<()> {
    let mut env = kro_expr::TypeEnv::new();
    env.bind("self", self_type.clone());
    let ty = kro_expr::check(&rule.ast, &env).map_err(|e| SchemaError::MalformedValidation {
        path: if rule.field_path.is_empty() {
            "spec".to_string()
        } else {
            format!("spec.{}", rule.field_path)
        },
        detail: e.to_string(),
    })?;
    if !ty.assignable_to(&kro_expr::Type::Bool) {
        return Err(SchemaError::MalformedValidation {
            path: if rule.field_path.is_empty() {
                "spec".to_string()
            } else {
                format!("spec.{}", rule.field_path)
            },
            detail: format!("validation must yield bool, got {}", ty),
        });
    }
    Ok(())
}

fn lookup_field_type<'a>(spec: &'a FieldSpec, dotted: &str) -> Option<&'a SimpleType> {
    let mut current = spec;
    for seg in dotted.split('.') {
        match &current.ty {
            SimpleType::Object(fields) => {
                current = fields.iter().find(|(name, _)| name == seg).map(|(_, f)| f)?;
            }
            _ => return None,
        }
    }
    Some(&current.ty)
}

fn attach_root_validations(
    openapi: &mut JSONSchemaProps,
    validation: &[Validation],
) {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::ValidationRule;
    if validation.is_empty() {
        return;
    }
    let rules: Vec<ValidationRule> = validation
        .iter()
        .map(|v| ValidationRule {
            rule: v.expression.clone(),
            message: v.message.clone(),
            ..Default::default()
        })
        .collect();
    match &mut openapi.x_kubernetes_validations {
        Some(existing) => existing.extend(rules),
        None => openapi.x_kubernetes_validations = Some(rules),
    }
}
