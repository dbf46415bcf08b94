//! Resource graph analysis
//!
//! Walks every resource template, parses and type-checks every embedded
//! expression, derives the dependency graph from the references those
//! expressions make, verifies acyclicity, and fixes a deterministic
//! topological order. The result is cached by the operator and drives both
//! instance reconciliation and status projection.

use crate::error::{GraphError, Result};
use crate::resource::{path_to_string, ExternalRef, PathStep, ResourceDefinition};
use crate::schema_source::SchemaSource;
use kro_expr::{references, Bindings, Expr, Template, Type, TypeEnv};
use kro_schema::StatusProjection;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Input to one analysis run.
pub struct AnalyzeInput<'a> {
    pub resources: &'a [ResourceDefinition],
    /// Type of the `schema` binding (the instance spec)
    pub schema_type: Type,
    /// Raw `status` section of the RGD schema
    pub status: &'a Value,
    /// Resolver for referent types
    pub source: &'a dyn SchemaSource,
}

/// A fully analyzed, acyclic resource graph.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: BTreeMap<String, AnalyzedResource>,
    /// Deterministic topological order (dependencies first, ties broken
    /// lexicographically)
    pub order: Vec<String>,
    /// Compiled status projection, typed against the full environment
    pub status: StatusProjection,
}

/// One analyzed node.
#[derive(Debug, Clone)]
pub struct AnalyzedResource {
    pub id: String,
    pub node: Node,
    pub ready_when: Vec<Expr>,
    pub include_when: Vec<Expr>,
    /// Other resource ids this node depends on
    pub dependencies: BTreeSet<String>,
}

/// Node payload: a templated manifest kro owns, or a read-only reference.
#[derive(Debug, Clone)]
pub enum Node {
    Template(TemplateNode),
    ExternalRef(ExternalRef),
}

/// A template with its expression sites pre-parsed.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub api_version: String,
    pub kind: String,
    pub manifest: Value,
    pub sites: Vec<ExprSite>,
}

/// One string leaf of a template that contains `${…}` placeholders.
#[derive(Debug, Clone)]
pub struct ExprSite {
    pub path: Vec<PathStep>,
    pub template: Template,
}

impl TemplateNode {
    /// Deep-clone the manifest and substitute every expression site.
    pub fn render(&self, bindings: &Bindings) -> kro_expr::Result<Value> {
        let mut out = self.manifest.clone();
        for site in &self.sites {
            let value = site.template.render(bindings)?;
            set_at_path(&mut out, &site.path, value);
        }
        Ok(out)
    }
}

impl Graph {
    /// Every node that transitively depends on `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for (other, node) in &self.nodes {
                if node.dependencies.contains(&current) && out.insert(other.clone()) {
                    stack.push(other.clone());
                }
            }
        }
        out
    }
}

/// Analyze a resource set against the instance schema.
pub fn analyze(input: AnalyzeInput<'_>) -> Result<Graph> {
    // validate ids and payload exclusivity up front
    let mut seen = BTreeSet::new();
    for resource in input.resources {
        resource.validate()?;
        if !seen.insert(resource.id.clone()) {
            return Err(GraphError::DuplicateId {
                id: resource.id.clone(),
            });
        }
    }

    // bind every root before checking any expression: templates may
    // reference resources declared later in the list
    let mut env = TypeEnv::new();
    env.bind("schema", input.schema_type.clone());
    for resource in input.resources {
        let ty = match (&resource.template, &resource.external_ref) {
            (Some(template), _) => {
                let (api_version, kind) = template_gvk(resource, template)?;
                input.source.resource_type(&api_version, &kind)?
            }
            (_, Some(ext)) => input.source.resource_type(&ext.api_version, &ext.kind)?,
            _ => unreachable!("validated above"),
        };
        env.bind(resource.id.clone(), ty);
    }

    let mut nodes = BTreeMap::new();
    for resource in input.resources {
        let analyzed = analyze_resource(resource, &env)?;
        nodes.insert(resource.id.clone(), analyzed);
    }

    let order = topological_order(&nodes)?;
    let status = StatusProjection::compile(input.status, &env)?;

    Ok(Graph {
        nodes,
        order,
        status,
    })
}

fn template_gvk(resource: &ResourceDefinition, template: &Value) -> Result<(String, String)> {
    let api_version = template.get("apiVersion").and_then(|v| v.as_str());
    let kind = template.get("kind").and_then(|v| v.as_str());
    match (api_version, kind) {
        (Some(av), Some(k)) if !kro_expr::is_template(av) && !kro_expr::is_template(k) => {
            Ok((av.to_string(), k.to_string()))
        }
        _ => Err(GraphError::InvalidResource {
            id: resource.id.clone(),
            detail: "template must declare literal apiVersion and kind".to_string(),
        }),
    }
}

fn analyze_resource(resource: &ResourceDefinition, env: &TypeEnv) -> Result<AnalyzedResource> {
    let mut dependencies = BTreeSet::new();

    let node = match (&resource.template, &resource.external_ref) {
        (Some(template), _) => {
            let (api_version, kind) = template_gvk(resource, template)?;
            let mut raw_sites = Vec::new();
            collect_template_strings(template, &mut Vec::new(), &mut raw_sites);

            let mut sites = Vec::new();
            for (path, src) in raw_sites {
                let site_name = path_to_string(&path);
                let template = Template::parse(&src).map_err(|e| GraphError::Expression {
                    id: resource.id.clone(),
                    site: site_name.clone(),
                    source: e,
                })?;
                for expr in template.exprs() {
                    kro_expr::check(expr, env).map_err(|e| GraphError::Expression {
                        id: resource.id.clone(),
                        site: site_name.clone(),
                        source: e,
                    })?;
                    collect_dependencies(expr, resource, env, true, &mut dependencies)?;
                }
                sites.push(ExprSite { path, template });
            }

            Node::Template(TemplateNode {
                api_version,
                kind,
                manifest: template.clone(),
                sites,
            })
        }
        (_, Some(ext)) => Node::ExternalRef(ext.clone()),
        _ => unreachable!("validated by caller"),
    };

    let ready_when = compile_predicates(&resource.ready_when, resource, env, &mut dependencies)?;
    let include_when =
        compile_predicates(&resource.include_when, resource, env, &mut dependencies)?;

    Ok(AnalyzedResource {
        id: resource.id.clone(),
        node,
        ready_when,
        include_when,
        dependencies,
    })
}

/// Predicates may be written bare (`a == b`) or wrapped (`${a == b}`); both
/// must be a single boolean expression.
fn compile_predicates(
    sources: &[String],
    resource: &ResourceDefinition,
    env: &TypeEnv,
    dependencies: &mut BTreeSet<String>,
) -> Result<Vec<Expr>> {
    let mut out = Vec::new();
    for src in sources {
        let wrap_err = |e: kro_expr::ExprError| GraphError::Expression {
            id: resource.id.clone(),
            site: format!("'{}'", src),
            source: e,
        };

        let expr = if kro_expr::is_template(src) {
            let template = Template::parse(src).map_err(wrap_err)?;
            if !template.is_whole_expr() {
                return Err(GraphError::Expression {
                    id: resource.id.clone(),
                    site: format!("'{}'", src),
                    source: kro_expr::ExprError::Type(
                        "predicate must be a single expression".to_string(),
                    ),
                });
            }
            let expr = template.exprs().next().expect("whole template").clone();
            expr
        } else {
            kro_expr::parse(src).map_err(wrap_err)?
        };

        let ty = kro_expr::check(&expr, env).map_err(wrap_err)?;
        if !ty.assignable_to(&Type::Bool) {
            return Err(GraphError::Expression {
                id: resource.id.clone(),
                site: format!("'{}'", src),
                source: kro_expr::ExprError::Type(format!(
                    "predicate must be bool, got {}",
                    ty
                )),
            });
        }

        // a predicate naturally inspects its own resource; that adds no edge
        collect_dependencies(&expr, resource, env, false, dependencies)?;
        out.push(expr);
    }
    Ok(out)
}

fn collect_dependencies(
    expr: &Expr,
    resource: &ResourceDefinition,
    env: &TypeEnv,
    self_reference_is_edge: bool,
    dependencies: &mut BTreeSet<String>,
) -> Result<()> {
    for reference in references(expr) {
        if !env.contains(&reference.root) {
            return Err(GraphError::UnknownReference {
                id: resource.id.clone(),
                root: reference.root,
            });
        }
        if reference.root == "schema" {
            continue;
        }
        if reference.root == resource.id && !self_reference_is_edge {
            continue;
        }
        dependencies.insert(reference.root);
    }
    Ok(())
}

fn collect_template_strings(
    value: &Value,
    path: &mut Vec<PathStep>,
    out: &mut Vec<(Vec<PathStep>, String)>,
) {
    match value {
        Value::String(s) => {
            if kro_expr::is_template(s) {
                out.push((path.clone(), s.clone()));
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathStep::Key(key.clone()));
                collect_template_strings(child, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(PathStep::Index(i));
                collect_template_strings(child, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn set_at_path(root: &mut Value, path: &[PathStep], new_value: Value) {
    let mut current = root;
    for (i, step) in path.iter().enumerate() {
        let last = i == path.len() - 1;
        match step {
            PathStep::Key(key) => {
                let Value::Object(map) = current else { return };
                if last {
                    map.insert(key.clone(), new_value);
                    return;
                }
                let Some(next) = map.get_mut(key) else { return };
                current = next;
            }
            PathStep::Index(idx) => {
                let Value::Array(items) = current else { return };
                if last {
                    if *idx < items.len() {
                        items[*idx] = new_value;
                    }
                    return;
                }
                let Some(next) = items.get_mut(*idx) else { return };
                current = next;
            }
        }
    }
}

/// Kahn's algorithm with a lexicographic tiebreak, so re-analysis of an
/// unchanged RGD reports an identical order.
fn topological_order(nodes: &BTreeMap<String, AnalyzedResource>) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|(id, node)| (id.as_str(), node.dependencies.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, node) in nodes {
        for dep in &node.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(id.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter_map(|(id, degree)| if *degree == 0 { Some(Reverse(*id)) } else { None })
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(GraphError::Cycle {
            cycle: name_cycle(nodes, &order),
        });
    }
    Ok(order)
}

/// Walk the unresolved remainder of the graph and name one cycle,
/// e.g. `a -> b -> a`.
fn name_cycle(nodes: &BTreeMap<String, AnalyzedResource>, resolved: &[String]) -> String {
    let resolved: BTreeSet<&str> = resolved.iter().map(|s| s.as_str()).collect();
    let remaining: Vec<&str> = nodes
        .keys()
        .map(|s| s.as_str())
        .filter(|id| !resolved.contains(id))
        .collect();

    for start in &remaining {
        let mut path: Vec<&str> = Vec::new();
        let mut current = *start;
        loop {
            if let Some(pos) = path.iter().position(|id| *id == current) {
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(current);
                return cycle.join(" -> ");
            }
            path.push(current);
            // follow the smallest unresolved dependency; inside a strongly
            // connected remainder this always stays in the cycle
            let next = nodes[current]
                .dependencies
                .iter()
                .map(|s| s.as_str())
                .find(|dep| !resolved.contains(dep));
            match next {
                Some(dep) => current = dep,
                None => break,
            }
        }
    }
    "unknown".to_string()
}
