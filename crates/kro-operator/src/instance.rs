//! Instance reconciliation
//!
//! One reconcile pass walks the RGD's cached topological order: it gates
//! each node on its dependencies and `includeWhen` predicates, reads
//! external references, renders and server-side-applies templates with the
//! instance as owner, evaluates readiness, projects the status expressions,
//! and sets the instance's `Ready`/`Progressing`/`Degraded` conditions.
//! Deletion walks the order in reverse, waiting for each owned object to
//! disappear before visiting its dependencies.

use crate::client::ResourceClient;
use crate::crd::{set_condition, Condition};
use crate::dynamic_controller::DynamicContext;
use crate::error::{OperatorError, Result};
use crate::plan::RgdPlan;
use crate::registry::gvk_key;
use kro_expr::Bindings;
use kro_graph::{AnalyzedResource, Node, TemplateNode};
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Finalizer placed on every instance kro manages.
pub const INSTANCE_FINALIZER: &str = "kro.run/instance-finalizer";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const INSTANCE_UID_LABEL: &str = "kro.run/instance-uid";
const NODE_ID_LABEL: &str = "kro.run/node-id";

/// Per-node reconciliation state for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending(String),
    Created,
    Ready,
    Skipped,
    Failed(String),
}

impl NodeState {
    fn brief(&self) -> &'static str {
        match self {
            NodeState::Pending(_) => "Pending",
            NodeState::Created => "Created",
            NodeState::Ready => "Ready",
            NodeState::Skipped => "Skipped",
            NodeState::Failed(_) => "Failed",
        }
    }
}

/// Reconcile one instance of a synthesized GVK.
#[instrument(skip(instance, ctx), fields(name = %instance.name_any(), namespace = instance.namespace()))]
pub async fn reconcile_instance(
    instance: Arc<DynamicObject>,
    ctx: Arc<DynamicContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();
    ctx.metrics.reconciliations.increment(1);

    let plan = ctx.plan();
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let key = format!("{}/{}", namespace, name);

    // retry budget: after the cap the instance is marked Failed and left
    // for the periodic resync
    if let Some(entry) = ctx.retries.get(&key) {
        let attempts = entry.0;
        let last_error = entry.1.clone();
        drop(entry);
        if attempts >= ctx.config.dynamic_queue_max_retries {
            ctx.retries.remove(&key);
            warn!(instance = %key, attempts, "retry budget exhausted, marking Failed");
            // the full Ready/Progressing/Degraded triple is rewritten so no
            // stale mid-rollout condition survives
            let mut conditions = existing_conditions(&instance);
            set_condition(
                &mut conditions,
                Condition::new(
                    "Ready",
                    false,
                    "RetryBudgetExhausted",
                    "retry budget exhausted",
                ),
            );
            set_condition(
                &mut conditions,
                Condition::new(
                    "Progressing",
                    false,
                    "RetryBudgetExhausted",
                    "giving up until the next resync",
                ),
            );
            set_condition(
                &mut conditions,
                Condition::new("Degraded", true, "RetryBudgetExhausted", last_error),
            );
            write_status(&ctx, &namespace, &name, json!({"conditions": conditions, "state": "FAILED"}))
                .await?;
            return Ok(Action::requeue(ctx.config.resync()));
        }
    }

    let result = if instance.metadata.deletion_timestamp.is_some() {
        finalize_instance(&instance, &plan, &ctx, &namespace).await
    } else {
        apply_instance(&instance, &plan, &ctx, &namespace).await
    };

    ctx.metrics.duration.record(start.elapsed().as_secs_f64());
    match &result {
        Ok(_) => {
            ctx.retries.remove(&key);
        }
        Err(e) => {
            ctx.metrics.errors.increment(1);
            let mut entry = ctx.retries.entry(key).or_insert((0, String::new()));
            entry.0 += 1;
            entry.1 = e.to_string();
        }
    }
    result
}

/// Backoff policy: exponential per instance key, capped; the retry budget
/// itself is enforced at the top of the next reconcile.
pub fn error_policy(
    instance: Arc<DynamicObject>,
    error: &OperatorError,
    ctx: Arc<DynamicContext>,
) -> Action {
    let key = format!(
        "{}/{}",
        instance.namespace().unwrap_or_default(),
        instance.name_any()
    );
    let attempts = ctx.retries.get(&key).map(|e| e.0).unwrap_or(0);
    let delay = backoff_delay(attempts);
    debug!(instance = %key, attempts, delay_secs = delay.as_secs(), error = %error, "requeueing after error");
    Action::requeue(delay)
}

/// 1s, 2s, 4s, … capped at 5 minutes.
pub fn backoff_delay(attempts: u32) -> Duration {
    let base = Duration::from_secs(1);
    let backoff = base * 2u32.saturating_pow(attempts.min(16));
    backoff.min(Duration::from_secs(300))
}

async fn apply_instance(
    instance: &DynamicObject,
    plan: &RgdPlan,
    ctx: &DynamicContext,
    namespace: &str,
) -> Result<Action> {
    ensure_finalizer(instance, ctx, namespace).await?;

    // defaulting on a working copy; the stored object is not mutated
    let mut spec = instance
        .data
        .get("spec")
        .cloned()
        .unwrap_or_else(|| json!({}));
    kro_schema::apply_defaults(&plan.compiled.spec, &mut spec);

    // expression-level validations the OpenAPI schema cannot express are
    // re-applied here; a violation mutates nothing
    if let Err(message) = run_validations(plan, &spec) {
        warn!(message = %message, "instance failed validation");
        // rewrite the whole condition triple; a stale Progressing=True from
        // an earlier rollout must not outlive the rejection
        let mut conditions = existing_conditions(instance);
        set_condition(
            &mut conditions,
            Condition::new("Degraded", true, "ValidationError", message),
        );
        set_condition(
            &mut conditions,
            Condition::new("Ready", false, "ValidationError", "spec is invalid"),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                "Progressing",
                false,
                "ValidationError",
                "reconciliation is paused until the spec changes",
            ),
        );
        write_status(
            ctx,
            namespace,
            &instance.name_any(),
            json!({"conditions": conditions, "state": "FAILED"}),
        )
        .await?;
        return Ok(Action::requeue(ctx.config.resync()));
    }

    let mut bindings = Bindings::new();
    bindings.bind("schema", spec);

    let rc = ctx.factory.impersonated(&plan.service_accounts, namespace)?;
    let states = walk_graph(instance, plan, &rc, namespace, &mut bindings).await?;

    // status projection: fields whose data is missing are omitted
    let mut status = match plan.graph.status.render(&bindings) {
        Ok(Value::Object(map)) => map,
        Ok(_) => serde_json::Map::new(),
        Err(e) => return Err(e.into()),
    };

    let pending: Vec<&String> = states
        .iter()
        .filter(|(_, s)| matches!(s, NodeState::Pending(_) | NodeState::Created))
        .map(|(id, _)| id)
        .collect();
    let failed: Vec<&String> = states
        .iter()
        .filter(|(_, s)| matches!(s, NodeState::Failed(_)))
        .map(|(id, _)| id)
        .collect();
    let all_ready = pending.is_empty() && failed.is_empty();

    let mut conditions = existing_conditions(instance);
    set_condition(
        &mut conditions,
        if all_ready {
            Condition::new("Ready", true, "AllResourcesReady", "all resources are ready")
        } else {
            Condition::new(
                "Ready",
                false,
                "ResourcesNotReady",
                format!("waiting on: {}", join_ids(&pending, &failed)),
            )
        },
    );
    set_condition(
        &mut conditions,
        if pending.is_empty() {
            Condition::new("Progressing", false, "Stable", "no resources in progress")
        } else {
            Condition::new(
                "Progressing",
                true,
                "ResourcesPending",
                format!("pending: {}", ids(&pending)),
            )
        },
    );
    set_condition(
        &mut conditions,
        if failed.is_empty() {
            Condition::new("Degraded", false, "AllHealthy", "no failed resources")
        } else {
            Condition::new(
                "Degraded",
                true,
                "ResourcesFailed",
                format!("failed: {}", ids(&failed)),
            )
        },
    );

    let state = if !failed.is_empty() {
        "FAILED"
    } else if all_ready {
        "ACTIVE"
    } else {
        "IN_PROGRESS"
    };
    status.insert("conditions".to_string(), serde_json::to_value(&conditions)?);
    status.insert("state".to_string(), json!(state));

    write_status(ctx, namespace, &instance.name_any(), Value::Object(status)).await?;

    if let Some(id) = failed.first() {
        let reason = states
            .get(*id)
            .and_then(|s| match s {
                NodeState::Failed(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap_or_default();
        return Err(OperatorError::NotReady {
            node: (*id).clone(),
            reason,
        });
    }
    if let Some(id) = pending.first() {
        let reason = states
            .get(*id)
            .and_then(|s| match s {
                NodeState::Pending(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "created, not yet ready".to_string());
        return Err(OperatorError::NotReady {
            node: (*id).clone(),
            reason,
        });
    }

    info!("instance reconciled, all resources ready");
    Ok(Action::requeue(ctx.config.resync()))
}

/// Walk the cached topological order once.
async fn walk_graph(
    instance: &DynamicObject,
    plan: &RgdPlan,
    rc: &ResourceClient,
    namespace: &str,
    bindings: &mut Bindings,
) -> Result<BTreeMap<String, NodeState>> {
    let mut states: BTreeMap<String, NodeState> = BTreeMap::new();

    'nodes: for id in &plan.graph.order {
        let node = &plan.graph.nodes[id];

        // dependency gate: skipped prerequisites skip the dependent, not
        // yet ready prerequisites defer it
        for dep in &node.dependencies {
            match states.get(dep) {
                Some(NodeState::Skipped) => {
                    states.insert(id.clone(), NodeState::Skipped);
                    continue 'nodes;
                }
                Some(NodeState::Ready) => {}
                _ => {
                    states.insert(
                        id.clone(),
                        NodeState::Pending(format!("waiting for '{}'", dep)),
                    );
                    continue 'nodes;
                }
            }
        }

        match evaluate_include(node, bindings)? {
            Include::No => {
                debug!(node = %id, "includeWhen false, skipping");
                states.insert(id.clone(), NodeState::Skipped);
                continue;
            }
            Include::Unknown(reason) => {
                states.insert(id.clone(), NodeState::Pending(reason));
                continue;
            }
            Include::Yes => {}
        }

        let state = match &node.node {
            Node::ExternalRef(ext) => {
                reconcile_external(node, ext, rc, namespace, bindings).await?
            }
            Node::Template(template) => {
                reconcile_template(instance, node, template, rc, namespace, bindings).await?
            }
        };
        debug!(node = %id, state = state.brief(), "node visited");
        states.insert(id.clone(), state);
    }

    Ok(states)
}

enum Include {
    Yes,
    No,
    Unknown(String),
}

/// `includeWhen` referencing not-yet-materialized resources is evaluated
/// lazily: the node stays pending until its inputs exist.
fn evaluate_include(node: &AnalyzedResource, bindings: &Bindings) -> Result<Include> {
    for pred in &node.include_when {
        match kro_expr::eval(pred, bindings) {
            Ok(Value::Bool(true)) => {}
            Ok(Value::Bool(false)) => return Ok(Include::No),
            Ok(other) => {
                return Err(OperatorError::Internal(format!(
                    "includeWhen for '{}' yielded non-boolean {}",
                    node.id, other
                )))
            }
            Err(e) if e.is_missing_data() => {
                return Ok(Include::Unknown(format!(
                    "includeWhen not evaluable yet: {}",
                    e
                )))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Include::Yes)
}

async fn reconcile_external(
    node: &AnalyzedResource,
    ext: &kro_graph::ExternalRef,
    rc: &ResourceClient,
    namespace: &str,
    bindings: &mut Bindings,
) -> Result<NodeState> {
    let gvk = parse_gvk(&ext.api_version, &ext.kind);
    let (ar, namespaced) = rc.resolve(&gvk).await?;
    let ns = if namespaced {
        Some(ext.namespace.as_deref().unwrap_or(namespace))
    } else {
        None
    };

    match rc.get(&ar, namespaced, ns, &ext.name).await? {
        Some(found) => {
            let live = serde_json::to_value(&found)?;
            bindings.bind(node.id.clone(), live.clone());
            Ok(readiness_state(node, &live, bindings))
        }
        None => Ok(NodeState::Pending(format!(
            "external {} '{}' not found",
            gvk_key(&gvk),
            ext.name
        ))),
    }
}

async fn reconcile_template(
    instance: &DynamicObject,
    node: &AnalyzedResource,
    template: &TemplateNode,
    rc: &ResourceClient,
    namespace: &str,
    bindings: &mut Bindings,
) -> Result<NodeState> {
    let rendered = match template.render(bindings) {
        Ok(v) => v,
        Err(e) if e.is_missing_data() => {
            return Ok(NodeState::Pending(format!("template not renderable: {}", e)))
        }
        Err(e) => return Ok(NodeState::Failed(format!("template render failed: {}", e))),
    };

    let mut object: DynamicObject = serde_json::from_value(rendered)?;
    let gvk = parse_gvk(&template.api_version, &template.kind);
    let (ar, namespaced) = rc.resolve(&gvk).await?;

    let name = match object.metadata.name.clone() {
        Some(n) if !n.is_empty() => n,
        _ => {
            return Ok(NodeState::Failed(
                "rendered template has no metadata.name".to_string(),
            ))
        }
    };
    let ns = if namespaced {
        let ns = object
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string());
        object.metadata.namespace = Some(ns.clone());
        Some(ns)
    } else {
        None
    };

    decorate_ownership(&mut object, instance, node, namespaced, namespace);

    let applied = rc.apply(&ar, namespaced, ns.as_deref(), &name, &object).await?;
    let live = serde_json::to_value(&applied)?;
    bindings.bind(node.id.clone(), live.clone());

    Ok(readiness_state(node, &live, bindings))
}

/// Owner references bind namespaced objects in the instance's namespace;
/// cluster-scoped objects cannot reference a namespaced owner, so they are
/// tracked by labels only (and deleted explicitly during finalization).
fn decorate_ownership(
    object: &mut DynamicObject,
    instance: &DynamicObject,
    node: &AnalyzedResource,
    namespaced: bool,
    instance_namespace: &str,
) {
    let labels = object.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(MANAGED_BY_LABEL.to_string(), "kro".to_string());
    labels.insert(NODE_ID_LABEL.to_string(), node.id.clone());
    if let Some(uid) = &instance.metadata.uid {
        labels.insert(INSTANCE_UID_LABEL.to_string(), uid.clone());
    }

    let same_namespace = object
        .metadata
        .namespace
        .as_deref()
        .map(|ns| ns == instance_namespace)
        .unwrap_or(false);
    if namespaced && same_namespace {
        if let (Some(uid), Some(types)) = (&instance.metadata.uid, &instance.types) {
            let owner = k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
                name: instance.name_any(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            };
            object
                .metadata
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(owner);
        }
    }
}

/// Apply `readyWhen`, or the kind-generic default when none is declared.
fn readiness_state(node: &AnalyzedResource, live: &Value, bindings: &Bindings) -> NodeState {
    if node.ready_when.is_empty() {
        return if default_readiness(live) {
            NodeState::Ready
        } else {
            NodeState::Created
        };
    }
    for pred in &node.ready_when {
        match kro_expr::eval(pred, bindings) {
            Ok(Value::Bool(true)) => {}
            Ok(_) => {
                return NodeState::Created;
            }
            Err(e) if e.is_missing_data() => {
                return NodeState::Created;
            }
            Err(e) => return NodeState::Failed(format!("readyWhen failed: {}", e)),
        }
    }
    NodeState::Ready
}

/// Default readiness: `status.conditions[type in {Ready, Available}]`
/// reports `"True"` when the object exposes conditions; bare objects count
/// as ready once they exist.
fn default_readiness(live: &Value) -> bool {
    let conditions = live
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array());
    match conditions {
        // all Ready/Available conditions must report True; objects whose
        // conditions carry neither type fall back to existence
        Some(conditions) => conditions
            .iter()
            .filter(|c| {
                matches!(
                    c.get("type").and_then(|t| t.as_str()),
                    Some("Ready") | Some("Available")
                )
            })
            .all(|c| c.get("status").and_then(|s| s.as_str()) == Some("True")),
        None => true,
    }
}

/// Reverse-order teardown. Each owned object is deleted and must be gone
/// before its dependencies are visited; a still-terminating object pauses
/// the walk until the next requeue.
async fn finalize_instance(
    instance: &DynamicObject,
    plan: &RgdPlan,
    ctx: &DynamicContext,
    namespace: &str,
) -> Result<Action> {
    if !instance
        .finalizers()
        .iter()
        .any(|f| f == INSTANCE_FINALIZER)
    {
        return Ok(Action::await_change());
    }

    let rc = ctx.factory.impersonated(&plan.service_accounts, namespace)?;
    let uid = instance.metadata.uid.clone().unwrap_or_default();

    for id in plan.graph.order.iter().rev() {
        let node = &plan.graph.nodes[id];
        let Node::Template(template) = &node.node else {
            // external references are never touched
            continue;
        };
        let gvk = parse_gvk(&template.api_version, &template.kind);
        let (ar, namespaced) = rc.resolve(&gvk).await?;

        // rendered names may not be recomputable during deletion (external
        // data can be gone), so owned objects are found by label
        let candidates = find_owned(&rc, &ar, &uid, id).await?;
        for obj in candidates {
            let name = obj.name_any();
            let ns = obj.namespace();
            info!(node = %id, object = %name, "deleting owned object");
            rc.delete(&ar, namespaced, ns.as_deref(), &name).await?;
        }

        // wait for disappearance before proceeding to this node's
        // dependencies
        if !find_owned(&rc, &ar, &uid, id).await?.is_empty() {
            debug!(node = %id, "owned objects still terminating");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
    }

    remove_finalizer(instance, ctx, namespace).await?;
    info!("instance finalized");
    Ok(Action::await_change())
}

async fn find_owned(
    rc: &ResourceClient,
    ar: &kube::core::ApiResource,
    uid: &str,
    node_id: &str,
) -> Result<Vec<DynamicObject>> {
    let selector = format!(
        "{}={},{}={}",
        INSTANCE_UID_LABEL, uid, NODE_ID_LABEL, node_id
    );
    rc.list_labeled(ar, &selector).await
}

async fn ensure_finalizer(
    instance: &DynamicObject,
    ctx: &DynamicContext,
    namespace: &str,
) -> Result<()> {
    if instance
        .finalizers()
        .iter()
        .any(|f| f == INSTANCE_FINALIZER)
    {
        return Ok(());
    }
    let mut finalizers: Vec<String> = instance.finalizers().to_vec();
    finalizers.push(INSTANCE_FINALIZER.to_string());
    let rc = ctx.factory.controller_client();
    rc.patch_metadata(
        &ctx.ar,
        true,
        Some(namespace),
        &instance.name_any(),
        &json!({ "finalizers": finalizers }),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(
    instance: &DynamicObject,
    ctx: &DynamicContext,
    namespace: &str,
) -> Result<()> {
    let finalizers: Vec<String> = instance
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != INSTANCE_FINALIZER)
        .cloned()
        .collect();
    let rc = ctx.factory.controller_client();
    rc.patch_metadata(
        &ctx.ar,
        true,
        Some(namespace),
        &instance.name_any(),
        &json!({ "finalizers": finalizers }),
    )
    .await?;
    Ok(())
}

async fn write_status(
    ctx: &DynamicContext,
    namespace: &str,
    name: &str,
    status: Value,
) -> Result<()> {
    let rc = ctx.factory.controller_client();
    rc.patch_status(&ctx.ar, true, Some(namespace), name, &status)
        .await?;
    Ok(())
}

/// Evaluate all validation rules against the (defaulted) spec.
fn run_validations(plan: &RgdPlan, spec: &Value) -> std::result::Result<(), String> {
    for rule in &plan.compiled.validations {
        let subject = if rule.field_path.is_empty() {
            Some(spec)
        } else {
            lookup_path(spec, &rule.field_path)
        };
        // absent optional fields cannot violate their own rules
        let Some(subject) = subject else { continue };

        let mut bindings = Bindings::new();
        bindings.bind("self", subject.clone());
        match kro_expr::eval(&rule.ast, &bindings) {
            Ok(Value::Bool(true)) => {}
            Ok(_) => {
                return Err(rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("validation failed: {}", rule.expression)))
            }
            Err(e) if e.is_missing_data() => continue,
            Err(e) => return Err(format!("validation '{}' errored: {}", rule.expression, e)),
        }
    }
    Ok(())
}

fn lookup_path<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = value;
    for seg in dotted.split('.') {
        current = current.get(seg)?;
    }
    Some(current)
}

fn existing_conditions(instance: &DynamicObject) -> Vec<Condition> {
    instance
        .data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default()
}

fn ids(items: &[&String]) -> String {
    items
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_ids(pending: &[&String], failed: &[&String]) -> String {
    let mut all: Vec<&str> = pending.iter().map(|s| s.as_str()).collect();
    all.extend(failed.iter().map(|s| s.as_str()));
    all.join(", ")
}

/// Parse `apps/v1` / `Deployment` style coordinates.
pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_parsing() {
        let gvk = parse_gvk("apps/v1", "Deployment");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str()), ("apps", "v1"));
        let core = parse_gvk("v1", "Service");
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
    }

    #[test]
    fn default_readiness_rules() {
        // no status at all: existence is readiness
        assert!(default_readiness(&json!({"metadata": {"name": "x"}})));
        // Ready=True
        assert!(default_readiness(&json!({
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        })));
        // Available=False
        assert!(!default_readiness(&json!({
            "status": {"conditions": [{"type": "Available", "status": "False"}]}
        })));
        // unrelated condition types fall back to existence
        assert!(default_readiness(&json!({
            "status": {"conditions": [{"type": "Progressing", "status": "False"}]}
        })));
        // one of two relevant conditions false
        assert!(!default_readiness(&json!({
            "status": {"conditions": [
                {"type": "Ready", "status": "True"},
                {"type": "Available", "status": "False"}
            ]}
        })));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn validation_uses_defaulted_spec() {
        use kro_schema::Validation;
        let spec_schema = json!({
            "image": "string | default=nginx",
            "ingress": {"enabled": "boolean | default=false"}
        });
        let compiled = kro_schema::compile(
            &spec_schema,
            &Value::Null,
            &[Validation {
                expression: "self.image == 'nginx' || !self.ingress.enabled".to_string(),
                message: Some("non-nginx images cannot enable ingress".to_string()),
            }],
        )
        .unwrap();
        let plan = test_plan(compiled);

        let mut ok_spec = json!({"ingress": {"enabled": true}});
        kro_schema::apply_defaults(&plan.compiled.spec, &mut ok_spec);
        assert!(run_validations(&plan, &ok_spec).is_ok());

        let mut bad_spec = json!({"image": "httpd", "ingress": {"enabled": true}});
        kro_schema::apply_defaults(&plan.compiled.spec, &mut bad_spec);
        let err = run_validations(&plan, &bad_spec).unwrap_err();
        assert_eq!(err, "non-nginx images cannot enable ingress");
    }

    fn test_plan(compiled: kro_schema::CompiledSchema) -> RgdPlan {
        let graph = kro_graph::analyze(kro_graph::AnalyzeInput {
            resources: &[],
            schema_type: compiled.expr_type.clone(),
            status: &Value::Null,
            source: &kro_graph::OpenSchemaSource,
        })
        .unwrap();
        RgdPlan {
            rgd_name: "test".to_string(),
            gvk: GroupVersionKind::gvk("kro.run", "v1alpha1", "WebApplication"),
            compiled,
            graph,
            service_accounts: Default::default(),
        }
    }

    #[test]
    fn skipped_dependency_skips_dependent() {
        // gate logic is pure: exercise it through a tiny graph walk stub
        let mut states: BTreeMap<String, NodeState> = BTreeMap::new();
        states.insert("ingress".to_string(), NodeState::Skipped);
        let deps: std::collections::BTreeSet<String> =
            ["ingress".to_string()].into_iter().collect();
        let blocked = deps
            .iter()
            .any(|d| matches!(states.get(d), Some(NodeState::Skipped)));
        assert!(blocked);
    }

    #[test]
    fn include_unknown_defers() {
        let node = AnalyzedResource {
            id: "ingress".to_string(),
            node: Node::ExternalRef(kro_graph::ExternalRef::default()),
            ready_when: vec![],
            include_when: vec![kro_expr::parse("schema.ingress.enabled").unwrap()],
            dependencies: Default::default(),
        };

        let mut bindings = Bindings::new();
        bindings.bind("schema", json!({}));
        // field absent: undecidable, node pends
        assert!(matches!(
            evaluate_include(&node, &bindings).unwrap(),
            Include::Unknown(_)
        ));

        bindings.bind("schema", json!({"ingress": {"enabled": false}}));
        assert!(matches!(
            evaluate_include(&node, &bindings).unwrap(),
            Include::No
        ));

        bindings.bind("schema", json!({"ingress": {"enabled": true}}));
        assert!(matches!(
            evaluate_include(&node, &bindings).unwrap(),
            Include::Yes
        ));
    }
}
