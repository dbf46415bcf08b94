//! ResourceGraphDefinition controller
//!
//! Drives the RGD lifecycle: Validating -> Compiling -> Analyzing ->
//! Registering -> Active. Any failure flips the RGD to Inactive with a
//! condition naming the error class, while a previously accepted plan
//! keeps serving running instances. Deletion tears the synthesized CRD and
//! dynamic controller down through a finalizer.

use crate::client::{ClientFactory, FIELD_MANAGER};
use crate::config::KroConfig;
use crate::crd::{
    set_condition, Condition, Dependency, ResourceGraphDefinition, ResourceGraphDefinitionStatus,
    ResourceInformation, RgdState,
};
use crate::crd_builder::build_instance_crd;
use crate::dynamic_controller;
use crate::error::{OperatorError, Result};
use crate::plan::RgdPlan;
use crate::registry::{gvk_key, ControllerRegistry};
use crate::schema_source::build_schema_source;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kro_graph::{analyze, AnalyzeInput};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::ApiResource;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::ResourceExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer guarding RGD teardown.
pub const RGD_FINALIZER: &str = "kro.run/resource-graph-definition-finalizer";

/// Requeue interval for healthy RGDs.
const DEFAULT_REQUEUE_SECONDS: u64 = 600;

/// Base interval for error backoff.
const ERROR_REQUEUE_SECONDS: u64 = 10;

/// Maximum error backoff.
const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

/// Context passed to the RGD controller
pub struct RgdContext {
    pub factory: Arc<ClientFactory>,
    pub registry: Arc<ControllerRegistry>,
    pub config: Arc<KroConfig>,
    pub metrics: RgdMetrics,
    /// Per-RGD error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Process-wide fatal signal; notified when a worker panics
    pub fatal: Arc<Notify>,
}

/// Metrics for the RGD controller
#[derive(Clone)]
pub struct RgdMetrics {
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl RgdMetrics {
    pub fn new() -> Self {
        RgdMetrics {
            reconciliations: metrics::counter!("kro_rgd_reconciliations_total"),
            errors: metrics::counter!("kro_rgd_reconciliation_errors_total"),
            duration: metrics::histogram!("kro_rgd_reconciliation_duration_seconds"),
        }
    }
}

impl Default for RgdMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the ResourceGraphDefinition controller until `shutdown` fires.
pub async fn run_rgd_controller(
    ctx: Arc<RgdContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.factory.raw());

    info!("starting ResourceGraphDefinition controller");

    Controller::new(api, watcher::Config::default())
        .with_config(
            controller::Config::default().concurrency(ctx.config.rgd_concurrent_reconciles),
        )
        .graceful_shutdown_on(async move {
            let _ = shutdown.changed().await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(name = %obj.name, ?action, "RGD reconciliation completed");
                }
                Err(e) => {
                    error!(error = %e, "RGD reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation entry point
#[instrument(skip(rgd, ctx), fields(name = %rgd.name_any()))]
async fn reconcile(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<RgdContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();
    ctx.metrics.reconciliations.increment(1);

    let api: Api<ResourceGraphDefinition> = Api::all(ctx.factory.raw());
    let name = rgd.name_any();

    // panic boundary: errors never escape the reconciler as panics
    let result = AssertUnwindSafe(finalizer(&api, RGD_FINALIZER, rgd, |event| async {
        match event {
            FinalizerEvent::Apply(rgd) => apply_rgd(rgd, ctx.clone()).await,
            FinalizerEvent::Cleanup(rgd) => cleanup_rgd(rgd, ctx.clone()).await,
        }
    }))
    .catch_unwind()
    .await;

    ctx.metrics.duration.record(start.elapsed().as_secs_f64());

    match result {
        Ok(Ok(action)) => {
            ctx.error_counts.remove(&name);
            Ok(action)
        }
        Ok(Err(e)) => {
            ctx.metrics.errors.increment(1);
            Err(OperatorError::Internal(e.to_string()))
        }
        Err(payload) => {
            ctx.metrics.errors.increment(1);
            let err = OperatorError::from_panic(payload);
            error!(error = %err, "panic in RGD reconciler, initiating shutdown");
            ctx.fatal.notify_one();
            Err(err)
        }
    }
}

/// Accept (or re-accept) an RGD: compile, analyze, register, activate.
#[instrument(skip(rgd, ctx))]
async fn apply_rgd(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<RgdContext>,
) -> Result<Action> {
    let name = rgd.name_any();
    info!(name = %name, "reconciling ResourceGraphDefinition");

    match accept_rgd(&rgd, &ctx).await {
        Ok(plan) => {
            let status = active_status(&rgd, &plan);
            update_status(&ctx, &name, status).await?;
            info!(name = %name, gvk = %gvk_key(&plan.gvk), "ResourceGraphDefinition is Active");
            Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)))
        }
        Err(e) if e.is_terminal_for_rgd() => {
            // terminal: flip to Inactive with the taxonomy reason, keep the
            // last-good plan serving existing instances
            warn!(name = %name, error = %e, "ResourceGraphDefinition rejected");
            let status = inactive_status(&rgd, &e);
            update_status(&ctx, &name, status).await?;
            Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)))
        }
        Err(e) => Err(e),
    }
}

/// The acceptance pipeline; returns the plan now being served.
async fn accept_rgd(
    rgd: &ResourceGraphDefinition,
    ctx: &RgdContext,
) -> Result<RgdPlan> {
    let name = rgd.name_any();

    // Validating
    rgd.spec
        .validate()
        .map_err(|e| OperatorError::Registration(format!("invalid spec: {}", e)))?;
    let gvk = rgd.spec.instance_gvk();

    if let Some(owner) = ctx.registry.gvk_owner(&gvk, &name) {
        return Err(OperatorError::GvkConflict {
            gvk: gvk_key(&gvk),
            owner,
        });
    }

    // Compiling (4.A)
    let compiled = kro_schema::compile(
        &rgd.spec.schema.spec,
        &rgd.spec.schema.types,
        &rgd.spec.schema_validations(),
    )?;

    // Analyzing (4.C); referent types are pre-fetched from cluster CRDs
    let definitions: Vec<kro_graph::ResourceDefinition> = rgd
        .spec
        .resources
        .iter()
        .map(|r| r.to_definition())
        .collect();
    let source = build_schema_source(&ctx.factory.raw(), &definitions).await?;
    let graph = analyze(AnalyzeInput {
        resources: &definitions,
        schema_type: compiled.expr_type.clone(),
        status: &rgd.spec.schema.status,
        source: &source,
    })?;

    let plan = RgdPlan {
        rgd_name: name.clone(),
        gvk: gvk.clone(),
        compiled,
        graph,
        service_accounts: rgd.spec.default_service_accounts.clone(),
    };

    // Registering: create or update the CRD, then ensure the dynamic
    // controller runs on the new plan
    let crd = build_instance_crd(rgd, &plan);
    let crd_api: Api<CustomResourceDefinition> = Api::all(ctx.factory.raw());
    crd_api
        .patch(
            &crd.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&crd),
        )
        .await
        .map_err(|e| OperatorError::Registration(format!("applying CRD: {}", e)))?;

    if !ctx.registry.swap_plan(&name, plan.clone()) {
        // not running yet, or the GVK changed: (re)start the controller
        if let Some(old) = ctx.registry.take(&name) {
            warn!(name = %name, old_gvk = %gvk_key(&old.gvk), "GVK changed, restarting dynamic controller");
            old.stop(ctx.config.shutdown_timeout()).await;
        }
        let ar = ApiResource::from_gvk_with_plural(&gvk, &crd.spec.names.plural);
        let handle = dynamic_controller::spawn(
            ar,
            plan.clone(),
            ctx.factory.clone(),
            ctx.config.clone(),
            ctx.fatal.clone(),
        );
        ctx.registry.insert(&name, handle);
    }

    Ok(plan)
}

/// Teardown on RGD deletion.
#[instrument(skip(rgd, ctx))]
async fn cleanup_rgd(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<RgdContext>,
) -> Result<Action> {
    let name = rgd.name_any();
    info!(name = %name, "cleaning up ResourceGraphDefinition");

    let gvk = rgd.spec.instance_gvk();
    let crd_api: Api<CustomResourceDefinition> = Api::all(ctx.factory.raw());
    let crd_name = crd_name_for(&rgd);

    if let Some(crd) = crd_api.get_opt(&crd_name).await? {
        if !ctx.config.allow_crd_deletion {
            let ar = ApiResource::from_gvk_with_plural(&gvk, &crd.spec.names.plural);
            let rc = ctx.factory.controller_client();
            if rc.any_exist(&ar).await? {
                return Err(OperatorError::TeardownBlocked(format!(
                    "CRD {} still has instances and allowCRDDeletion is disabled",
                    crd_name
                )));
            }
        }
    }

    // stop the dynamic controller before removing its API
    if let Some(handle) = ctx.registry.take(&name) {
        handle.stop(ctx.config.shutdown_timeout()).await;
    }

    match crd_api.delete(&crd_name, &DeleteParams::default()).await {
        Ok(_) => info!(name = %name, crd = %crd_name, "deleted synthesized CRD"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    ctx.factory.controller_client().forget(&gvk);

    info!(name = %name, "cleanup complete");
    Ok(Action::await_change())
}

fn crd_name_for(rgd: &ResourceGraphDefinition) -> String {
    // mirror of crd_builder naming without needing a full plan
    let gvk = rgd.spec.instance_gvk();
    let plan_like = crate::crd_builder::pluralize(&gvk.kind);
    format!("{}.{}", plan_like, gvk.group)
}

fn active_status(rgd: &ResourceGraphDefinition, plan: &RgdPlan) -> ResourceGraphDefinitionStatus {
    let mut conditions = rgd
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        Condition::new(
            "Ready",
            true,
            "Accepted",
            format!("serving {}", gvk_key(&plan.gvk)),
        )
        .with_observed_generation(rgd.metadata.generation),
    );

    ResourceGraphDefinitionStatus {
        state: Some(RgdState::Active),
        topological_order: plan.graph.order.clone(),
        conditions,
        resources: plan
            .graph
            .order
            .iter()
            .map(|id| ResourceInformation {
                id: id.clone(),
                dependencies: plan.graph.nodes[id]
                    .dependencies
                    .iter()
                    .map(|dep| Dependency { id: dep.clone() })
                    .collect(),
            })
            .collect(),
    }
}

fn inactive_status(
    rgd: &ResourceGraphDefinition,
    error: &OperatorError,
) -> ResourceGraphDefinitionStatus {
    let mut conditions = rgd
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        Condition::new("Ready", false, error.reason(), error.to_string())
            .with_observed_generation(rgd.metadata.generation),
    );

    // keep the last published order so operators can still inspect it
    ResourceGraphDefinitionStatus {
        state: Some(RgdState::Inactive),
        topological_order: rgd
            .status
            .as_ref()
            .map(|s| s.topological_order.clone())
            .unwrap_or_default(),
        conditions,
        resources: rgd
            .status
            .as_ref()
            .map(|s| s.resources.clone())
            .unwrap_or_default(),
    }
}

async fn update_status(
    ctx: &RgdContext,
    name: &str,
    status: ResourceGraphDefinitionStatus,
) -> Result<()> {
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.factory.raw());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Error policy: exponential backoff per RGD name.
fn error_policy(
    rgd: Arc<ResourceGraphDefinition>,
    error: &OperatorError,
    ctx: Arc<RgdContext>,
) -> Action {
    let key = rgd.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let delay = (base * 2u32.saturating_pow((retries - 1).min(5)))
        .min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "RGD reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ResourceGraphDefinitionSpec;
    use crate::crd_builder::crd_name;
    use kro_graph::OpenSchemaSource;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn sample_rgd() -> ResourceGraphDefinition {
        let spec: ResourceGraphDefinitionSpec = serde_json::from_value(json!({
            "schema": {
                "kind": "WebApplication",
                "apiVersion": "v1alpha1",
                "spec": {"name": "string | required=true"}
            },
            "resources": [
                {"id": "deployment", "template": {
                    "apiVersion": "apps/v1", "kind": "Deployment",
                    "metadata": {"name": "${schema.name}"}
                }},
                {"id": "service", "template": {
                    "apiVersion": "v1", "kind": "Service",
                    "metadata": {"name": "${deployment.metadata.name}"}
                }}
            ]
        }))
        .unwrap();
        let mut rgd = ResourceGraphDefinition::new("web-application", spec);
        rgd.metadata.generation = Some(2);
        rgd
    }

    fn sample_plan(rgd: &ResourceGraphDefinition) -> RgdPlan {
        let compiled = kro_schema::compile(
            &rgd.spec.schema.spec,
            &rgd.spec.schema.types,
            &rgd.spec.schema_validations(),
        )
        .unwrap();
        let definitions: Vec<_> = rgd.spec.resources.iter().map(|r| r.to_definition()).collect();
        let graph = analyze(AnalyzeInput {
            resources: &definitions,
            schema_type: compiled.expr_type.clone(),
            status: &rgd.spec.schema.status,
            source: &OpenSchemaSource,
        })
        .unwrap();
        RgdPlan {
            rgd_name: rgd.name_any(),
            gvk: rgd.spec.instance_gvk(),
            compiled,
            graph,
            service_accounts: Default::default(),
        }
    }

    #[test]
    fn active_status_publishes_order_and_dependencies() {
        let rgd = sample_rgd();
        let plan = sample_plan(&rgd);
        let status = active_status(&rgd, &plan);

        assert_eq!(status.state, Some(RgdState::Active));
        assert_eq!(status.topological_order, vec!["deployment", "service"]);
        let service = status
            .resources
            .iter()
            .find(|r| r.id == "service")
            .unwrap();
        assert_eq!(service.dependencies, vec![Dependency { id: "deployment".into() }]);

        let ready = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.observed_generation, Some(2));
    }

    #[test]
    fn inactive_status_names_the_error_class() {
        let mut rgd = sample_rgd();
        // pretend a previous acceptance published an order
        rgd.status = Some(ResourceGraphDefinitionStatus {
            state: Some(RgdState::Active),
            topological_order: vec!["deployment".into(), "service".into()],
            ..Default::default()
        });

        let err = OperatorError::Graph(kro_graph::GraphError::Cycle {
            cycle: "a -> b -> a".to_string(),
        });
        let status = inactive_status(&rgd, &err);

        assert_eq!(status.state, Some(RgdState::Inactive));
        // last-good order is preserved for inspection
        assert_eq!(status.topological_order.len(), 2);
        let ready = status
            .conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason.as_deref(), Some("GraphError"));
        assert!(ready.message.as_ref().unwrap().contains("a -> b -> a"));
    }

    #[test]
    fn crd_name_matches_builder() {
        let rgd = sample_rgd();
        let plan = sample_plan(&rgd);
        assert_eq!(crd_name_for(&rgd), crd_name(&plan));
        assert_eq!(crd_name_for(&rgd), "webapplications.kro.run");
    }

    #[test]
    fn gvk_conflict_is_terminal() {
        let err = OperatorError::GvkConflict {
            gvk: "kro.run/v1alpha1/WebApplication".to_string(),
            owner: "earlier".to_string(),
        };
        assert!(err.is_terminal_for_rgd());
        let gvk = GroupVersionKind::gvk("kro.run", "v1alpha1", "WebApplication");
        assert_eq!(gvk_key(&gvk), "kro.run/v1alpha1/WebApplication");
    }
}
