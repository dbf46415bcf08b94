//! Dynamic per-GVK controllers
//!
//! Each Active RGD gets one controller watching instances of its
//! synthesized GVK as `DynamicObject`s. Controllers are first-class values
//! owned by the registry: a plan slot the RGD controller swaps on
//! re-analysis, a shutdown channel, and the driving task.

use crate::client::ClientFactory;
use crate::config::KroConfig;
use crate::error::{OperatorError, Result};
use crate::instance::{error_policy, reconcile_instance};
use crate::plan::RgdPlan;
use crate::registry::{gvk_key, DynamicControllerHandle};
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Context shared by every worker of one dynamic controller.
pub struct DynamicContext {
    pub factory: Arc<ClientFactory>,
    pub config: Arc<KroConfig>,
    pub ar: ApiResource,
    /// Swappable last-good plan
    plan: Arc<RwLock<Arc<RgdPlan>>>,
    /// Per-instance retry counters with the last error message
    pub retries: DashMap<String, (u32, String)>,
    pub metrics: InstanceMetrics,
    /// Process-wide fatal signal; notified when a worker panics
    pub fatal: Arc<Notify>,
}

impl DynamicContext {
    pub fn plan(&self) -> Arc<RgdPlan> {
        self.plan.read().expect("plan lock poisoned").clone()
    }
}

/// Metrics for instance reconciliation, labeled per controller by name
/// prefixing convention.
#[derive(Clone)]
pub struct InstanceMetrics {
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl InstanceMetrics {
    pub fn new() -> Self {
        InstanceMetrics {
            reconciliations: metrics::counter!("kro_instance_reconciliations_total"),
            errors: metrics::counter!("kro_instance_reconciliation_errors_total"),
            duration: metrics::histogram!("kro_instance_reconciliation_duration_seconds"),
        }
    }
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a dynamic controller for a freshly accepted plan.
pub fn spawn(
    ar: ApiResource,
    plan: RgdPlan,
    factory: Arc<ClientFactory>,
    config: Arc<KroConfig>,
    fatal: Arc<Notify>,
) -> DynamicControllerHandle {
    let gvk = plan.gvk.clone();
    let plan_slot = Arc::new(RwLock::new(Arc::new(plan)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(DynamicContext {
        factory,
        config,
        ar: ar.clone(),
        plan: plan_slot.clone(),
        retries: DashMap::new(),
        metrics: InstanceMetrics::new(),
        fatal,
    });

    let join = tokio::spawn(run(ar, ctx, shutdown_rx));
    metrics::gauge!("kro_dynamic_controllers").increment(1.0);

    DynamicControllerHandle::new(gvk, plan_slot, shutdown_tx, join)
}

async fn run(ar: ApiResource, ctx: Arc<DynamicContext>, mut shutdown: watch::Receiver<bool>) {
    let gvk = ctx.plan().gvk.clone();
    info!(gvk = %gvk_key(&gvk), "starting dynamic controller");

    let api: Api<DynamicObject> = Api::all_with(ctx.factory.raw(), &ar);
    let controller_config =
        controller::Config::default().concurrency(ctx.config.dynamic_concurrent_reconciles);

    Controller::new_with(api, watcher::Config::default(), ar)
        .with_config(controller_config)
        .graceful_shutdown_on(async move {
            let _ = shutdown.changed().await;
        })
        .run(guarded_reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(name = %obj.name, namespace = ?obj.namespace, ?action, "instance reconciled");
                }
                Err(kube::runtime::controller::Error::ReconcilerFailed(e, obj)) => {
                    // transient reconcile failures are requeued by the
                    // error policy; only log
                    debug!(object = ?obj, error = %e, "instance reconcile failed");
                }
                Err(e) => {
                    error!(error = %e, "dynamic controller stream error");
                }
            }
        })
        .await;

    metrics::gauge!("kro_dynamic_controllers").decrement(1.0);
    info!(gvk = %gvk_key(&gvk), "dynamic controller drained");
}

/// Panic boundary for instance workers. Errors never escape a reconciler
/// as panics: a caught panic is logged, converted to Fatal, and the
/// process begins draining.
async fn guarded_reconcile(
    instance: Arc<DynamicObject>,
    ctx: Arc<DynamicContext>,
) -> Result<Action> {
    match AssertUnwindSafe(reconcile_instance(instance, ctx.clone()))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let err = OperatorError::from_panic(payload);
            error!(error = %err, "panic in instance reconciler, initiating shutdown");
            ctx.fatal.notify_one();
            Err(err)
        }
    }
}
