//! Registry of running dynamic controllers
//!
//! The process-wide map from RGD name to its running dynamic controller and
//! last-good plan. The mutex guards only lookup/insert/remove; handles are
//! taken out of the map before any await (stopping a controller does I/O).

use crate::plan::RgdPlan;
use kube::core::GroupVersionKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running dynamic controller for one synthesized GVK.
pub struct DynamicControllerHandle {
    pub gvk: GroupVersionKind,
    plan: Arc<RwLock<Arc<RgdPlan>>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DynamicControllerHandle {
    pub fn new(
        gvk: GroupVersionKind,
        plan: Arc<RwLock<Arc<RgdPlan>>>,
        shutdown: watch::Sender<bool>,
        join: JoinHandle<()>,
    ) -> Self {
        DynamicControllerHandle {
            gvk,
            plan,
            shutdown,
            join,
        }
    }

    /// Current plan instances reconcile against.
    pub fn plan(&self) -> Arc<RgdPlan> {
        self.plan.read().expect("plan lock poisoned").clone()
    }

    /// Swap in a newly analyzed plan; in-flight reconciles finish on the
    /// old one, the next reconcile of each instance picks up the new one.
    pub fn swap_plan(&self, plan: RgdPlan) {
        *self.plan.write().expect("plan lock poisoned") = Arc::new(plan);
    }

    /// Signal shutdown and wait for the controller to drain.
    pub async fn stop(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => info!(gvk = %gvk_key(&self.gvk), "dynamic controller stopped"),
            Ok(Err(e)) => warn!(gvk = %gvk_key(&self.gvk), error = %e, "dynamic controller task failed"),
            Err(_) => warn!(
                gvk = %gvk_key(&self.gvk),
                "dynamic controller did not drain within {:?}", timeout
            ),
        }
    }
}

/// Process-wide registry; one entry per Active RGD.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<String, DynamicControllerHandle>>,
}

impl ControllerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The GVK a given RGD is currently serving, if registered.
    pub fn registered_gvk(&self, rgd_name: &str) -> Option<GroupVersionKind> {
        self.lock().get(rgd_name).map(|h| h.gvk.clone())
    }

    /// Which RGD (other than `except`) already serves `gvk`.
    pub fn gvk_owner(&self, gvk: &GroupVersionKind, except: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|(name, handle)| {
                name.as_str() != except
                    && handle.gvk.group == gvk.group
                    && handle.gvk.version == gvk.version
                    && handle.gvk.kind == gvk.kind
            })
            .map(|(name, _)| name.clone())
    }

    /// Last-good plan for an RGD, if its controller is running.
    pub fn plan(&self, rgd_name: &str) -> Option<Arc<RgdPlan>> {
        self.lock().get(rgd_name).map(|h| h.plan())
    }

    /// Swap the plan of a running controller; false when none is running
    /// (or it serves a different GVK and must be restarted).
    pub fn swap_plan(&self, rgd_name: &str, plan: RgdPlan) -> bool {
        let map = self.lock();
        match map.get(rgd_name) {
            Some(handle) if handle.gvk == plan.gvk => {
                handle.swap_plan(plan);
                true
            }
            _ => false,
        }
    }

    pub fn insert(&self, rgd_name: &str, handle: DynamicControllerHandle) {
        if let Some(old) = self.lock().insert(rgd_name.to_string(), handle) {
            // caller is responsible for stopping a displaced controller
            warn!(
                rgd = rgd_name,
                gvk = %gvk_key(&old.gvk),
                "replaced running dynamic controller; stopping displaced one in background"
            );
            tokio::spawn(old.stop(Duration::from_secs(10)));
        }
    }

    /// Remove and return the handle so the caller can stop it without
    /// holding the registry lock.
    pub fn take(&self, rgd_name: &str) -> Option<DynamicControllerHandle> {
        self.lock().remove(rgd_name)
    }

    pub fn running(&self) -> usize {
        self.lock().len()
    }

    /// Drain every controller, bounded by `timeout` each.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let handles: Vec<(String, DynamicControllerHandle)> = {
            let mut map = self.lock();
            map.drain().collect()
        };
        for (name, handle) in handles {
            info!(rgd = %name, "stopping dynamic controller");
            handle.stop(timeout).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DynamicControllerHandle>> {
        self.controllers.lock().expect("registry lock poisoned")
    }
}

/// `group/version/Kind` display key.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kro_graph::{analyze, AnalyzeInput, OpenSchemaSource};
    use serde_json::Value;

    fn test_plan(kind: &str) -> RgdPlan {
        let compiled =
            kro_schema::compile(&Value::Null, &Value::Null, &[]).expect("empty schema compiles");
        let graph = analyze(AnalyzeInput {
            resources: &[],
            schema_type: compiled.expr_type.clone(),
            status: &Value::Null,
            source: &OpenSchemaSource,
        })
        .expect("empty graph analyzes");
        RgdPlan {
            rgd_name: "test".to_string(),
            gvk: GroupVersionKind::gvk("kro.run", "v1alpha1", kind),
            compiled,
            graph,
            service_accounts: Default::default(),
        }
    }

    fn test_handle(kind: &str) -> DynamicControllerHandle {
        let plan = Arc::new(RwLock::new(Arc::new(test_plan(kind))));
        let (tx, mut rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let _ = rx.changed().await;
        });
        DynamicControllerHandle::new(
            GroupVersionKind::gvk("kro.run", "v1alpha1", kind),
            plan,
            tx,
            join,
        )
    }

    #[tokio::test]
    async fn conflict_detection_and_lifecycle() {
        let registry = ControllerRegistry::new();
        registry.insert("first", test_handle("WebApp"));

        assert_eq!(
            registry.gvk_owner(&GroupVersionKind::gvk("kro.run", "v1alpha1", "WebApp"), "second"),
            Some("first".to_string())
        );
        // the owner itself is not a conflict
        assert_eq!(
            registry.gvk_owner(&GroupVersionKind::gvk("kro.run", "v1alpha1", "WebApp"), "first"),
            None
        );

        assert!(registry.swap_plan("first", test_plan("WebApp")));
        assert!(!registry.swap_plan("absent", test_plan("WebApp")));

        let handle = registry.take("first").expect("handle present");
        handle.stop(Duration::from_secs(1)).await;
        assert_eq!(registry.running(), 0);
    }

    #[tokio::test]
    async fn shutdown_all_drains() {
        let registry = ControllerRegistry::new();
        registry.insert("a", test_handle("KindA"));
        registry.insert("b", test_handle("KindB"));
        registry.shutdown_all(Duration::from_secs(1)).await;
        assert_eq!(registry.running(), 0);
    }
}
