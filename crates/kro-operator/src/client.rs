//! Rate-limited, impersonating resource clients
//!
//! All traffic to the API server from instance reconciliation flows through
//! a [`ResourceClient`]: a `kube::Client` wrapped with a token-bucket rate
//! limit (`clientQps`/`clientBurst`), a per-call deadline, and a discovery
//! cache resolving GVKs to `ApiResource`s.
//!
//! Per-node calls impersonate the service account mapped for the instance's
//! namespace (`defaultServiceAccounts`), falling back to the `"*"` entry.
//! A non-empty map with neither key denies the call rather than silently
//! using the controller identity.

use crate::config::KroConfig;
use crate::error::{OperatorError, Result};
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Field manager for all server-side applies.
pub const FIELD_MANAGER: &str = "kro";

/// Token-bucket limiter shared by every outgoing call.
#[derive(Debug)]
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        RateLimiter {
            qps: qps.max(1) as f64,
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            sleep(wait).await;
        }
    }
}

/// Builds controller-identity and impersonated clients that share one rate
/// limiter and discovery cache.
pub struct ClientFactory {
    base_config: kube::Config,
    controller: Client,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    discovery_cache: Arc<DashMap<String, (ApiResource, bool)>>,
}

impl ClientFactory {
    pub fn new(base_config: kube::Config, controller: Client, config: &KroConfig) -> Self {
        ClientFactory {
            base_config,
            controller,
            limiter: Arc::new(RateLimiter::new(config.client_qps, config.client_burst)),
            call_timeout: config.api_call_timeout,
            discovery_cache: Arc::new(DashMap::new()),
        }
    }

    /// Client running as the operator's own identity.
    pub fn controller_client(&self) -> ResourceClient {
        ResourceClient {
            client: self.controller.clone(),
            limiter: self.limiter.clone(),
            call_timeout: self.call_timeout,
            discovery_cache: self.discovery_cache.clone(),
        }
    }

    /// Raw controller-identity `kube::Client` for watches and typed APIs.
    pub fn raw(&self) -> Client {
        self.controller.clone()
    }

    /// Client impersonating the service account configured for `namespace`.
    ///
    /// An empty map keeps the controller identity; a non-empty map without
    /// a match is a denial, not a fallthrough.
    pub fn impersonated(
        &self,
        service_accounts: &BTreeMap<String, String>,
        namespace: &str,
    ) -> Result<ResourceClient> {
        if service_accounts.is_empty() {
            return Ok(self.controller_client());
        }
        let account = service_accounts
            .get(namespace)
            .or_else(|| service_accounts.get("*"))
            .ok_or_else(|| OperatorError::ImpersonationDenied {
                namespace: namespace.to_string(),
            })?;

        let mut config = self.base_config.clone();
        config.auth_info.impersonate = Some(format!(
            "system:serviceaccount:{}:{}",
            namespace, account
        ));
        config.auth_info.impersonate_groups = None;

        let client = Client::try_from(config)
            .map_err(|e| OperatorError::Internal(format!("building impersonated client: {}", e)))?;
        debug!(namespace, account = %account, "built impersonated client");

        Ok(ResourceClient {
            client,
            limiter: self.limiter.clone(),
            call_timeout: self.call_timeout,
            discovery_cache: self.discovery_cache.clone(),
        })
    }
}

/// A `DynamicObject` client with rate limiting, deadlines, and GVK
/// resolution.
#[derive(Clone)]
pub struct ResourceClient {
    client: Client,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    discovery_cache: Arc<DashMap<String, (ApiResource, bool)>>,
}

impl ResourceClient {
    /// Resolve a GVK to its `ApiResource` and whether it is namespaced,
    /// caching the discovery round-trip.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(found) = self.discovery_cache.get(&key) {
            return Ok(found.clone());
        }
        self.limiter.acquire().await;
        let (ar, caps) = self
            .deadline(discovery::pinned_kind(&self.client, gvk))
            .await??;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        self.discovery_cache.insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    /// Drop a cached resolution (e.g. after deleting a CRD).
    pub fn forget(&self, gvk: &GroupVersionKind) {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        self.discovery_cache.remove(&key);
    }

    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    /// Read one object; `Ok(None)` on 404.
    pub async fn get(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.limiter.acquire().await;
        let api = self.api(ar, namespaced, namespace);
        Ok(self.deadline(api.get_opt(name)).await??)
    }

    /// Server-side apply with forced field ownership.
    pub async fn apply(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        self.limiter.acquire().await;
        let api = self.api(ar, namespaced, namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .deadline(api.patch(name, &params, &Patch::Apply(object)))
            .await??)
    }

    /// Delete one object; absent objects are fine.
    pub async fn delete(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        self.limiter.acquire().await;
        let api = self.api(ar, namespaced, namespace);
        match self.deadline(api.delete(name, &DeleteParams::default())).await? {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List objects of a kind matching a label selector, cluster-wide.
    pub async fn list_labeled(
        &self,
        ar: &ApiResource,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        self.limiter.acquire().await;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let list = self
            .deadline(api.list(&ListParams::default().labels(selector)))
            .await??;
        Ok(list.items)
    }

    /// Whether any object of the kind exists (cluster-wide).
    pub async fn any_exist(&self, ar: &ApiResource) -> Result<bool> {
        self.limiter.acquire().await;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let list = self
            .deadline(api.list(&ListParams::default().limit(1)))
            .await??;
        Ok(!list.items.is_empty())
    }

    /// Merge-patch an object's status subresource.
    pub async fn patch_status(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<DynamicObject> {
        self.limiter.acquire().await;
        let api = self.api(ar, namespaced, namespace);
        let patch = serde_json::json!({ "status": status });
        Ok(self
            .deadline(api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await??)
    }

    /// Merge-patch an object's metadata (finalizer management).
    pub async fn patch_metadata(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
        name: &str,
        metadata: &serde_json::Value,
    ) -> Result<DynamicObject> {
        self.limiter.acquire().await;
        let api = self.api(ar, namespaced, namespace);
        let patch = serde_json::json!({ "metadata": metadata });
        Ok(self
            .deadline(api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await??)
    }

    async fn deadline<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T> {
        timeout(self.call_timeout, fut)
            .await
            .map_err(|_| OperatorError::Timeout(format!("API call exceeded {:?}", self.call_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(1000, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // the burst drains without sleeping
        assert!(start.elapsed() < Duration::from_millis(50));

        // the sixth token needs a refill at ~1ms per token
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_micros(500));
    }

    #[tokio::test]
    async fn rate_limiter_caps_at_burst() {
        let limiter = RateLimiter::new(1_000_000, 2);
        sleep(Duration::from_millis(5)).await;
        let start = Instant::now();
        for _ in 0..2 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn impersonation_resolution() {
        let mut accounts = BTreeMap::new();
        accounts.insert("team-a".to_string(), "runner-a".to_string());
        accounts.insert("*".to_string(), "runner-default".to_string());

        assert_eq!(
            accounts.get("team-a").or_else(|| accounts.get("*")).unwrap(),
            "runner-a"
        );
        assert_eq!(
            accounts.get("team-b").or_else(|| accounts.get("*")).unwrap(),
            "runner-default"
        );

        let mut strict = BTreeMap::new();
        strict.insert("team-a".to_string(), "runner-a".to_string());
        assert!(strict.get("team-b").or_else(|| strict.get("*")).is_none());
    }
}
