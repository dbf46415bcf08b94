//! Lease-based leader election
//!
//! When enabled, only one replica runs the controllers; the others block
//! here. Leadership is a `coordination.k8s.io/v1` Lease: acquire when the
//! holder is absent or expired, then renew at a fraction of the lease
//! duration. A replica that loses its lease stops renewing and the process
//! exits so a healthy replica can take over.

use crate::error::{OperatorError, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lease object name.
pub const LEASE_NAME: &str = "kro-controller-leader";

/// Election configuration.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Namespace holding the Lease
    pub namespace: String,
    /// This replica's identity (typically pod name)
    pub identity: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// Renewal cadence; must be well under `lease_duration`
    pub renew_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        LeaderConfig {
            namespace: "kro-system".to_string(),
            identity: format!("kro-{}", std::process::id()),
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        }
    }
}

/// Block until this replica holds the lease.
pub async fn acquire(client: &Client, config: &LeaderConfig) -> Result<()> {
    let api: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);
    loop {
        match try_acquire(&api, config).await {
            Ok(true) => {
                info!(identity = %config.identity, "acquired leadership");
                return Ok(());
            }
            Ok(false) => {
                debug!(identity = %config.identity, "lease held by another replica");
            }
            Err(e) => {
                warn!(error = %e, "lease acquisition attempt failed");
            }
        }
        tokio::time::sleep(config.renew_interval).await;
    }
}

/// Renew until renewal fails beyond the lease duration; the caller should
/// treat a return as fatal and shut down.
pub async fn hold(client: &Client, config: &LeaderConfig) -> OperatorError {
    let api: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);
    let mut failures: u32 = 0;
    let max_failures =
        (config.lease_duration.as_secs() / config.renew_interval.as_secs().max(1)).max(1) as u32;

    loop {
        tokio::time::sleep(config.renew_interval).await;
        match renew(&api, config).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "lease renewal failed");
                if failures >= max_failures {
                    return OperatorError::Internal(format!(
                        "lost leadership after {} failed renewals: {}",
                        failures, e
                    ));
                }
            }
        }
    }
}

async fn try_acquire(api: &Api<Lease>, config: &LeaderConfig) -> Result<bool> {
    let now = MicroTime(Utc::now());
    match api.get_opt(LEASE_NAME).await? {
        None => {
            let lease = desired_lease(config, &now, 1);
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Some(existing) => {
            let spec = existing.spec.clone().unwrap_or_default();
            let holder = spec.holder_identity.clone().unwrap_or_default();
            if holder == config.identity || lease_expired(&spec, config) {
                let transitions = spec.lease_transitions.unwrap_or(0)
                    + if holder == config.identity { 0 } else { 1 };
                let lease = desired_lease(config, &now, transitions);
                api.replace(LEASE_NAME, &PostParams::default(), &Lease {
                    metadata: existing.metadata.clone(),
                    spec: lease.spec,
                })
                .await?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

async fn renew(api: &Api<Lease>, config: &LeaderConfig) -> Result<()> {
    let existing = api
        .get_opt(LEASE_NAME)
        .await?
        .ok_or_else(|| OperatorError::Internal("leader lease disappeared".to_string()))?;
    let holder = existing
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.clone())
        .unwrap_or_default();
    if holder != config.identity {
        return Err(OperatorError::Internal(format!(
            "lease stolen by '{}'",
            holder
        )));
    }

    let patch = serde_json::json!({
        "spec": { "renewTime": MicroTime(Utc::now()) }
    });
    api.patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn desired_lease(config: &LeaderConfig, now: &MicroTime, transitions: i32) -> Lease {
    Lease {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.identity.clone()),
            lease_duration_seconds: Some(config.lease_duration.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now.clone()),
            lease_transitions: Some(transitions),
            ..Default::default()
        }),
    }
}

fn lease_expired(spec: &LeaseSpec, config: &LeaderConfig) -> bool {
    let renewed = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match renewed {
        Some(renewed) => {
            let duration = spec
                .lease_duration_seconds
                .map(|s| s as i64)
                .unwrap_or(config.lease_duration.as_secs() as i64);
            Utc::now()
                .signed_duration_since(renewed)
                .num_seconds()
                > duration
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_logic() {
        let config = LeaderConfig::default();

        let fresh = LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        };
        assert!(!lease_expired(&fresh, &config));

        let stale = LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(120))),
            ..Default::default()
        };
        assert!(lease_expired(&stale, &config));

        // a lease that was never renewed or acquired is free
        assert!(lease_expired(&LeaseSpec::default(), &config));
    }
}
