//! Operator configuration
//!
//! One flat struct carrying every tuning knob, built from CLI flags /
//! environment in `main.rs` and passed down through controller contexts.

use std::time::Duration;

/// Runtime configuration for both controller kinds.
#[derive(Debug, Clone)]
pub struct KroConfig {
    /// Allow deleting a synthesized CRD that still has live instances
    pub allow_crd_deletion: bool,
    /// Sustained outgoing API request rate
    pub client_qps: u32,
    /// Burst allowance on top of `client_qps`
    pub client_burst: u32,
    /// Workers for the ResourceGraphDefinition controller
    pub rgd_concurrent_reconciles: u16,
    /// Workers per dynamic controller
    pub dynamic_concurrent_reconciles: u16,
    /// Periodic re-walk of every instance, in seconds
    pub dynamic_resync_period: u64,
    /// Retry cap before an instance is marked Failed
    pub dynamic_queue_max_retries: u32,
    /// Drain budget for dynamic controllers on shutdown, in seconds
    pub dynamic_shutdown_timeout: u64,
    /// Deadline applied to each outgoing API call
    pub api_call_timeout: Duration,
}

impl Default for KroConfig {
    fn default() -> Self {
        KroConfig {
            allow_crd_deletion: false,
            client_qps: 100,
            client_burst: 150,
            rgd_concurrent_reconciles: 1,
            dynamic_concurrent_reconciles: 1,
            dynamic_resync_period: 36_000,
            dynamic_queue_max_retries: 20,
            dynamic_shutdown_timeout: 60,
            api_call_timeout: Duration::from_secs(30),
        }
    }
}

impl KroConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.dynamic_resync_period)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.dynamic_shutdown_timeout)
    }
}
