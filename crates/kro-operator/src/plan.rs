//! The cached result of accepting an RGD

use kro_graph::Graph;
use kro_schema::CompiledSchema;
use kube::core::GroupVersionKind;
use std::collections::BTreeMap;

/// Everything the dynamic controller needs to reconcile instances of one
/// synthesized GVK. Rebuilt whenever the RGD's spec changes and analysis
/// succeeds; on analysis failure the previous plan stays in effect
/// (instances keep running on the last-good plan).
#[derive(Clone)]
pub struct RgdPlan {
    /// Owning ResourceGraphDefinition
    pub rgd_name: String,
    /// GVK of the synthesized API
    pub gvk: GroupVersionKind,
    /// Compiled SimpleSchema: defaults, typing, runtime validations
    pub compiled: CompiledSchema,
    /// Analyzed resource graph with its topological order
    pub graph: Graph,
    /// Namespace -> service account for impersonation (`"*"` fallback)
    pub service_accounts: BTreeMap<String, String>,
}
