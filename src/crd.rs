use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeSelectorTerm, PreferredSchedulingTerm, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= CONDITIONS ============================= */

/// Condition type reporting whether a subset can currently be scheduled.
///
/// Maintained by the reconciler; the admission handler only reads it.
pub const SUBSET_SCHEDULABLE_CONDITION: &str = "Schedulable";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Observed condition on a single subset.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpreadSubsetCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown".
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/* ============================= TARGET REFERENCE ============================= */

/// Identifies the parent workload whose pods a WorkloadSpread governs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/* ============================= SCHEDULE STRATEGY ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ScheduleStrategyType {
    /// Pods are placed by subset order and capacity only.
    #[default]
    Fixed,
    /// The reconciler may mark subsets unschedulable so pods spill over.
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveScheduleStrategy {
    /// Disables the predicate-based schedule simulation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_simulation_schedule: Option<bool>,

    /// Seconds a pod may stay unschedulable before its subset is marked
    /// `Schedulable=False`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reschedule_critical_seconds: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStrategy {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<ScheduleStrategyType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveScheduleStrategy>,
}

/* ============================= SUBSETS ============================= */

/// A named placement bucket. Declaration order is placement priority.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpreadSubset {
    /// Unique within the policy.
    pub name: String,

    /// Node-affinity term every pod in this subset must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_node_selector_term: Option<NodeSelectorTerm>,

    /// Preferred node-affinity terms appended to assigned pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_node_selector_terms: Option<Vec<PreferredSchedulingTerm>>,

    /// Tolerations appended to assigned pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Capacity of the subset; integer or percentage of the parent's
    /// replicas. Absent means unbounded. The admission handler never
    /// interprets percentages; the reconciler resolves them into
    /// `missingReplicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<IntOrString>,

    /// Merge patch applied to the whole pod at admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
}

/* ============================= SPEC ============================= */

/// WorkloadSpread spreads the pods of one parent workload across named
/// subsets, e.g. "at most 3 replicas in zone A, overflow into zone B".
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "apps.kruise.io",
    version = "v1alpha1",
    kind = "WorkloadSpread",
    plural = "workloadspreads",
    status = "WorkloadSpreadStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpreadSpec {
    /// The workload whose pods are governed by this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_reference: Option<TargetReference>,

    /// Ordered placement buckets; earlier subsets fill first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<WorkloadSpreadSubset>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_strategy: Option<ScheduleStrategy>,
}

/* ============================= STATUS ============================= */

/// Status is the shared ledger between the admission handler (which
/// reserves and releases slots) and the reconciler (which promotes
/// reservations into observed replicas).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpreadStatus {
    /// The `.metadata.generation` that was last reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// One entry per spec subset, in spec order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subset_statuses: Vec<WorkloadSpreadSubsetStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpreadSubsetStatus {
    /// Matches the spec subset name.
    pub name: String,

    /// Remaining capacity. -1 means unbounded.
    #[serde(default)]
    pub missing_replicas: i32,

    /// Active pods observed in this subset by the reconciler.
    #[serde(default)]
    pub replicas: i32,

    /// Pods admitted but not yet observed, keyed by pod name or a
    /// generated UID for pods admitted before naming.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub creating_pods: BTreeMap<String, Time>,

    /// Pods leaving the subset but not yet gone.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deleting_pods: BTreeMap<String, Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadSpreadSubsetCondition>,
}

/* ============================= TESTS ============================= */
