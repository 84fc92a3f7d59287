use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Affinity, NodeAffinity, NodeSelector, Pod};
use serde::{Deserialize, Serialize};

use crate::crd::WorkloadSpread;

/* ============================= ANNOTATIONS ============================= */

/// Records which policy and subset a pod was assigned to at admission.
/// Read back at delete/evict time to locate the owning policy.
pub const MATCHED_WORKLOAD_SPREAD_ANNOTATION: &str = "apps.kruise.io/matched-workloadspread";

/// Scale-in hint read by parent workloads; pods with a lower cost are
/// removed first.
pub const POD_DELETION_COST_ANNOTATION: &str = "controller.kubernetes.io/pod-deletion-cost";

pub const PRIMARY_SUBSET_DELETION_COST: i32 = 200;
pub const OVERFLOW_SUBSET_DELETION_COST: i32 = 100;

/// Wire format of the matched-workloadspread annotation. `uid` is only
/// present for pods admitted without a concrete name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedSpread {
    pub name: String,
    pub subset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Deletion cost by subset priority: the first-declared subset outranks
/// every later one, so scale-in drains overflow subsets first.
pub fn deletion_cost_for_subset(index: usize) -> i32 {
    if index == 0 {
        PRIMARY_SUBSET_DELETION_COST
    } else {
        OVERFLOW_SUBSET_DELETION_COST
    }
}

/* ============================= POD INJECTION ============================= */

/// Stamp a pod assigned to `subset_name`: tolerations, preferred and
/// required node affinity, the subset's whole-pod patch, then the
/// matched-spread and deletion-cost annotations. Returns false when the
/// named subset is not in the policy spec.
pub fn inject_into_pod(
    ws: &WorkloadSpread,
    pod: &mut Pod,
    subset_name: &str,
    generated_uid: Option<&str>,
) -> Result<bool> {
    let Some((index, subset)) = ws
        .spec
        .subsets
        .iter()
        .enumerate()
        .find(|(_, s)| s.name == subset_name)
    else {
        return Ok(false);
    };

    let spec = pod.spec.get_or_insert_with(Default::default);

    if let Some(tolerations) = &subset.tolerations {
        if !tolerations.is_empty() {
            spec.tolerations
                .get_or_insert_with(Vec::new)
                .extend(tolerations.iter().cloned());
        }
    }

    let node_affinity = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default);

    if let Some(preferred) = &subset.preferred_node_selector_terms {
        if !preferred.is_empty() {
            node_affinity
                .preferred_during_scheduling_ignored_during_execution
                .get_or_insert_with(Vec::new)
                .extend(preferred.iter().cloned());
        }
    }

    if let Some(required_term) = &subset.required_node_selector_term {
        let selector = node_affinity
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(NodeSelector::default);
        if selector.node_selector_terms.is_empty() {
            selector.node_selector_terms = vec![required_term.clone()];
        } else {
            // The terms are OR-ed alternatives; widening each one keeps
            // the subset constraint mandatory whichever branch matches.
            for term in &mut selector.node_selector_terms {
                if let Some(exprs) = &required_term.match_expressions {
                    term.match_expressions
                        .get_or_insert_with(Vec::new)
                        .extend(exprs.iter().cloned());
                }
                if let Some(fields) = &required_term.match_fields {
                    term.match_fields
                        .get_or_insert_with(Vec::new)
                        .extend(fields.iter().cloned());
                }
            }
        }
    }

    if let Some(patch) = &subset.patch {
        apply_subset_patch(pod, patch)?;
    }

    let injected = InjectedSpread {
        name: ws.metadata.name.clone().unwrap_or_default(),
        subset: subset_name.to_string(),
        uid: generated_uid.map(str::to_string),
    };
    let annotation = serde_json::to_string(&injected)
        .context("failed to serialize matched-workloadspread annotation")?;

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(MATCHED_WORKLOAD_SPREAD_ANNOTATION.to_string(), annotation);
    annotations.insert(
        POD_DELETION_COST_ANNOTATION.to_string(),
        deletion_cost_for_subset(index).to_string(),
    );

    Ok(true)
}

/// Apply the subset's whole-pod merge patch. A failure here rejects the
/// admission; the status reservation already written is left for the
/// reconciler to expire.
fn apply_subset_patch(pod: &mut Pod, patch: &serde_json::Value) -> Result<()> {
    let mut doc =
        serde_json::to_value(&*pod).context("failed to serialize pod for subset patch")?;
    json_patch::merge(&mut doc, patch);
    *pod = serde_json::from_value(doc).context("failed to deserialize patched pod")?;
    Ok(())
}

/* ============================= TESTS ============================= */
