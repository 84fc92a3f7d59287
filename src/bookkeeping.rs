use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::WorkloadSpread;
use crate::mutate::InjectedSpread;
use crate::selector;

/* ============================= OPERATIONS ============================= */

/// The admission event being accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
    Eviction,
}

/// Outcome of a successful status mutation: the subset that absorbed the
/// change and, for pods admitted before naming, the identity minted for
/// the reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetAssignment {
    pub subset: String,
    pub generated_uid: Option<String>,
}

/* ============================= LEDGER UPDATES ============================= */

/// Whether `key` is already recorded in any subset's creating or
/// deleting map. Webhook retries for the same pod must not double-count.
pub fn is_pod_recorded(ws: &WorkloadSpread, key: &str) -> bool {
    ws.status.as_ref().is_some_and(|status| {
        status.subset_statuses.iter().any(|s| {
            s.creating_pods.contains_key(key) || s.deleting_pods.contains_key(key)
        })
    })
}

/// Apply a reservation (create) or release (delete/evict) to the policy
/// status in place. Returns `None` when nothing changed: the pod is
/// already recorded, no subset fits, or the annotated subset is gone.
///
/// Reservation appends to `creatingPods` and decrements a bounded
/// `missingReplicas`; release appends to `deletingPods` and increments
/// unless the subset is unbounded. Each successful status write keeps
/// both effects atomic.
pub fn update_subset_for_pod(
    ws: &mut WorkloadSpread,
    pod: &Pod,
    injected: Option<&InjectedSpread>,
    operation: Operation,
) -> Option<SubsetAssignment> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();

    match operation {
        Operation::Create => {
            if !pod_name.is_empty() && is_pod_recorded(ws, &pod_name) {
                return None;
            }

            let index = selector::suitable_subset_index(ws.status.as_ref()?)?;
            let subset = &mut ws.status.as_mut()?.subset_statuses[index];

            let mut generated_uid = None;
            let key = if pod_name.is_empty() {
                // Generate-name admission: the pod has no name yet, so the
                // reservation is keyed by a fresh UID carried in the
                // annotation until the reconciler swaps it out.
                let uid = uuid::Uuid::new_v4().to_string();
                generated_uid = Some(uid.clone());
                uid
            } else {
                pod_name
            };
            subset.creating_pods.insert(key, Time(chrono::Utc::now()));
            if subset.missing_replicas > 0 {
                subset.missing_replicas -= 1;
            }

            Some(SubsetAssignment {
                subset: subset.name.clone(),
                generated_uid,
            })
        }
        Operation::Delete | Operation::Eviction => {
            if pod_name.is_empty() || is_pod_recorded(ws, &pod_name) {
                return None;
            }

            let subset_name = &injected?.subset;
            let index = selector::subset_index_by_name(ws.status.as_ref()?, subset_name)?;
            let subset = &mut ws.status.as_mut()?.subset_statuses[index];

            subset.deleting_pods.insert(pod_name, Time(chrono::Utc::now()));
            if subset.missing_replicas >= 0 {
                subset.missing_replicas += 1;
            }

            Some(SubsetAssignment {
                subset: subset.name.clone(),
                generated_uid: None,
            })
        }
    }
}

/* ============================= TESTS ============================= */
