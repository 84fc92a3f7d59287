use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::bookkeeping::{self, Operation, SubsetAssignment};
use crate::crd::{TargetReference, WorkloadSpread};
use crate::matcher;
use crate::mutate::{self, InjectedSpread};

/* ============================= RETRY POLICY ============================= */

/// Status writes race with every other in-flight admission on the same
/// policy; the server's Conflict response serializes them. Five attempts
/// with exponential backoff from 10ms stays far below the admission
/// deadline.
const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(10);

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/* ============================= POD FILTERS ============================= */

/// A pod is active while it is not being deleted and has not reached a
/// terminal phase.
pub fn is_pod_active(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    phase != "Succeeded" && phase != "Failed"
}

/* ============================= HANDLER ============================= */

/// Admission-time entry points for pod create/delete/evict events. All
/// coordination between concurrent admissions goes through the policy
/// status on the server; the handler itself is stateless.
#[derive(Clone)]
pub struct SpreadHandler {
    client: Client,
}

impl SpreadHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Handle a pod CREATE admission. When a WorkloadSpread governs the
    /// pod's owner, reserve a slot in a subset and stamp the pod in
    /// place. Returns true when the pod was mutated.
    pub async fn handle_pod_creation(&self, pod: &mut Pod) -> Result<bool> {
        if !is_pod_active(pod) {
            return Ok(false);
        }
        let Some(owner) = matcher::controller_of(pod).cloned() else {
            return Ok(false);
        };
        if !matcher::match_reference(Some(&owner)) {
            return Ok(false);
        }

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let spreads: Api<WorkloadSpread> = Api::namespaced(self.client.clone(), &namespace);
        let list = spreads
            .list(&ListParams::default())
            .await
            .context("failed to list WorkloadSpreads")?;

        let mut matched = None;
        for ws in list.items {
            let Some(target) = ws.spec.target_reference.clone() else {
                continue;
            };
            if self.is_reference_equal(&target, &owner, &namespace).await {
                // A pod has at most one governing policy; first match wins.
                matched = Some(ws);
                break;
            }
        }
        let Some(ws) = matched else {
            return Ok(false);
        };

        let Some(assignment) = self
            .apply_status_change(&ws, pod, None, Operation::Create)
            .await?
        else {
            return Ok(false);
        };

        let stamped = mutate::inject_into_pod(
            &ws,
            pod,
            &assignment.subset,
            assignment.generated_uid.as_deref(),
        )
        .with_context(|| {
            format!(
                "failed to stamp pod for subset {} of WorkloadSpread {}/{}",
                assignment.subset,
                namespace,
                ws.metadata.name.as_deref().unwrap_or_default(),
            )
        })?;

        info!(
            namespace = %namespace,
            pod = %pod_display_name(pod),
            subset = %assignment.subset,
            "pod_assigned_to_subset"
        );
        Ok(stamped)
    }

    /// Handle a pod DELETE or eviction admission: release the pod's slot
    /// in the subset named by its admission-time annotation. Pods without
    /// the annotation, inactive pods, and pods whose policy has vanished
    /// are all passed through untouched.
    pub async fn handle_pod_deletion(&self, pod: &Pod, operation: Operation) -> Result<()> {
        let Some(raw) = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(mutate::MATCHED_WORKLOAD_SPREAD_ANNOTATION))
        else {
            return Ok(());
        };
        if raw.is_empty() {
            return Ok(());
        }

        let injected: InjectedSpread = match serde_json::from_str(raw) {
            Ok(injected) => injected,
            Err(err) => {
                warn!(
                    pod = %pod_display_name(pod),
                    annotation = %raw,
                    error = %err,
                    "unparseable_matched_workloadspread_annotation"
                );
                return Ok(());
            }
        };

        if !is_pod_active(pod) || matcher::controller_of(pod).is_none() {
            return Ok(());
        }

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let spreads: Api<WorkloadSpread> = Api::namespaced(self.client.clone(), &namespace);
        let ws = match spreads.get(&injected.name).await {
            Ok(ws) => ws,
            Err(err) if is_not_found(&err) => {
                warn!(
                    namespace = %namespace,
                    pod = %pod_display_name(pod),
                    workloadspread = %injected.name,
                    "matched_workloadspread_not_found"
                );
                return Ok(());
            }
            Err(err) => {
                return Err(err).context("failed to get matched WorkloadSpread");
            }
        };

        self.apply_status_change(&ws, pod, Some(&injected), operation)
            .await?;
        Ok(())
    }

    /// Reserve or release through the status subresource under optimistic
    /// concurrency. The first attempt uses the caller's snapshot; each
    /// retry re-reads the policy. Conflict is the only retryable error; a
    /// policy deleted mid-flight ends the operation as a no-op.
    async fn apply_status_change(
        &self,
        ws: &WorkloadSpread,
        pod: &Pod,
        injected: Option<&InjectedSpread>,
        operation: Operation,
    ) -> Result<Option<SubsetAssignment>> {
        let namespace = ws.metadata.namespace.clone().unwrap_or_default();
        let name = ws.metadata.name.clone().unwrap_or_default();
        let spreads: Api<WorkloadSpread> = Api::namespaced(self.client.clone(), &namespace);

        let mut current = ws.clone();
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                current = match spreads.get(&name).await {
                    Ok(fresh) => fresh,
                    Err(err) if is_not_found(&err) => return Ok(None),
                    Err(err) => {
                        return Err(err).context("failed to refresh WorkloadSpread for retry");
                    }
                };
            }

            let Some(assignment) =
                bookkeeping::update_subset_for_pod(&mut current, pod, injected, operation)
            else {
                debug!(
                    namespace = %namespace,
                    workloadspread = %name,
                    pod = %pod_display_name(pod),
                    "no_status_change_needed"
                );
                return Ok(None);
            };

            let data = serde_json::to_vec(&current)
                .context("failed to serialize WorkloadSpread status")?;
            match spreads
                .replace_status(&name, &PostParams::default(), data)
                .await
            {
                Ok(_) => {
                    info!(
                        namespace = %namespace,
                        workloadspread = %name,
                        subset = %assignment.subset,
                        "workloadspread_status_updated"
                    );
                    return Ok(Some(assignment));
                }
                Err(err) if is_conflict(&err) && attempt + 1 < CONFLICT_RETRY_ATTEMPTS => {
                    attempt += 1;
                    debug!(
                        namespace = %namespace,
                        workloadspread = %name,
                        attempt,
                        "status_update_conflict_retrying"
                    );
                    tokio::time::sleep(CONFLICT_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => {
                    return Err(err).context("failed to update WorkloadSpread status");
                }
            }
        }
    }

    /// Version-agnostic target/owner equality. A Deployment target is
    /// resolved through the owning ReplicaSet: the ReplicaSet named by
    /// the owner reference must exist with the owner's UID, and its own
    /// controlling owner must be a Deployment carrying the target name.
    async fn is_reference_equal(
        &self,
        target: &TargetReference,
        owner: &OwnerReference,
        namespace: &str,
    ) -> bool {
        if target.kind != matcher::DEPLOYMENT_KIND {
            return matcher::reference_equal(target, &owner.api_version, &owner.kind, &owner.name);
        }

        let replicasets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let rs = match replicasets.get(&owner.name).await {
            Ok(rs) => rs,
            Err(err) => {
                debug!(
                    namespace = %namespace,
                    replicaset = %owner.name,
                    error = %err,
                    "owner_replicaset_lookup_failed"
                );
                return false;
            }
        };
        if rs.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
            return false;
        }

        let Some(rs_owner) = matcher::controller_owner(rs.metadata.owner_references.as_ref())
        else {
            return false;
        };
        if !matcher::verify_group_kind(
            &rs_owner.api_version,
            &rs_owner.kind,
            matcher::DEPLOYMENT_KIND,
            &[matcher::APPS_GROUP],
        ) {
            return false;
        }
        matcher::reference_equal(target, &rs_owner.api_version, &rs_owner.kind, &rs_owner.name)
    }
}

/// Pods admitted under generateName have no name yet; fall back for logs.
fn pod_display_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or("<unnamed>")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod_with_phase(phase: Option<&str>, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: None,
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
        }
    }

    // ── is_pod_active ──

    #[test]
    fn test_running_pod_is_active() {
        assert!(is_pod_active(&pod_with_phase(Some("Running"), false)));
    }

    #[test]
    fn test_pending_pod_is_active() {
        assert!(is_pod_active(&pod_with_phase(Some("Pending"), false)));
    }

    #[test]
    fn test_pod_without_status_is_active() {
        assert!(is_pod_active(&pod_with_phase(None, false)));
    }

    #[test]
    fn test_succeeded_pod_is_not_active() {
        assert!(!is_pod_active(&pod_with_phase(Some("Succeeded"), false)));
    }

    #[test]
    fn test_failed_pod_is_not_active() {
        assert!(!is_pod_active(&pod_with_phase(Some("Failed"), false)));
    }

    #[test]
    fn test_deleting_pod_is_not_active() {
        assert!(!is_pod_active(&pod_with_phase(Some("Running"), true)));
    }

    // ── pod_display_name ──

    #[test]
    fn test_display_name_prefers_name() {
        let pod = pod_with_phase(None, false);
        assert_eq!(pod_display_name(&pod), "p");
    }

    #[test]
    fn test_display_name_falls_back_to_generate_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some("web-".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_display_name(&pod), "web-");
    }
}
