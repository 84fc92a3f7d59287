use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::warn;

use crate::crd::TargetReference;

/* ============================= WORKLOAD KINDS ============================= */

pub const KRUISE_GROUP: &str = "apps.kruise.io";
pub const APPS_GROUP: &str = "apps";
pub const BATCH_GROUP: &str = "batch";

pub const CLONESET_KIND: &str = "CloneSet";
pub const REPLICASET_KIND: &str = "ReplicaSet";
pub const DEPLOYMENT_KIND: &str = "Deployment";
pub const JOB_KIND: &str = "Job";

struct MatchableWorkload {
    kind: &'static str,
    groups: &'static [&'static str],
}

/// Owner kinds the handler can match directly. Deployments are reached
/// indirectly through their ReplicaSet.
const MATCHABLE_WORKLOADS: &[MatchableWorkload] = &[
    MatchableWorkload { kind: CLONESET_KIND, groups: &[KRUISE_GROUP] },
    MatchableWorkload { kind: REPLICASET_KIND, groups: &[APPS_GROUP] },
    MatchableWorkload { kind: JOB_KIND, groups: &[BATCH_GROUP] },
];

/* ============================= GROUP/VERSION PARSING ============================= */

/// Split an apiVersion like "apps/v1" into (group, version). A bare
/// version such as "v1" belongs to the core group "".
pub fn parse_group_version(api_version: &str) -> anyhow::Result<(String, String)> {
    match api_version.split_once('/') {
        None => Ok((String::new(), api_version.to_string())),
        Some((group, version)) if !version.contains('/') => {
            Ok((group.to_string(), version.to_string()))
        }
        Some(_) => anyhow::bail!("unexpected GroupVersion string: {api_version}"),
    }
}

/// Compare an apiVersion+kind pair against an expected kind and allowed
/// groups. Version-agnostic: only the group is considered. An
/// unparseable apiVersion is logged and treated as a non-match.
pub fn verify_group_kind(
    api_version: &str,
    kind: &str,
    expected_kind: &str,
    expected_groups: &[&str],
) -> bool {
    if kind != expected_kind {
        return false;
    }
    match parse_group_version(api_version) {
        Ok((group, _)) => expected_groups.iter().any(|g| *g == group),
        Err(err) => {
            warn!(api_version = %api_version, error = %err, "unparseable_api_version");
            false
        }
    }
}

/* ============================= OWNER MATCHING ============================= */

/// The controlling owner among a set of owner references.
pub fn controller_owner(refs: Option<&Vec<OwnerReference>>) -> Option<&OwnerReference> {
    refs?.iter().find(|r| r.controller == Some(true))
}

/// The controlling owner reference of a pod, if any.
pub fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    controller_owner(pod.metadata.owner_references.as_ref())
}

/// Whether an owner reference points at one of the directly matchable
/// workload kinds.
pub fn match_reference(owner: Option<&OwnerReference>) -> bool {
    let Some(owner) = owner else {
        return false;
    };
    MATCHABLE_WORKLOADS
        .iter()
        .any(|wl| verify_group_kind(&owner.api_version, &owner.kind, wl.kind, wl.groups))
}

/// Version-agnostic equality between a policy target and an owner:
/// groups, kinds and names must all match.
pub fn reference_equal(
    target: &TargetReference,
    owner_api_version: &str,
    owner_kind: &str,
    owner_name: &str,
) -> bool {
    let target_group = match parse_group_version(&target.api_version) {
        Ok((group, _)) => group,
        Err(err) => {
            warn!(api_version = %target.api_version, error = %err, "unparseable_target_api_version");
            return false;
        }
    };
    let owner_group = match parse_group_version(owner_api_version) {
        Ok((group, _)) => group,
        Err(err) => {
            warn!(api_version = %owner_api_version, error = %err, "unparseable_owner_api_version");
            return false;
        }
    };

    target_group == owner_group && target.kind == owner_kind && target.name == owner_name
}

/* ============================= TESTS ============================= */
