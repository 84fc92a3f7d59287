#![allow(dead_code)]

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kube_spread::crd::{
    TargetReference, WorkloadSpread, WorkloadSpreadSpec, WorkloadSpreadStatus,
    WorkloadSpreadSubset, WorkloadSpreadSubsetStatus,
};
use kube_spread::selector::UNBOUNDED_REPLICAS;

/// A subset bounded to `max` replicas, or unbounded when `max` is None.
pub fn make_subset(name: &str, max: Option<i32>) -> WorkloadSpreadSubset {
    WorkloadSpreadSubset {
        name: name.to_string(),
        max_replicas: max.map(IntOrString::Int),
        ..Default::default()
    }
}

/// A subset whose pods must land in the given topology zone.
pub fn make_zone_subset(name: &str, zone: &str, max: Option<i32>) -> WorkloadSpreadSubset {
    WorkloadSpreadSubset {
        required_node_selector_term: Some(NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: "topology.kubernetes.io/zone".to_string(),
                operator: "In".to_string(),
                values: Some(vec![zone.to_string()]),
            }]),
            match_fields: None,
        }),
        ..make_subset(name, max)
    }
}

/// A WorkloadSpread with a freshly-reconciled status: one subset status
/// per spec subset, `missingReplicas` primed from `maxReplicas` (or -1
/// when unbounded) and no pods recorded yet.
pub fn make_workload_spread(
    name: &str,
    namespace: &str,
    target: TargetReference,
    subsets: Vec<WorkloadSpreadSubset>,
) -> WorkloadSpread {
    let subset_statuses = subsets
        .iter()
        .map(|s| WorkloadSpreadSubsetStatus {
            name: s.name.clone(),
            missing_replicas: match &s.max_replicas {
                Some(IntOrString::Int(n)) => *n,
                _ => UNBOUNDED_REPLICAS,
            },
            ..Default::default()
        })
        .collect();

    let mut ws = WorkloadSpread::new(
        name,
        WorkloadSpreadSpec {
            target_reference: Some(target),
            subsets,
            schedule_strategy: None,
        },
    );
    ws.metadata.namespace = Some(namespace.to_string());
    ws.metadata.resource_version = Some("1".to_string());
    ws.status = Some(WorkloadSpreadStatus {
        observed_generation: None,
        subset_statuses,
    });
    ws
}

pub fn cloneset_target(name: &str) -> TargetReference {
    TargetReference {
        api_version: "apps.kruise.io/v1alpha1".to_string(),
        kind: "CloneSet".to_string(),
        name: name.to_string(),
    }
}

pub fn deployment_target(name: &str) -> TargetReference {
    TargetReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: name.to_string(),
    }
}

/// An active pod controlled by the given owner.
pub fn make_owned_pod(
    name: &str,
    namespace: &str,
    owner_api_version: &str,
    owner_kind: &str,
    owner_name: &str,
    owner_uid: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: owner_api_version.to_string(),
                kind: owner_kind.to_string(),
                name: owner_name.to_string(),
                uid: owner_uid.to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: None,
    }
}
