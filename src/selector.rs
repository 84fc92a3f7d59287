use crate::crd::{
    CONDITION_FALSE, SUBSET_SCHEDULABLE_CONDITION, WorkloadSpreadStatus,
    WorkloadSpreadSubsetStatus,
};

/// `missingReplicas` value marking a subset without a capacity bound.
pub const UNBOUNDED_REPLICAS: i32 = -1;

/// A subset is schedulable unless the reconciler has marked it
/// `Schedulable=False`.
pub fn is_subset_schedulable(subset: &WorkloadSpreadSubsetStatus) -> bool {
    !subset
        .conditions
        .iter()
        .any(|c| c.type_ == SUBSET_SCHEDULABLE_CONDITION && c.status == CONDITION_FALSE)
}

/// Whether the subset has room for one more pod.
pub fn has_capacity(subset: &WorkloadSpreadSubsetStatus) -> bool {
    subset.missing_replicas > 0 || subset.missing_replicas == UNBOUNDED_REPLICAS
}

/// First subset in declaration order that is schedulable and has
/// capacity. Declaration order is the placement priority; a full or
/// unschedulable subset spills pods over to the next one.
pub fn suitable_subset_index(status: &WorkloadSpreadStatus) -> Option<usize> {
    status
        .subset_statuses
        .iter()
        .position(|s| is_subset_schedulable(s) && has_capacity(s))
}

/// Index of the subset with the given name, if present in the status.
pub fn subset_index_by_name(status: &WorkloadSpreadStatus, name: &str) -> Option<usize> {
    status.subset_statuses.iter().position(|s| s.name == name)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CONDITION_TRUE, WorkloadSpreadSubsetCondition};

    fn subset(name: &str, missing: i32) -> WorkloadSpreadSubsetStatus {
        WorkloadSpreadSubsetStatus {
            name: name.to_string(),
            missing_replicas: missing,
            ..Default::default()
        }
    }

    fn unschedulable(mut s: WorkloadSpreadSubsetStatus) -> WorkloadSpreadSubsetStatus {
        s.conditions.push(WorkloadSpreadSubsetCondition {
            type_: SUBSET_SCHEDULABLE_CONDITION.to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: None,
            reason: None,
            message: None,
        });
        s
    }

    fn status(subsets: Vec<WorkloadSpreadSubsetStatus>) -> WorkloadSpreadStatus {
        WorkloadSpreadStatus {
            observed_generation: None,
            subset_statuses: subsets,
        }
    }

    // ── priority order ──

    #[test]
    fn test_first_subset_with_capacity_wins() {
        let st = status(vec![subset("a", 2), subset("b", 3)]);
        assert_eq!(suitable_subset_index(&st), Some(0));
    }

    #[test]
    fn test_full_subset_spills_to_next() {
        let st = status(vec![subset("a", 0), subset("b", 3)]);
        assert_eq!(suitable_subset_index(&st), Some(1));
    }

    #[test]
    fn test_unbounded_subset_is_always_suitable() {
        let st = status(vec![subset("a", 0), subset("b", UNBOUNDED_REPLICAS)]);
        assert_eq!(suitable_subset_index(&st), Some(1));
    }

    #[test]
    fn test_all_full_returns_none() {
        let st = status(vec![subset("a", 0), subset("b", 0)]);
        assert_eq!(suitable_subset_index(&st), None);
    }

    #[test]
    fn test_empty_status_returns_none() {
        let st = status(vec![]);
        assert_eq!(suitable_subset_index(&st), None);
    }

    // ── schedulable condition ──

    #[test]
    fn test_unschedulable_subset_is_skipped() {
        let st = status(vec![unschedulable(subset("a", 2)), subset("b", 3)]);
        assert_eq!(suitable_subset_index(&st), Some(1));
    }

    #[test]
    fn test_all_unschedulable_returns_none() {
        let st = status(vec![
            unschedulable(subset("a", 2)),
            unschedulable(subset("b", UNBOUNDED_REPLICAS)),
        ]);
        assert_eq!(suitable_subset_index(&st), None);
    }

    #[test]
    fn test_true_condition_does_not_block() {
        let mut s = subset("a", 1);
        s.conditions.push(WorkloadSpreadSubsetCondition {
            type_: SUBSET_SCHEDULABLE_CONDITION.to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: None,
            reason: None,
            message: None,
        });
        let st = status(vec![s]);
        assert_eq!(suitable_subset_index(&st), Some(0));
    }

    #[test]
    fn test_unrelated_false_condition_does_not_block() {
        let mut s = subset("a", 1);
        s.conditions.push(WorkloadSpreadSubsetCondition {
            type_: "SomethingElse".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: None,
            reason: None,
            message: None,
        });
        let st = status(vec![s]);
        assert_eq!(suitable_subset_index(&st), Some(0));
    }

    // ── lookup by name ──

    #[test]
    fn test_subset_index_by_name() {
        let st = status(vec![subset("a", 0), subset("b", 1)]);
        assert_eq!(subset_index_by_name(&st, "b"), Some(1));
        assert_eq!(subset_index_by_name(&st, "missing"), None);
    }
}
