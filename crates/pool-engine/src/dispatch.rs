//! Instance selection: lowest load score wins, ties broken by
//! lexicographic id so selection is deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::instance::Instance;

/// Pick and claim an eligible instance. Must run under the pool's
/// instance-table lock so the winner is atomically marked RUNNING before it
/// is returned. `None` when no instance is READY or IDLE.
pub(crate) fn select(table: &BTreeMap<String, Arc<Instance>>) -> Option<Arc<Instance>> {
    // BTreeMap iterates in id order, so keeping the first strictly-smaller
    // score implements the lexicographic tie-break.
    let mut candidates: Vec<(f64, &Arc<Instance>)> = table
        .values()
        .filter(|inst| inst.status().is_eligible())
        .map(|inst| (inst.load_score(), inst))
        .collect();
    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    for (_, inst) in candidates {
        if inst.try_mark_running() {
            return Some(Arc::clone(inst));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InstanceStatus;

    fn table_of(instances: Vec<Instance>) -> BTreeMap<String, Arc<Instance>> {
        instances
            .into_iter()
            .map(|inst| (inst.id.clone(), Arc::new(inst)))
            .collect()
    }

    fn ready(id: &str) -> Instance {
        let inst = Instance::new(id.to_string(), 8901);
        inst.set_status(InstanceStatus::Ready);
        inst
    }

    #[test]
    fn empty_table_selects_nothing() {
        assert!(select(&BTreeMap::new()).is_none());
    }

    #[test]
    fn busy_and_error_instances_are_filtered_out() {
        let table = table_of(vec![ready("ocr-a"), ready("ocr-b")]);
        table["ocr-a"].mark_error("gone");
        assert!(table["ocr-b"].try_mark_running());

        assert!(select(&table).is_none());
    }

    #[test]
    fn lowest_load_score_wins() {
        let table = table_of(vec![ready("ocr-a"), ready("ocr-b")]);
        // Give ocr-a some work history so its score rises.
        assert!(table["ocr-a"].try_mark_running());
        table["ocr-a"].release(Some(1.0), true);

        let selected = select(&table).unwrap();
        assert_eq!(selected.id, "ocr-b");
        assert_eq!(selected.status(), InstanceStatus::Running);
    }

    #[test]
    fn ties_break_lexicographically() {
        let table = table_of(vec![ready("ocr-b"), ready("ocr-a"), ready("ocr-c")]);
        let selected = select(&table).unwrap();
        assert_eq!(selected.id, "ocr-a");
    }

    #[test]
    fn selection_claims_the_instance_atomically() {
        let table = table_of(vec![ready("ocr-a")]);
        assert!(select(&table).is_some());
        // The single instance is now RUNNING, so nothing is selectable.
        assert!(select(&table).is_none());
    }
}
