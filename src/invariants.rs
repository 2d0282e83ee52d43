use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use anyhow::anyhow;

use crate::algorithms::children_map;
use crate::error::{LibError, Result};
use crate::models::{NodeId, TreeInvariantViolation, TreeRecord};

/// Reports every way `records` fails to be a well-ordered forest.
///
/// Sibling groups are checked for contiguous `0..n-1` order values; `max_depth`
/// (root = depth 0) is only enforced when given.
pub fn forest_violations(
    records: &[TreeRecord],
    max_depth: Option<usize>,
) -> Vec<TreeInvariantViolation> {
    let known: HashSet<NodeId> = records.iter().map(|record| record.id).collect();
    let mut violations = Vec::new();

    for record in records {
        match record.parent_id {
            Some(parent) if parent == record.id => {
                violations.push(TreeInvariantViolation::SelfParent { node_id: record.id });
            }
            Some(parent) if !known.contains(&parent) => {
                violations.push(TreeInvariantViolation::UnknownParent {
                    node_id: record.id,
                    parent_id: parent,
                });
            }
            _ => {}
        }
    }

    let groups = children_map(records);
    for (parent_id, siblings) in &groups {
        let mut previous: Option<i64> = None;
        for (index, sibling) in siblings.iter().enumerate() {
            if previous == Some(sibling.order) {
                violations.push(TreeInvariantViolation::DuplicateOrder {
                    parent_id: *parent_id,
                    order: sibling.order,
                });
                break;
            }
            if sibling.order != index as i64 {
                violations.push(TreeInvariantViolation::OrderGap {
                    parent_id: *parent_id,
                    expected: index as i64,
                    found: sibling.order,
                });
                break;
            }
            previous = Some(sibling.order);
        }
    }

    let depths = reachable_depths(&groups);
    let mut unreachable = records
        .iter()
        .map(|record| record.id)
        .filter(|node_id| !depths.contains_key(node_id))
        .collect::<Vec<_>>();
    if !unreachable.is_empty() {
        unreachable.sort();
        violations.push(TreeInvariantViolation::CycleDetected {
            node_ids: unreachable,
        });
    }

    if let Some(max_depth) = max_depth {
        let mut too_deep = depths
            .iter()
            .filter(|(_, depth)| **depth > max_depth)
            .map(|(node_id, depth)| (*node_id, *depth))
            .collect::<Vec<_>>();
        too_deep.sort();
        for (node_id, depth) in too_deep {
            violations.push(TreeInvariantViolation::DepthExceeded {
                node_id,
                depth,
                max_depth,
            });
        }
    }

    violations
}

pub fn ensure_forest_invariants(records: &[TreeRecord], max_depth: Option<usize>) -> Result<()> {
    let violations = forest_violations(records, max_depth);
    if let Some(first) = violations.first() {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("tree invariant validation failed: {:?}", violations),
        ));
    }

    Ok(())
}

fn reachable_depths(
    groups: &BTreeMap<Option<NodeId>, Vec<&TreeRecord>>,
) -> HashMap<NodeId, usize> {
    let mut depths = HashMap::new();
    let mut queue = VecDeque::new();
    if let Some(roots) = groups.get(&None) {
        for root in roots {
            depths.insert(root.id, 0usize);
            queue.push_back(root.id);
        }
    }

    while let Some(node_id) = queue.pop_front() {
        let depth = depths[&node_id];
        if let Some(children) = groups.get(&Some(node_id)) {
            for child in children {
                if !depths.contains_key(&child.id) {
                    depths.insert(child.id, depth + 1);
                    queue.push_back(child.id);
                }
            }
        }
    }

    depths
}
