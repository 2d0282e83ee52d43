use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::models::{NodeId, TreeNode, TreeRecord};

/// Groups records by effective parent, each group sorted by `order`. Ties keep the
/// input order. Records whose parent is missing from `records` are grouped at the root.
pub fn children_map(records: &[TreeRecord]) -> BTreeMap<Option<NodeId>, Vec<&TreeRecord>> {
    let known: HashSet<NodeId> = records.iter().map(|record| record.id).collect();
    let mut groups: BTreeMap<Option<NodeId>, Vec<&TreeRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(effective_parent(record, &known))
            .or_default()
            .push(record);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|record| record.order);
    }
    groups
}

fn effective_parent(record: &TreeRecord, known: &HashSet<NodeId>) -> Option<NodeId> {
    match record.parent_id {
        Some(parent) if known.contains(&parent) => Some(parent),
        _ => None,
    }
}

/// Builds the nested display structure. Nodes that are only reachable through a
/// pre-existing parent cycle are left out.
pub fn build_forest(records: &[TreeRecord]) -> Vec<TreeNode> {
    let groups = children_map(records);
    let mut placed = HashSet::with_capacity(records.len());
    let Some(roots) = groups.get(&None) else {
        return Vec::new();
    };

    let mut output = Vec::with_capacity(roots.len());
    for root in roots {
        if let Some(node) = nest(root, None, &groups, &mut placed) {
            output.push(node);
        }
    }
    output
}

fn nest(
    record: &TreeRecord,
    parent_id: Option<NodeId>,
    groups: &BTreeMap<Option<NodeId>, Vec<&TreeRecord>>,
    placed: &mut HashSet<NodeId>,
) -> Option<TreeNode> {
    if !placed.insert(record.id) {
        return None;
    }

    let mut node = TreeNode::leaf(record.id, parent_id, record.order, &record.title);
    if let Some(children) = groups.get(&Some(record.id)) {
        for child in children {
            if let Some(child_node) = nest(child, Some(record.id), groups, placed) {
                node.children.push(child_node);
            }
        }
    }
    Some(node)
}

/// All descendants of `root` (excluding `root`) in breadth-first order.
pub fn descendant_ids(records: &[TreeRecord], root: NodeId) -> Vec<NodeId> {
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for record in records {
        if let Some(parent) = record.parent_id {
            adjacency.entry(parent).or_default().push(record.id);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut output = Vec::new();
    while let Some(node_id) = queue.pop_front() {
        if let Some(children) = adjacency.get(&node_id) {
            for child in children {
                if seen.insert(*child) {
                    output.push(*child);
                    queue.push_back(*child);
                }
            }
        }
    }
    output
}

/// Contiguous `0..n-1` order values for the given sibling sequence.
pub fn renumber(siblings: &[NodeId]) -> Vec<(NodeId, i64)> {
    siblings
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index as i64))
        .collect()
}

/// Next free order value at the end of a sibling group.
pub fn next_order(max_order: Option<i64>) -> i64 {
    max_order.map_or(0, |max| max + 1)
}
