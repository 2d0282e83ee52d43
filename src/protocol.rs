use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::guard::{ParentIndex, ParentLookup, would_create_cycle};
use crate::models::{
    ExcludedMove, ExclusionReason, NestedNode, NodeId, TreeRecord, UpdateTreeResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedMove {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub order: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutPlan {
    pub moves: Vec<PlannedMove>,
    pub excluded: Vec<ExcludedMove>,
    pub reload: bool,
}

impl LayoutPlan {
    pub fn is_noop(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn response(&self) -> UpdateTreeResponse {
        UpdateTreeResponse {
            reload: self.reload,
            excluded: self.excluded.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: NodeId,
    parent: Option<NodeId>,
    rank: usize,
}

fn flatten(layout: &[NestedNode]) -> Result<(Vec<Entry>, usize)> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut max_depth = 0usize;
    flatten_level(layout, None, 0, &mut entries, &mut seen, &mut max_depth)?;
    Ok((entries, max_depth))
}

// Pre-order, so every parent is visited before its children.
fn flatten_level(
    level: &[NestedNode],
    parent: Option<NodeId>,
    depth: usize,
    entries: &mut Vec<Entry>,
    seen: &mut HashSet<NodeId>,
    max_depth: &mut usize,
) -> Result<()> {
    for (rank, node) in level.iter().enumerate() {
        if !seen.insert(node.id) {
            return Err(LibError::invalid(
                "Each node may appear only once in a tree layout",
                anyhow!("duplicate node id {} in layout", node.id),
            ));
        }
        entries.push(Entry {
            id: node.id,
            parent,
            rank,
        });
        *max_depth = (*max_depth).max(depth);
        flatten_level(&node.children, Some(node.id), depth + 1, entries, seen, max_depth)?;
    }
    Ok(())
}

/// Depth of `id` below the root level. Parents missing from the lookup count as the
/// root level; `None` when the walk runs into a cycle.
fn depth_in<L: ParentLookup>(lookup: &L, id: NodeId) -> Option<usize> {
    let mut seen = HashSet::from([id]);
    let mut depth = 0usize;
    let mut current = lookup.parent_of(id).flatten();
    while let Some(parent) = current {
        let Some(grandparent) = lookup.parent_of(parent) else {
            break;
        };
        if !seen.insert(parent) {
            return None;
        }
        depth += 1;
        current = grandparent;
    }
    Some(depth)
}

/// Plans the writes needed to make `records` match `layout`.
///
/// Moves that fail the cycle guard, or that reference unknown records, are excluded
/// and the remaining ones still commit. `reload` is set whenever the committed state
/// will differ from what the client submitted. A layout nested deeper than
/// `max_depth`, or one that would leave any record deeper than `max_depth` once the
/// exclusions are taken into account, is rejected as a whole. Records that already sat
/// too deep and are not pushed further down do not block the save.
pub fn plan_layout(
    records: &[TreeRecord],
    layout: &[NestedNode],
    max_depth: Option<usize>,
) -> Result<LayoutPlan> {
    let (entries, layout_depth) = flatten(layout)?;
    if let Some(max_depth) = max_depth {
        if layout_depth > max_depth {
            return Err(LibError::depth_exceeded(
                max_depth,
                layout_depth,
                anyhow!("layout depth {} exceeds max depth {}", layout_depth, max_depth),
            ));
        }
    }

    let stored: HashMap<NodeId, &TreeRecord> =
        records.iter().map(|record| (record.id, record)).collect();
    let mut index = ParentIndex::from_records(records);
    let mut excluded = Vec::new();
    let mut placed: HashMap<NodeId, usize> = HashMap::with_capacity(entries.len());

    for entry in &entries {
        if !stored.contains_key(&entry.id) {
            excluded.push(ExcludedMove {
                node_id: entry.id,
                reason: ExclusionReason::UnknownNode,
            });
            continue;
        }
        if let Some(parent) = entry.parent {
            if !stored.contains_key(&parent) {
                excluded.push(ExcludedMove {
                    node_id: entry.id,
                    reason: ExclusionReason::UnknownParent,
                });
                continue;
            }
        }

        let current = index.parent_of(entry.id).flatten();
        if current != entry.parent {
            if would_create_cycle(&index, entry.id, entry.parent) {
                tracing::warn!(
                    node_id = %entry.id,
                    proposed_parent = ?entry.parent,
                    "excluding layout move that would create a cycle"
                );
                excluded.push(ExcludedMove {
                    node_id: entry.id,
                    reason: ExclusionReason::Cycle,
                });
                continue;
            }
            index.set_parent(entry.id, entry.parent);
        }
        placed.insert(entry.id, entry.rank);
    }

    // Excluded nodes keep their stored parent, so their payload children can end up
    // deeper than the layout suggests.
    if let Some(max_depth) = max_depth {
        let before = ParentIndex::from_records(records);
        for record in records {
            let Some(depth) = depth_in(&index, record.id) else {
                continue;
            };
            if depth > max_depth && depth_in(&before, record.id).is_none_or(|old| depth > old) {
                return Err(LibError::depth_exceeded(
                    max_depth,
                    depth,
                    anyhow!(
                        "committing layout would place {} at depth {} (max {})",
                        record.id,
                        depth,
                        max_depth
                    ),
                ));
            }
        }
    }

    let mut groups: BTreeMap<Option<NodeId>, Vec<(bool, i64, usize, NodeId)>> = BTreeMap::new();
    for (position, record) in records.iter().enumerate() {
        let parent = index.parent_of(record.id).flatten();
        let key = match placed.get(&record.id) {
            Some(rank) => (false, *rank as i64, position, record.id),
            None => (true, record.order, position, record.id),
        };
        groups.entry(parent).or_default().push(key);
    }

    let payload_ids: HashSet<NodeId> = entries.iter().map(|entry| entry.id).collect();
    let mut moves = Vec::new();
    let mut reload = !excluded.is_empty();
    for (parent, mut members) in groups {
        members.sort();
        for (order, (unplaced, _, _, node_id)) in members.into_iter().enumerate() {
            let order = order as i64;
            let record = stored[&node_id];
            if unplaced {
                let displayed = match parent {
                    None => true,
                    Some(parent) => {
                        payload_ids.contains(&parent) || !stored.contains_key(&parent)
                    }
                };
                if displayed && !payload_ids.contains(&node_id) {
                    reload = true;
                }
            } else if placed.get(&node_id).map(|rank| *rank as i64) != Some(order) {
                reload = true;
            }

            if record.parent_id != parent || record.order != order {
                moves.push(PlannedMove {
                    node_id,
                    parent_id: parent,
                    order,
                });
            }
        }
    }

    tracing::debug!(
        moves = moves.len(),
        excluded = excluded.len(),
        reload,
        "planned tree layout"
    );

    Ok(LayoutPlan {
        moves,
        excluded,
        reload,
    })
}

/// Applies a plan to an in-memory copy of the records.
pub fn apply_plan(records: &mut [TreeRecord], plan: &LayoutPlan, now: chrono::NaiveDateTime) {
    let moves: HashMap<NodeId, &PlannedMove> =
        plan.moves.iter().map(|planned| (planned.node_id, planned)).collect();
    for record in records.iter_mut() {
        if let Some(planned) = moves.get(&record.id) {
            record.parent_id = planned.parent_id;
            record.order = planned.order;
            record.updated_at = now;
        }
    }
}
