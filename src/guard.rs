use std::collections::{HashMap, HashSet};

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{NodeId, RecordChanges, TreeRecord};

pub const CYCLE_WARNING: &str = "Parent change ignored: would create circular reference.";

/// Read access to parent links. `None` means the record does not exist,
/// `Some(None)` means it sits at the root level.
pub trait ParentLookup {
    fn parent_of(&self, id: NodeId) -> Option<Option<NodeId>>;
}

impl ParentLookup for HashMap<NodeId, Option<NodeId>> {
    fn parent_of(&self, id: NodeId) -> Option<Option<NodeId>> {
        self.get(&id).copied()
    }
}

/// Mutable snapshot of every record's parent, used while planning a batch of moves.
#[derive(Debug, Clone, Default)]
pub struct ParentIndex {
    parents: HashMap<NodeId, Option<NodeId>>,
}

impl ParentIndex {
    pub fn from_records(records: &[TreeRecord]) -> Self {
        Self {
            parents: records
                .iter()
                .map(|record| (record.id, record.parent_id))
                .collect(),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.parents.contains_key(&id)
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.parents.insert(id, parent);
    }
}

impl ParentLookup for ParentIndex {
    fn parent_of(&self, id: NodeId) -> Option<Option<NodeId>> {
        self.parents.get(&id).copied()
    }
}

/// True when `record_id` would become its own ancestor under `proposed_parent`.
pub fn would_create_cycle<L>(lookup: &L, record_id: NodeId, proposed_parent: Option<NodeId>) -> bool
where
    L: ParentLookup + ?Sized,
{
    let Some(mut current) = proposed_parent else {
        return false;
    };

    let mut visited = HashSet::from([record_id]);
    loop {
        if current == record_id {
            return true;
        }
        if !visited.insert(current) {
            // Cycle in existing data that does not involve `record_id`.
            return false;
        }
        match lookup.parent_of(current) {
            Some(Some(parent)) => current = parent,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenedChanges {
    pub changes: RecordChanges,
    pub warnings: Vec<String>,
}

/// Drops a parent change that would create a cycle, keeping the rest of the edit.
///
/// A parent that does not exist is an input error rather than a warning.
pub fn screen_parent_change<L>(
    lookup: &L,
    record: &TreeRecord,
    mut changes: RecordChanges,
) -> Result<ScreenedChanges>
where
    L: ParentLookup + ?Sized,
{
    let mut warnings = Vec::new();
    if let Some(proposed) = changes.parent_id {
        if let Some(parent) = proposed {
            if parent != record.id && lookup.parent_of(parent).is_none() {
                return Err(LibError::not_found(
                    "Parent record not found",
                    anyhow!("record {} cannot move under missing parent {}", record.id, parent),
                ));
            }
        }

        if proposed == record.parent_id {
            changes.parent_id = None;
        } else if would_create_cycle(lookup, record.id, proposed) {
            tracing::warn!(
                record_id = %record.id,
                proposed_parent = ?proposed,
                "dropping parent change that would create a cycle"
            );
            changes.parent_id = None;
            warnings.push(CYCLE_WARNING.to_string());
        }
    }

    Ok(ScreenedChanges { changes, warnings })
}

/// Hard variant used when the caller asked for nothing but a reparent.
pub fn ensure_no_cycle<L>(lookup: &L, record_id: NodeId, proposed: Option<NodeId>) -> Result<()>
where
    L: ParentLookup + ?Sized,
{
    if would_create_cycle(lookup, record_id, proposed) {
        return Err(LibError::cycle_rejected(anyhow!(
            "moving {} under {:?} would create a cycle",
            record_id,
            proposed
        )));
    }
    Ok(())
}
