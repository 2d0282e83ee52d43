use std::future::Future;

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use tokio::sync::Mutex;

use crate::algorithms::{descendant_ids, next_order, renumber};
use crate::error::{LibError, Result};
use crate::guard::{ParentIndex, screen_parent_change};
use crate::models::{
    NestedNode, NewTreeRecord, NodeId, RecordChanges, RecordUpdate, TreeRecord,
    UpdateTreeResponse,
};
use crate::protocol::{apply_plan, plan_layout};

pub trait TreeStore: Send + Sync {
    /// Every record, in no particular order.
    fn load_records(&self) -> impl Future<Output = Result<Vec<TreeRecord>>> + Send;

    fn find_record(&self, id: NodeId) -> impl Future<Output = Result<Option<TreeRecord>>> + Send;

    /// Direct children of `parent` (`None` for the root level), sorted by order.
    fn children_of(
        &self,
        parent: Option<NodeId>,
    ) -> impl Future<Output = Result<Vec<TreeRecord>>> + Send;

    fn max_order(&self, parent: Option<NodeId>) -> impl Future<Output = Result<Option<i64>>> + Send;

    /// Inserts a record; a missing order appends it after its last sibling.
    fn create_record(
        &self,
        record: NewTreeRecord,
    ) -> impl Future<Output = Result<TreeRecord>> + Send;

    /// Applies attribute changes. A parent change that would create a cycle is dropped
    /// and reported as a warning; an accepted one appends the record to its new group.
    fn update_record(
        &self,
        id: NodeId,
        changes: RecordChanges,
    ) -> impl Future<Output = Result<RecordUpdate>> + Send;

    /// Removes a record with all of its descendants in one step and returns the removed ids.
    fn delete_subtree(&self, id: NodeId) -> impl Future<Output = Result<Vec<NodeId>>> + Send;

    /// Commits a full tree layout as one batch.
    fn commit_layout(
        &self,
        layout: &[NestedNode],
        max_depth: Option<usize>,
    ) -> impl Future<Output = Result<UpdateTreeResponse>> + Send;
}

pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub(crate) fn require_title(title: &str) -> Result<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(LibError::invalid(
            "Title is required",
            anyhow!("tree record title is empty"),
        ));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<TreeRecord>,
    last_id: i64,
}

impl MemoryState {
    fn position(&self, id: NodeId) -> Option<usize> {
        self.records.iter().position(|record| record.id == id)
    }

    fn sibling_max_order(&self, parent: Option<NodeId>) -> Option<i64> {
        self.records
            .iter()
            .filter(|record| record.parent_id == parent)
            .map(|record| record.order)
            .max()
    }

    fn renumber_group(&mut self, parent: Option<NodeId>, at: NaiveDateTime) {
        let mut group = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.parent_id == parent)
            .map(|(position, record)| (record.order, position, record.id))
            .collect::<Vec<_>>();
        group.sort();
        let ids = group.iter().map(|(_, _, id)| *id).collect::<Vec<_>>();
        for (id, order) in renumber(&ids) {
            if let Some(record) = self.records.iter_mut().find(|record| record.id == id) {
                if record.order != order {
                    record.order = order;
                    record.updated_at = at;
                }
            }
        }
    }
}

/// Process-local store. Ids are assigned from 1 and never reuse the root sentinel.
#[derive(Debug)]
pub struct MemoryTreeStore {
    root_sentinel: i64,
    state: Mutex<MemoryState>,
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PARENT_ID)
    }
}

impl MemoryTreeStore {
    pub fn new(root_sentinel: i64) -> Self {
        Self {
            root_sentinel,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Seeds the store with existing rows, as loaded from elsewhere.
    pub fn with_records(root_sentinel: i64, records: Vec<TreeRecord>) -> Self {
        let last_id = records.iter().map(|record| record.id.0).max().unwrap_or(0);
        Self {
            root_sentinel,
            state: Mutex::new(MemoryState { records, last_id }),
        }
    }
}

impl TreeStore for MemoryTreeStore {
    async fn load_records(&self) -> Result<Vec<TreeRecord>> {
        Ok(self.state.lock().await.records.clone())
    }

    async fn find_record(&self, id: NodeId) -> Result<Option<TreeRecord>> {
        let state = self.state.lock().await;
        Ok(state.position(id).map(|index| state.records[index].clone()))
    }

    async fn children_of(&self, parent: Option<NodeId>) -> Result<Vec<TreeRecord>> {
        let state = self.state.lock().await;
        let mut children = state
            .records
            .iter()
            .filter(|record| record.parent_id == parent)
            .cloned()
            .collect::<Vec<_>>();
        children.sort_by_key(|record| record.order);
        Ok(children)
    }

    async fn max_order(&self, parent: Option<NodeId>) -> Result<Option<i64>> {
        Ok(self.state.lock().await.sibling_max_order(parent))
    }

    async fn create_record(&self, record: NewTreeRecord) -> Result<TreeRecord> {
        let title = require_title(&record.title)?;
        let mut state = self.state.lock().await;
        if let Some(parent) = record.parent_id {
            if state.position(parent).is_none() {
                return Err(LibError::not_found(
                    "Parent record not found",
                    anyhow!("cannot create a child of missing record {}", parent),
                ));
            }
        }

        let mut id = state.last_id + 1;
        if id == self.root_sentinel {
            id += 1;
        }
        state.last_id = id;

        let at = now();
        let appended = next_order(state.sibling_max_order(record.parent_id));
        let created = TreeRecord {
            id: NodeId(id),
            parent_id: record.parent_id,
            order: record.order.unwrap_or(appended),
            title,
            metadata: record.metadata,
            created_at: at,
            updated_at: at,
        };
        state.records.push(created.clone());
        if record.order.is_some() {
            state.renumber_group(record.parent_id, at);
        }

        tracing::debug!(record_id = %created.id, parent_id = ?created.parent_id, "created tree record");
        Ok(state
            .position(created.id)
            .map(|index| state.records[index].clone())
            .unwrap_or(created))
    }

    async fn update_record(&self, id: NodeId, changes: RecordChanges) -> Result<RecordUpdate> {
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or_else(|| {
            LibError::not_found("Tree record not found", anyhow!("record {} not found", id))
        })?;
        let current = state.records[index].clone();
        let screened =
            screen_parent_change(&ParentIndex::from_records(&state.records), &current, changes)?;
        let title = screened
            .changes
            .title
            .as_deref()
            .map(require_title)
            .transpose()?;

        let at = now();
        let new_parent = screened.changes.parent_id;
        let appended = new_parent.map(|parent| next_order(state.sibling_max_order(parent)));
        {
            let record = &mut state.records[index];
            if let Some(title) = title {
                record.title = title;
            }
            if let Some(metadata) = screened.changes.metadata {
                record.metadata = metadata;
            }
            if let (Some(parent), Some(order)) = (new_parent, appended) {
                record.parent_id = parent;
                record.order = order;
            }
            record.updated_at = at;
        }
        if new_parent.is_some() {
            state.renumber_group(current.parent_id, at);
        }

        Ok(RecordUpdate {
            record: state.records[index].clone(),
            warnings: screened.warnings,
        })
    }

    async fn delete_subtree(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut state = self.state.lock().await;
        let index = state.position(id).ok_or_else(|| {
            LibError::not_found("Tree record not found", anyhow!("record {} not found", id))
        })?;
        let parent = state.records[index].parent_id;

        let mut removed = vec![id];
        removed.extend(descendant_ids(&state.records, id));
        state.records.retain(|record| !removed.contains(&record.id));
        state.renumber_group(parent, now());

        tracing::info!(record_id = %id, removed = removed.len(), "deleted tree subtree");
        Ok(removed)
    }

    async fn commit_layout(
        &self,
        layout: &[NestedNode],
        max_depth: Option<usize>,
    ) -> Result<UpdateTreeResponse> {
        let mut state = self.state.lock().await;
        let plan = plan_layout(&state.records, layout, max_depth)?;
        if !plan.is_noop() {
            apply_plan(&mut state.records, &plan, now());
        }
        Ok(plan.response())
    }
}
