use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::actions::{ActionInvocation, ActionOutcome, ActionSet, TreeActionKind};
use crate::algorithms::build_forest;
use crate::config::TreeConfig;
use crate::error::{LibError, Result};
use crate::invariants::forest_violations;
use crate::models::{
    IntegrityReport, NestedNodeList, NodeId, TreeNode, TreeRecord, TreeView, UpdateTreeResponse,
};
use crate::permissions::{AuthSubject, Authorizer, TREE_ABILITY_EDIT, TREE_ABILITY_VIEW};
use crate::store::TreeStore;

/// High-level tree operations for tool callers.
///
/// The authorizer passed to [`TreeOperations::execute`] must come from validated
/// session state, never from operation arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TreeOperation {
    LoadTree,
    UpdateTree {
        layout: NestedNodeList,
    },
    MountAction {
        action: String,
        #[serde(default)]
        invocation: ActionInvocation,
    },
    VisibleActions {
        #[serde(default)]
        record_id: Option<NodeId>,
    },
    CheckIntegrity,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TreeOperationResult {
    Tree { tree: TreeView },
    Updated { response: UpdateTreeResponse },
    Action { outcome: ActionOutcome },
    Actions { actions: Vec<String> },
    Integrity { report: IntegrityReport },
}

pub struct TreeOperations<S> {
    store: Arc<S>,
    config: Arc<TreeConfig>,
    actions: Arc<ActionSet>,
}

impl<S> Clone for TreeOperations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            actions: Arc::clone(&self.actions),
        }
    }
}

impl<S: TreeStore> TreeOperations<S> {
    pub fn new(store: Arc<S>, config: Arc<TreeConfig>, actions: ActionSet) -> Self {
        Self {
            store,
            config,
            actions: Arc::new(actions),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub async fn execute(
        &self,
        authorizer: &dyn Authorizer,
        operation: TreeOperation,
    ) -> Result<TreeOperationResult> {
        match operation {
            TreeOperation::LoadTree => {
                let tree = self.load_tree(authorizer).await?;
                Ok(TreeOperationResult::Tree { tree })
            }
            TreeOperation::UpdateTree { layout } => {
                let response = self.update_tree(authorizer, layout).await?;
                Ok(TreeOperationResult::Updated { response })
            }
            TreeOperation::MountAction { action, invocation } => {
                let outcome = self.mount_action(authorizer, &action, invocation).await?;
                Ok(TreeOperationResult::Action { outcome })
            }
            TreeOperation::VisibleActions { record_id } => {
                let actions = self.visible_actions(authorizer, record_id).await?;
                Ok(TreeOperationResult::Actions { actions })
            }
            TreeOperation::CheckIntegrity => {
                let report = self.check_integrity(authorizer).await?;
                Ok(TreeOperationResult::Integrity { report })
            }
        }
    }

    fn model_allows(
        &self,
        authorizer: &dyn Authorizer,
        action: TreeActionKind,
        fallback: &str,
    ) -> bool {
        if !self.config.enable_policy_authorization {
            return true;
        }
        let ability = self
            .config
            .policy_abilities
            .ability_for(action.name())
            .unwrap_or(fallback);
        authorizer.authorize(ability, AuthSubject::Model(self.actions.model()))
    }

    /// Whether the actor may save tree layouts. Checked against the model with the
    /// ability mapped for `edit`.
    pub fn can_update_order(&self, authorizer: &dyn Authorizer) -> bool {
        self.model_allows(authorizer, TreeActionKind::Edit, TREE_ABILITY_EDIT)
    }

    pub async fn load_tree(&self, authorizer: &dyn Authorizer) -> Result<TreeView> {
        let records = self.store.load_records().await?;
        let by_id: HashMap<NodeId, &TreeRecord> =
            records.iter().map(|record| (record.id, record)).collect();

        let mut nodes = build_forest(&records);
        for node in &mut nodes {
            self.attach_actions(node, &by_id, authorizer);
        }

        Ok(TreeView {
            max_depth: self.config.max_depth,
            can_update_order: self.can_update_order(authorizer),
            header_actions: self.actions.visible_actions(None, &self.config, authorizer),
            children_key: self.config.default_children_key_name.clone(),
            nodes,
        })
    }

    fn attach_actions(
        &self,
        node: &mut TreeNode,
        by_id: &HashMap<NodeId, &TreeRecord>,
        authorizer: &dyn Authorizer,
    ) {
        if let Some(record) = by_id.get(&node.id) {
            node.actions = self
                .actions
                .visible_actions(Some(record), &self.config, authorizer);
        }
        for child in &mut node.children {
            self.attach_actions(child, by_id, authorizer);
        }
    }

    /// Commits a full layout. Without order update permission the save is rejected
    /// as a whole.
    pub async fn update_tree(
        &self,
        authorizer: &dyn Authorizer,
        layout: NestedNodeList,
    ) -> Result<UpdateTreeResponse> {
        if !self.can_update_order(authorizer) {
            tracing::warn!("rejected tree save without order update permission");
            return Err(LibError::forbidden_with_code(
                "tree_update_forbidden",
                "You are not allowed to reorder this tree",
                anyhow!("actor lacks the edit ability for tree saves"),
            ));
        }

        let response = self
            .store
            .commit_layout(&layout, Some(self.config.max_depth))
            .await?;
        if response.reload {
            tracing::info!(
                excluded = response.excluded.len(),
                "tree save committed with differences, client must reload"
            );
        }
        Ok(response)
    }

    pub async fn mount_action(
        &self,
        authorizer: &dyn Authorizer,
        action: &str,
        invocation: ActionInvocation,
    ) -> Result<ActionOutcome> {
        self.actions
            .execute(
                self.store.as_ref(),
                &self.config,
                authorizer,
                action,
                invocation,
            )
            .await
    }

    pub async fn visible_actions(
        &self,
        authorizer: &dyn Authorizer,
        record_id: Option<NodeId>,
    ) -> Result<Vec<String>> {
        let Some(record_id) = record_id else {
            return Ok(self.actions.visible_actions(None, &self.config, authorizer));
        };
        let record = self.store.find_record(record_id).await?.ok_or_else(|| {
            LibError::not_found(
                "Tree record not found",
                anyhow!("record {} not found", record_id),
            )
        })?;
        Ok(self
            .actions
            .visible_actions(Some(&record), &self.config, authorizer))
    }

    /// Lists every forest violation in the stored records. Needs the ability mapped for
    /// `view` on the model when policies are enabled.
    pub async fn check_integrity(&self, authorizer: &dyn Authorizer) -> Result<IntegrityReport> {
        if !self.model_allows(authorizer, TreeActionKind::View, TREE_ABILITY_VIEW) {
            return Err(LibError::forbidden_with_code(
                "tree_integrity_forbidden",
                "You are not allowed to inspect this tree",
                anyhow!("actor lacks the view ability for integrity reports"),
            ));
        }
        let records = self.store.load_records().await?;
        let violations = forest_violations(&records, Some(self.config.max_depth));
        if !violations.is_empty() {
            tracing::warn!(violations = violations.len(), "tree integrity check failed");
        }
        Ok(IntegrityReport {
            valid: violations.is_empty(),
            violations,
        })
    }
}
