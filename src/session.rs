use std::collections::HashSet;

use anyhow::anyhow;

use crate::engine::NestableTree;
use crate::error::{LibError, Result};
use crate::models::{NestedNodeList, NodeId, TreeView, UpdateTreeResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Saving,
    Applied { reload: bool },
    Rejected,
}

impl SaveState {
    pub fn is_saving(&self) -> bool {
        matches!(self, SaveState::Saving)
    }
}

/// Client side of one loaded tree. Walks one save at a time through
/// `Idle -> Saving -> Applied | Rejected`; the permission to save is fixed at load.
#[derive(Debug, Clone)]
pub struct TreeSession {
    tree: NestableTree,
    can_update_order: bool,
    header_actions: Vec<String>,
    root_sentinel: i64,
    state: SaveState,
}

impl TreeSession {
    pub fn load(view: TreeView, root_sentinel: i64) -> Result<Self> {
        let tree = NestableTree::initialize(view.nodes, view.max_depth)?
            .with_root_sentinel(root_sentinel);
        Ok(Self {
            tree,
            can_update_order: view.can_update_order,
            header_actions: view.header_actions,
            root_sentinel,
            state: SaveState::Idle,
        })
    }

    pub fn tree(&self) -> &NestableTree {
        &self.tree
    }

    pub fn can_update_order(&self) -> bool {
        self.can_update_order
    }

    pub fn header_actions(&self) -> &[String] {
        &self.header_actions
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state.is_saving() {
            return Err(LibError::conflict(
                "save_in_progress",
                "A save is already in progress",
                anyhow!("tree save still awaiting a response"),
            ));
        }
        Ok(())
    }

    /// Drag move. Rejected for read-only trees and while a save is in flight.
    pub fn move_node(
        &mut self,
        node_id: NodeId,
        new_parent: Option<NodeId>,
        new_index: usize,
    ) -> Result<()> {
        self.ensure_idle()?;
        if !self.can_update_order {
            return Err(LibError::forbidden_with_code(
                "tree_update_forbidden",
                "This tree is read-only",
                anyhow!("order updates are not permitted for this session"),
            ));
        }
        self.tree.move_node(node_id, new_parent, new_index)
    }

    pub fn toggle(&mut self, node_id: NodeId) -> Result<bool> {
        self.tree.toggle(node_id)
    }

    pub fn collapse_all(&mut self) {
        self.tree.collapse_all();
    }

    pub fn expand_all(&mut self) {
        self.tree.expand_all();
    }

    /// Enters `Saving` and returns the payload to submit.
    pub fn begin_save(&mut self) -> Result<NestedNodeList> {
        if !self.can_update_order {
            return Err(LibError::forbidden_with_code(
                "tree_update_forbidden",
                "You are not allowed to reorder this tree",
                anyhow!("save attempted without order update permission"),
            ));
        }
        self.ensure_idle()?;
        self.state = SaveState::Saving;
        Ok(self.tree.to_payload())
    }

    /// Resolves the in-flight save. A failed request leaves the local structure as the
    /// user arranged it.
    pub fn finish_save(
        &mut self,
        result: Result<UpdateTreeResponse>,
    ) -> Result<UpdateTreeResponse> {
        if !self.state.is_saving() {
            return Err(LibError::invalid(
                "No save is in progress",
                anyhow!("finish_save called in state {:?}", self.state),
            ));
        }
        match result {
            Ok(response) => {
                self.state = SaveState::Applied {
                    reload: response.reload,
                };
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(code = err.code, "tree save rejected");
                self.state = SaveState::Rejected;
                Err(err)
            }
        }
    }

    pub fn needs_reload(&self) -> bool {
        matches!(self.state, SaveState::Applied { reload: true })
    }

    /// Replaces the structure with a freshly loaded view, keeping nodes that were
    /// collapsed before collapsed.
    pub fn reload(&mut self, view: TreeView) -> Result<()> {
        self.ensure_idle()?;
        let collapsed: HashSet<NodeId> = self.tree.collapsed_ids().into_iter().collect();
        let mut tree = NestableTree::initialize(view.nodes, view.max_depth)?
            .with_root_sentinel(self.root_sentinel);
        for id in collapsed {
            tree.set_collapsed(id, true);
        }
        self.tree = tree;
        self.can_update_order = view.can_update_order;
        self.header_actions = view.header_actions;
        self.state = SaveState::Idle;
        Ok(())
    }

    /// Leaves `Applied` or `Rejected` without reloading.
    pub fn acknowledge(&mut self) {
        if !self.state.is_saving() {
            self.state = SaveState::Idle;
        }
    }
}
