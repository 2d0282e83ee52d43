use std::collections::HashMap;

use anyhow::anyhow;

use crate::config::DEFAULT_PARENT_ID;
use crate::error::{LibError, Result};
use crate::guard::{self, ParentLookup};
use crate::models::{NestedNode, NestedNodeList, NodeId, SerializedNode, TreeNode, sanitize_title};

#[derive(Debug, Clone)]
struct Slot {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    title: String,
    actions: Vec<String>,
    collapsed: bool,
}

#[derive(Debug, Clone)]
pub struct NestableTree {
    max_depth: usize,
    root_sentinel: i64,
    roots: Vec<NodeId>,
    slots: HashMap<NodeId, Slot>,
}

impl NestableTree {
    /// Builds the engine from server-rendered root nodes with their children embedded.
    /// Titles are expected to be sanitized already.
    pub fn initialize(roots: Vec<TreeNode>, max_depth: usize) -> Result<Self> {
        let mut tree = Self {
            max_depth,
            root_sentinel: DEFAULT_PARENT_ID,
            roots: Vec::with_capacity(roots.len()),
            slots: HashMap::new(),
        };
        for node in roots {
            let id = node.id;
            tree.insert(node, None)?;
            tree.roots.push(id);
        }
        Ok(tree)
    }

    pub fn with_root_sentinel(mut self, root_sentinel: i64) -> Self {
        self.root_sentinel = root_sentinel;
        self
    }

    fn insert(&mut self, node: TreeNode, parent: Option<NodeId>) -> Result<()> {
        if self.slots.contains_key(&node.id) {
            return Err(LibError::invalid(
                "Node IDs must be unique within a tree",
                anyhow!("duplicate node id {}", node.id),
            ));
        }

        let child_ids = node.children.iter().map(|child| child.id).collect();
        self.slots.insert(
            node.id,
            Slot {
                parent,
                children: child_ids,
                title: node.title,
                actions: node.actions,
                collapsed: node.collapsed,
            },
        );
        for child in node.children {
            self.insert(child, Some(node.id))?;
        }
        Ok(())
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Ordered child ids of `parent`, or the root list for `None`.
    pub fn children(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(id) => self
                .slots
                .get(&id)
                .map(|slot| slot.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Root nodes have depth 0.
    pub fn depth(&self, id: NodeId) -> Option<usize> {
        let mut depth = 0usize;
        let mut current = self.slots.get(&id)?.parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.slots.get(&parent)?.parent;
        }
        Some(depth)
    }

    /// Number of levels below `id`; a leaf has height 0.
    pub fn height(&self, id: NodeId) -> usize {
        self.slots
            .get(&id)
            .map(|slot| {
                slot.children
                    .iter()
                    .map(|child| self.height(*child) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Relocates `node_id` under `new_parent` (`None` for the top level) at `new_index`
    /// among its new siblings. Indices past the end append.
    ///
    /// A rejected move leaves the structure untouched.
    pub fn move_node(
        &mut self,
        node_id: NodeId,
        new_parent: Option<NodeId>,
        new_index: usize,
    ) -> Result<()> {
        if !self.contains(node_id) {
            return Err(LibError::not_found(
                "Node not found in tree",
                anyhow!("cannot move unknown node {}", node_id),
            ));
        }
        if let Some(parent) = new_parent {
            if !self.contains(parent) {
                return Err(LibError::not_found(
                    "Target parent not found in tree",
                    anyhow!("cannot move {} under unknown node {}", node_id, parent),
                ));
            }
        }

        guard::ensure_no_cycle(&*self, node_id, new_parent)?;

        let new_depth = match new_parent {
            Some(parent) => self.depth(parent).unwrap_or(0) + 1,
            None => 0,
        };
        let attempted_depth = new_depth + self.height(node_id);
        if attempted_depth > self.max_depth {
            return Err(LibError::depth_exceeded(
                self.max_depth,
                attempted_depth,
                anyhow!(
                    "moving {} under {:?} reaches depth {} (max {})",
                    node_id,
                    new_parent,
                    attempted_depth,
                    self.max_depth
                ),
            ));
        }

        let old_parent = self.slots[&node_id].parent;
        self.sibling_list_mut(old_parent).retain(|id| *id != node_id);
        let siblings = self.sibling_list_mut(new_parent);
        let index = new_index.min(siblings.len());
        siblings.insert(index, node_id);
        if let Some(slot) = self.slots.get_mut(&node_id) {
            slot.parent = new_parent;
        }
        Ok(())
    }

    fn sibling_list_mut(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        match parent {
            Some(id) => match self.slots.get_mut(&id) {
                Some(slot) => &mut slot.children,
                None => &mut self.roots,
            },
            None => &mut self.roots,
        }
    }

    /// Order-preserving snapshot of every node with `0..n-1` order per level.
    pub fn serialize(&self) -> Vec<SerializedNode> {
        self.serialize_level(None)
    }

    fn serialize_level(&self, parent: Option<NodeId>) -> Vec<SerializedNode> {
        let parent_value = parent.map_or(self.root_sentinel, |id| id.0);
        self.children(parent)
            .iter()
            .enumerate()
            .map(|(order, id)| SerializedNode {
                id: *id,
                parent_id: parent_value,
                order: order as i64,
                children: self.serialize_level(Some(*id)),
            })
            .collect()
    }

    /// The save payload: the same structure with parent and order left implicit.
    pub fn to_payload(&self) -> NestedNodeList {
        self.payload_level(None)
    }

    fn payload_level(&self, parent: Option<NodeId>) -> NestedNodeList {
        self.children(parent)
            .iter()
            .map(|id| NestedNode {
                id: *id,
                children: self.payload_level(Some(*id)),
            })
            .collect()
    }

    /// Current structure as display nodes.
    pub fn to_nodes(&self) -> Vec<TreeNode> {
        self.nodes_level(None)
    }

    fn nodes_level(&self, parent: Option<NodeId>) -> Vec<TreeNode> {
        self.children(parent)
            .iter()
            .enumerate()
            .filter_map(|(order, id)| {
                self.slots.get(id).map(|slot| TreeNode {
                    id: *id,
                    parent_id: parent,
                    order: order as i64,
                    title: slot.title.clone(),
                    actions: slot.actions.clone(),
                    children: self.nodes_level(Some(*id)),
                    collapsed: slot.collapsed,
                })
            })
            .collect()
    }

    pub fn title(&self, id: NodeId) -> Option<&str> {
        self.slots.get(&id).map(|slot| slot.title.as_str())
    }

    /// Re-labels a node locally, e.g. after an edit action returned.
    pub fn set_title(&mut self, id: NodeId, raw_title: &str) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.title = sanitize_title(raw_title);
                true
            }
            None => false,
        }
    }

    pub fn is_collapsed(&self, id: NodeId) -> bool {
        self.slots.get(&id).is_some_and(|slot| slot.collapsed)
    }

    /// Collapses every node that has children.
    pub fn collapse_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.collapsed = !slot.children.is_empty();
        }
    }

    pub fn expand_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.collapsed = false;
        }
    }

    /// Flips the collapsed flag and returns the new value.
    pub fn toggle(&mut self, id: NodeId) -> Result<bool> {
        let slot = self.slots.get_mut(&id).ok_or_else(|| {
            LibError::not_found("Node not found in tree", anyhow!("cannot toggle {}", id))
        })?;
        slot.collapsed = !slot.collapsed;
        Ok(slot.collapsed)
    }

    pub(crate) fn collapsed_ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.collapsed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn set_collapsed(&mut self, id: NodeId, collapsed: bool) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.collapsed = collapsed;
        }
    }
}

impl ParentLookup for NestableTree {
    fn parent_of(&self, id: NodeId) -> Option<Option<NodeId>> {
        self.slots.get(&id).map(|slot| slot.parent)
    }
}
