use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form form state submitted with create and edit actions, keyed by column name.
pub type FormData = Map<String, Value>;

/// Ordered top-level layout submitted by a save. Parent and order are implied by position.
pub type NestedNodeList = Vec<NestedNode>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

impl From<i64> for NodeId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A persisted tree row. `parent_id == None` means the record sits at the root level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub order: i64,
    pub title: String,
    pub metadata: Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A node as handed to the tree UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub order: i64,
    /// HTML-escaped display label.
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
    #[serde(default)]
    pub collapsed: bool,
}

impl TreeNode {
    pub fn leaf(id: NodeId, parent_id: Option<NodeId>, order: i64, title: &str) -> Self {
        Self {
            id,
            parent_id,
            order,
            title: sanitize_title(title),
            actions: Vec::new(),
            children: Vec::new(),
            collapsed: false,
        }
    }
}

/// One entry of a save payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedNode {
    pub id: NodeId,
    #[serde(default)]
    pub children: Vec<NestedNode>,
}

impl NestedNode {
    pub fn leaf(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(id: impl Into<NodeId>, children: Vec<NestedNode>) -> Self {
        Self {
            id: id.into(),
            children,
        }
    }
}

/// Structure-only snapshot produced by the ordering engine. `parent_id` carries the
/// configured root sentinel for top-level nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    pub id: NodeId,
    pub parent_id: i64,
    pub order: i64,
    #[serde(default)]
    pub children: Vec<SerializedNode>,
}

impl From<&SerializedNode> for NestedNode {
    fn from(value: &SerializedNode) -> Self {
        Self {
            id: value.id,
            children: value.children.iter().map(NestedNode::from).collect(),
        }
    }
}

pub const DEFAULT_CHILDREN_KEY: &str = "children";

const NODE_FIELDS: &[&str] = &["id", "parentId", "order", "title", "actions", "collapsed"];

/// Whether `key` collides with a field of a serialized [`TreeNode`].
pub fn is_reserved_node_key(key: &str) -> bool {
    NODE_FIELDS.contains(&key)
}

/// The loaded tree. On the wire every node lists its children under `children_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireTreeView", into = "WireTreeView")]
pub struct TreeView {
    pub max_depth: usize,
    pub can_update_order: bool,
    pub header_actions: Vec<String>,
    pub children_key: String,
    pub nodes: Vec<TreeNode>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTreeView {
    max_depth: usize,
    can_update_order: bool,
    #[serde(default)]
    header_actions: Vec<String>,
    #[serde(default = "default_children_key")]
    children_key: String,
    nodes: Vec<Value>,
}

fn default_children_key() -> String {
    DEFAULT_CHILDREN_KEY.to_string()
}

fn keyed_node(node: &TreeNode, children_key: &str) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::from(node.id.0));
    map.insert(
        "parentId".to_string(),
        node.parent_id.map_or(Value::Null, |parent| Value::from(parent.0)),
    );
    map.insert("order".to_string(), Value::from(node.order));
    map.insert("title".to_string(), Value::from(node.title.as_str()));
    if !node.actions.is_empty() {
        map.insert("actions".to_string(), Value::from(node.actions.clone()));
    }
    map.insert(
        children_key.to_string(),
        Value::Array(
            node.children
                .iter()
                .map(|child| keyed_node(child, children_key))
                .collect(),
        ),
    );
    map.insert("collapsed".to_string(), Value::Bool(node.collapsed));
    Value::Object(map)
}

fn unkeyed_node(value: Value, children_key: &str) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    if let Some(children) = map.remove(children_key) {
        let children = match children {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|child| unkeyed_node(child, children_key))
                    .collect(),
            ),
            other => other,
        };
        map.insert(DEFAULT_CHILDREN_KEY.to_string(), children);
    }
    Value::Object(map)
}

impl From<TreeView> for WireTreeView {
    fn from(view: TreeView) -> Self {
        let nodes = view
            .nodes
            .iter()
            .map(|node| keyed_node(node, &view.children_key))
            .collect();
        Self {
            max_depth: view.max_depth,
            can_update_order: view.can_update_order,
            header_actions: view.header_actions,
            children_key: view.children_key,
            nodes,
        }
    }
}

impl TryFrom<WireTreeView> for TreeView {
    type Error = serde_json::Error;

    fn try_from(wire: WireTreeView) -> std::result::Result<Self, Self::Error> {
        let nodes = wire
            .nodes
            .into_iter()
            .map(|node| serde_json::from_value(unkeyed_node(node, &wire.children_key)))
            .collect::<std::result::Result<Vec<TreeNode>, _>>()?;
        Ok(Self {
            max_depth: wire.max_depth,
            can_update_order: wire.can_update_order,
            header_actions: wire.header_actions,
            children_key: wire.children_key,
            nodes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The new parent is the node itself or one of its descendants.
    Cycle,
    /// The payload names a record that does not exist.
    UnknownNode,
    /// The payload nests a node under a record that does not exist.
    UnknownParent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedMove {
    pub node_id: NodeId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTreeResponse {
    pub reload: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedMove>,
}

/// A record about to be inserted. Missing order means "append after the last sibling".
#[derive(Debug, Clone, PartialEq)]
pub struct NewTreeRecord {
    pub parent_id: Option<NodeId>,
    pub order: Option<i64>,
    pub title: String,
    pub metadata: Value,
}

/// Attribute changes applied by the edit action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordChanges {
    pub title: Option<String>,
    /// `Some(None)` moves the record to the root level.
    pub parent_id: Option<Option<NodeId>>,
    pub metadata: Option<Value>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.parent_id.is_none() && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    pub record: TreeRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeInvariantViolation {
    SelfParent {
        node_id: NodeId,
    },
    UnknownParent {
        node_id: NodeId,
        parent_id: NodeId,
    },
    CycleDetected {
        node_ids: Vec<NodeId>,
    },
    DuplicateOrder {
        parent_id: Option<NodeId>,
        order: i64,
    },
    OrderGap {
        parent_id: Option<NodeId>,
        expected: i64,
        found: i64,
    },
    DepthExceeded {
        node_id: NodeId,
        depth: usize,
        max_depth: usize,
    },
}

impl TreeInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            TreeInvariantViolation::SelfParent { .. } => "tree_self_parent",
            TreeInvariantViolation::UnknownParent { .. } => "tree_unknown_parent",
            TreeInvariantViolation::CycleDetected { .. } => "tree_cycle",
            TreeInvariantViolation::DuplicateOrder { .. } => "tree_duplicate_order",
            TreeInvariantViolation::OrderGap { .. } => "tree_order_gap",
            TreeInvariantViolation::DepthExceeded { .. } => "tree_depth_exceeded",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            TreeInvariantViolation::SelfParent { .. } => "A node cannot be its own parent",
            TreeInvariantViolation::UnknownParent { .. } => {
                "A node references a parent that does not exist"
            }
            TreeInvariantViolation::CycleDetected { .. } => "Tree parent links must be acyclic",
            TreeInvariantViolation::DuplicateOrder { .. } => {
                "Sibling order values must be unique"
            }
            TreeInvariantViolation::OrderGap { .. } => "Sibling order values must be contiguous",
            TreeInvariantViolation::DepthExceeded { .. } => {
                "A node is nested deeper than the tree allows"
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub violations: Vec<TreeInvariantViolation>,
}

/// Escapes markup so a record title can be rendered verbatim.
pub fn sanitize_title(title: &str) -> String {
    let mut escaped = String::with_capacity(title.len());
    for ch in title.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sanitize_title_escapes_markup() {
        assert_eq!(
            sanitize_title("<script>alert('x')</script> & co"),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt; &amp; co"
        );
        assert_eq!(sanitize_title("Plain title"), "Plain title");
    }

    #[test]
    fn tree_view_uses_the_configured_children_key() {
        let mut child = TreeNode::leaf(NodeId(2), Some(NodeId(1)), 0, "Child");
        child.actions = vec!["edit".to_string()];
        let mut root = TreeNode::leaf(NodeId(1), None, 0, "Root");
        root.children.push(child);
        let view = TreeView {
            max_depth: 2,
            can_update_order: true,
            header_actions: vec!["create".to_string()],
            children_key: "subcategories".to_string(),
            nodes: vec![root],
        };

        let value = serde_json::to_value(&view).expect("serialize");
        assert_eq!(value["childrenKey"], json!("subcategories"));
        assert!(value["nodes"][0].get("children").is_none());
        assert_eq!(value["nodes"][0]["subcategories"][0]["id"], json!(2));
        assert_eq!(value["nodes"][0]["subcategories"][0]["parentId"], json!(1));
        assert_eq!(value["nodes"][0]["subcategories"][0]["subcategories"], json!([]));

        let back: TreeView = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, view);
    }

    #[test]
    fn tree_view_defaults_to_children() {
        let view: TreeView = serde_json::from_value(json!({
            "maxDepth": 1,
            "canUpdateOrder": false,
            "nodes": [{"id": 1, "parentId": null, "order": 0, "title": "A",
                       "children": [{"id": 2, "parentId": 1, "order": 0, "title": "B"}]}]
        }))
        .expect("deserialize");
        assert_eq!(view.children_key, DEFAULT_CHILDREN_KEY);
        assert_eq!(view.nodes[0].children[0].id, NodeId(2));
        assert!(is_reserved_node_key("title"));
        assert!(!is_reserved_node_key(DEFAULT_CHILDREN_KEY));
    }

    #[test]
    fn nested_payload_accepts_missing_children() {
        let payload: NestedNodeList =
            serde_json::from_value(json!([{"id": 1}, {"id": 2, "children": [{"id": 3}]}]))
                .expect("payload should parse");
        assert_eq!(payload.len(), 2);
        assert!(payload[0].children.is_empty());
        assert_eq!(payload[1].children[0].id, NodeId(3));
    }

    #[test]
    fn node_id_parses_from_trimmed_string() {
        assert_eq!("  42 ".parse::<NodeId>().expect("valid id"), NodeId(42));
        assert!("abc".parse::<NodeId>().is_err());
    }

    #[test]
    fn update_response_omits_empty_exclusions() {
        let response = UpdateTreeResponse {
            reload: false,
            excluded: vec![],
        };
        assert_eq!(
            serde_json::to_value(&response).expect("serializes"),
            json!({"reload": false})
        );
    }

    #[test]
    fn serialized_snapshot_converts_to_payload() {
        let snapshot = SerializedNode {
            id: NodeId(1),
            parent_id: -1,
            order: 0,
            children: vec![SerializedNode {
                id: NodeId(2),
                parent_id: 1,
                order: 0,
                children: vec![],
            }],
        };
        let nested = NestedNode::from(&snapshot);
        assert_eq!(
            nested,
            NestedNode::with_children(1, vec![NestedNode::leaf(2)])
        );
    }
}
