use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{DEFAULT_CHILDREN_KEY, NodeId, is_reserved_node_key};
use crate::permissions::PolicyAbilities;

pub const DEFAULT_PARENT_ID: i64 = -1;
pub const DEFAULT_MAX_DEPTH: usize = 999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub parent: String,
    pub order: String,
    pub title: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            parent: "parent_id".to_string(),
            order: "order".to_string(),
            title: "title".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub column_name: ColumnNames,
    pub default_parent_id: i64,
    pub default_children_key_name: String,
    pub enable_policy_authorization: bool,
    pub policy_abilities: PolicyAbilities,
    pub max_depth: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            column_name: ColumnNames::default(),
            default_parent_id: DEFAULT_PARENT_ID,
            default_children_key_name: DEFAULT_CHILDREN_KEY.to_string(),
            enable_policy_authorization: false,
            policy_abilities: PolicyAbilities::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TreeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: TreeConfig = toml::from_str(raw).map_err(|err| {
            LibError::invalid_with_code(
                "invalid_tree_config",
                "Tree configuration could not be parsed",
                anyhow!(err),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LibError::invalid_with_code(
                "invalid_tree_config",
                "Tree configuration file could not be read",
                anyhow!("failed to read {}: {}", path.display(), err),
            )
        })?;
        Self::from_toml_str(&raw)
    }

    /// Applies `TREE_ENABLE_POLICY_AUTHORIZATION`, `TREE_DEFAULT_PARENT_ID` and
    /// `TREE_MAX_DEPTH` on top of the current values.
    pub fn with_env_overrides(self) -> Result<Self> {
        let vars: BTreeMap<String, String> = env::vars()
            .filter(|(key, _)| key.starts_with("TREE_"))
            .collect();
        self.with_overrides(&vars)
    }

    fn with_overrides(mut self, vars: &BTreeMap<String, String>) -> Result<Self> {
        if let Some(value) = vars.get("TREE_ENABLE_POLICY_AUTHORIZATION") {
            self.enable_policy_authorization = parse_flag(value);
        }
        if let Some(value) = vars.get("TREE_DEFAULT_PARENT_ID") {
            self.default_parent_id = value.trim().parse().map_err(|err| {
                LibError::invalid_with_code(
                    "invalid_tree_config",
                    "TREE_DEFAULT_PARENT_ID must be an integer",
                    anyhow!("invalid TREE_DEFAULT_PARENT_ID '{}': {}", value, err),
                )
            })?;
        }
        if let Some(value) = vars.get("TREE_MAX_DEPTH") {
            self.max_depth = value.trim().parse().map_err(|err| {
                LibError::invalid_with_code(
                    "invalid_tree_config",
                    "TREE_MAX_DEPTH must be a non-negative integer",
                    anyhow!("invalid TREE_MAX_DEPTH '{}': {}", value, err),
                )
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let columns = [
            &self.column_name.parent,
            &self.column_name.order,
            &self.column_name.title,
        ];
        for column in columns {
            if !is_plain_identifier(column) {
                return Err(LibError::invalid_with_code(
                    "invalid_tree_config",
                    "Tree column names must be plain identifiers",
                    anyhow!("invalid column name '{}'", column),
                ));
            }
        }
        if columns[0] == columns[1] || columns[0] == columns[2] || columns[1] == columns[2] {
            return Err(LibError::invalid_with_code(
                "invalid_tree_config",
                "Tree column names must be distinct",
                anyhow!("duplicate column names in {:?}", self.column_name),
            ));
        }
        if self.default_children_key_name.trim().is_empty() {
            return Err(LibError::invalid_with_code(
                "invalid_tree_config",
                "Children key name is required",
                anyhow!("empty default_children_key_name"),
            ));
        }
        if is_reserved_node_key(&self.default_children_key_name) {
            return Err(LibError::invalid_with_code(
                "invalid_tree_config",
                "Children key name clashes with a node field",
                anyhow!(
                    "default_children_key_name '{}' is a node field",
                    self.default_children_key_name
                ),
            ));
        }
        Ok(())
    }

    /// Maps a stored parent column value to a parent reference. Both the sentinel and
    /// NULL resolve to the root level.
    pub fn parent_from_column(&self, raw: Option<i64>) -> Option<NodeId> {
        match raw {
            None => None,
            Some(value) if value == self.default_parent_id => None,
            Some(value) => Some(NodeId(value)),
        }
    }

    pub fn parent_to_column(&self, parent: Option<NodeId>) -> i64 {
        parent.map_or(self.default_parent_id, |id| id.0)
    }
}

fn parse_flag(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes"
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
