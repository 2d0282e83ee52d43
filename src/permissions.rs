use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::TreeRecord;

/// Can create records at the root level or below an existing record.
pub const TREE_ABILITY_CREATE: &str = "create";
/// Can change record attributes and the tree layout.
pub const TREE_ABILITY_EDIT: &str = "edit";
/// Can open a record read-only.
pub const TREE_ABILITY_VIEW: &str = "view";
/// Can delete a record together with its descendants.
pub const TREE_ABILITY_DELETE: &str = "delete";
/// Can restore a soft-deleted record.
pub const TREE_ABILITY_RESTORE: &str = "restore";
/// Can permanently delete a record.
pub const TREE_ABILITY_FORCE_DELETE: &str = "forceDelete";

/// Action names that can be mapped to abilities.
pub const TREE_ACTION_NAMES: &[&str] = &[
    "create",
    "createChild",
    "edit",
    "view",
    "delete",
    "restore",
    "forceDelete",
];

/// What an ability is checked against: the model class for creation, a record otherwise.
#[derive(Debug, Clone, Copy)]
pub enum AuthSubject<'a> {
    Model(&'a str),
    Record(&'a TreeRecord),
}

/// Boolean policy oracle for the current actor.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ability: &str, subject: AuthSubject<'_>) -> bool;
}

/// Grants every ability. Used when the caller has no policy layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _ability: &str, _subject: AuthSubject<'_>) -> bool {
        true
    }
}

impl<F> Authorizer for F
where
    F: Fn(&str, AuthSubject<'_>) -> bool + Send + Sync,
{
    fn authorize(&self, ability: &str, subject: AuthSubject<'_>) -> bool {
        self(ability, subject)
    }
}

/// Action name to ability name mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyAbilities(BTreeMap<String, String>);

impl Default for PolicyAbilities {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for action in TREE_ACTION_NAMES {
            let ability = match *action {
                "createChild" => TREE_ABILITY_CREATE,
                other => other,
            };
            map.insert(action.to_string(), ability.to_string());
        }
        Self(map)
    }
}

impl PolicyAbilities {
    pub fn ability_for(&self, action: &str) -> Option<&str> {
        self.0.get(action).map(String::as_str)
    }

    pub fn set(&mut self, action: &str, ability: &str) {
        self.0.insert(action.to_string(), ability.to_string());
    }

    pub fn remove(&mut self, action: &str) {
        self.0.remove(action);
    }
}
