use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TreeConfig;
use crate::error::{LibError, Result};
use crate::models::{FormData, NewTreeRecord, NodeId, RecordChanges, TreeRecord};
use crate::permissions::{AuthSubject, Authorizer};
use crate::store::TreeStore;

pub const DEFAULT_MODEL_NAME: &str = "TreeRecord";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeActionKind {
    Create,
    CreateChild,
    Edit,
    View,
    Delete,
    Restore,
    ForceDelete,
}

impl TreeActionKind {
    pub const ALL: [TreeActionKind; 7] = [
        TreeActionKind::Create,
        TreeActionKind::CreateChild,
        TreeActionKind::Edit,
        TreeActionKind::View,
        TreeActionKind::Delete,
        TreeActionKind::Restore,
        TreeActionKind::ForceDelete,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TreeActionKind::Create => "create",
            TreeActionKind::CreateChild => "createChild",
            TreeActionKind::Edit => "edit",
            TreeActionKind::View => "view",
            TreeActionKind::Delete => "delete",
            TreeActionKind::Restore => "restore",
            TreeActionKind::ForceDelete => "forceDelete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Header actions act on the model, every other action on one record.
    pub const fn targets_record(self) -> bool {
        !matches!(self, TreeActionKind::Create)
    }
}

impl fmt::Display for TreeActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type VisibilityFn = Arc<dyn Fn(Option<&TreeRecord>) -> bool + Send + Sync>;
pub type FormDataFn = Arc<dyn Fn(FormData) -> FormData + Send + Sync>;
pub type BeforeFn = Arc<dyn Fn(TreeActionKind, Option<&TreeRecord>) + Send + Sync>;
pub type AfterFn = Arc<dyn Fn(TreeActionKind, &ActionOutcome) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ActionHooks {
    pub before: Option<BeforeFn>,
    pub after: Option<AfterFn>,
    /// Rewrites submitted form data before it is persisted.
    pub mutate_form_data: Option<FormDataFn>,
    /// Rewrites record data before it is shown in a form.
    pub mutate_record_data: Option<FormDataFn>,
}

impl fmt::Debug for ActionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("mutate_form_data", &self.mutate_form_data.is_some())
            .field("mutate_record_data", &self.mutate_record_data.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct TreeAction {
    kind: TreeActionKind,
    label: String,
    visible: Option<VisibilityFn>,
    hooks: ActionHooks,
}

impl fmt::Debug for TreeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeAction")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("visible", &self.visible.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl TreeAction {
    pub fn new(kind: TreeActionKind) -> Self {
        let label = match kind {
            TreeActionKind::Create => "Create",
            TreeActionKind::CreateChild => "Add child",
            TreeActionKind::Edit => "Edit",
            TreeActionKind::View => "View",
            TreeActionKind::Delete => "Delete",
            TreeActionKind::Restore => "Restore",
            TreeActionKind::ForceDelete => "Force delete",
        };
        Self {
            kind,
            label: label.to_string(),
            visible: None,
            hooks: ActionHooks::default(),
        }
    }

    pub fn kind(&self) -> TreeActionKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn visible_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&TreeRecord>) -> bool + Send + Sync + 'static,
    {
        self.visible = Some(Arc::new(predicate));
        self
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(TreeActionKind, Option<&TreeRecord>) + Send + Sync + 'static,
    {
        self.hooks.before = Some(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(TreeActionKind, &ActionOutcome) + Send + Sync + 'static,
    {
        self.hooks.after = Some(Arc::new(hook));
        self
    }

    pub fn mutate_form_data<F>(mut self, hook: F) -> Self
    where
        F: Fn(FormData) -> FormData + Send + Sync + 'static,
    {
        self.hooks.mutate_form_data = Some(Arc::new(hook));
        self
    }

    pub fn mutate_record_data<F>(mut self, hook: F) -> Self
    where
        F: Fn(FormData) -> FormData + Send + Sync + 'static,
    {
        self.hooks.mutate_record_data = Some(Arc::new(hook));
        self
    }

    fn base_visible(&self, record: Option<&TreeRecord>) -> bool {
        self.visible.as_ref().is_none_or(|predicate| predicate(record))
    }
}

/// Which standard actions a tree page offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionFlags {
    pub has_create: bool,
    pub has_create_child: bool,
    pub has_edit: bool,
    pub has_view: bool,
    pub has_delete: bool,
}

impl Default for ActionFlags {
    fn default() -> Self {
        Self {
            has_create: true,
            has_create_child: false,
            has_edit: true,
            has_view: false,
            has_delete: false,
        }
    }
}

/// Arguments of one action invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInvocation {
    #[serde(default)]
    pub record_id: Option<NodeId>,
    #[serde(default)]
    pub arguments: FormData,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Created {
        record: TreeRecord,
    },
    Updated {
        record: TreeRecord,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Viewed {
        record: TreeRecord,
        form_data: FormData,
    },
    Deleted {
        removed: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
pub struct ActionSet {
    model: String,
    actions: Vec<TreeAction>,
}

impl Default for ActionSet {
    fn default() -> Self {
        Self::standard(ActionFlags::default())
    }
}

impl ActionSet {
    pub fn empty() -> Self {
        Self {
            model: DEFAULT_MODEL_NAME.to_string(),
            actions: Vec::new(),
        }
    }

    pub fn standard(flags: ActionFlags) -> Self {
        let enabled = [
            (TreeActionKind::Create, flags.has_create),
            (TreeActionKind::CreateChild, flags.has_create_child),
            (TreeActionKind::Edit, flags.has_edit),
            (TreeActionKind::View, flags.has_view),
            (TreeActionKind::Delete, flags.has_delete),
        ];
        let mut set = Self::empty();
        for (kind, on) in enabled {
            if on {
                set.actions.push(TreeAction::new(kind));
            }
        }
        set
    }

    /// Model name handed to the authorizer for model-level checks.
    pub fn for_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Adds an action, replacing a configured one of the same kind.
    pub fn with(mut self, action: TreeAction) -> Self {
        match self.actions.iter_mut().find(|existing| existing.kind == action.kind) {
            Some(existing) => *existing = action,
            None => self.actions.push(action),
        }
        self
    }

    pub fn without(mut self, kind: TreeActionKind) -> Self {
        self.actions.retain(|action| action.kind != kind);
        self
    }

    pub fn get(&self, kind: TreeActionKind) -> Option<&TreeAction> {
        self.actions.iter().find(|action| action.kind == kind)
    }

    pub fn actions(&self) -> &[TreeAction] {
        &self.actions
    }

    /// Looks up a configured action by its wire name.
    pub fn resolve(&self, name: &str) -> Result<&TreeAction> {
        TreeActionKind::from_name(name)
            .and_then(|kind| self.get(kind))
            .ok_or_else(|| LibError::action_not_resolvable(name))
    }

    fn ability_for<'a>(&self, config: &'a TreeConfig, action: &'a TreeAction) -> &'a str {
        config
            .policy_abilities
            .ability_for(action.name())
            .unwrap_or(action.name())
    }

    fn authorized(
        &self,
        action: &TreeAction,
        record: Option<&TreeRecord>,
        config: &TreeConfig,
        authorizer: &dyn Authorizer,
    ) -> bool {
        if !config.enable_policy_authorization {
            return true;
        }
        let ability = self.ability_for(config, action);
        let subject = match (action.kind.targets_record(), record) {
            (true, Some(record)) => AuthSubject::Record(record),
            _ => AuthSubject::Model(&self.model),
        };
        authorizer.authorize(ability, subject)
    }

    pub fn is_visible(
        &self,
        action: &TreeAction,
        record: Option<&TreeRecord>,
        config: &TreeConfig,
        authorizer: &dyn Authorizer,
    ) -> bool {
        action.base_visible(record) && self.authorized(action, record, config, authorizer)
    }

    /// Names of the visible record actions for `record`, or of the visible header
    /// actions when `record` is `None`. Actions that are not visible are left out.
    pub fn visible_actions(
        &self,
        record: Option<&TreeRecord>,
        config: &TreeConfig,
        authorizer: &dyn Authorizer,
    ) -> Vec<String> {
        self.actions
            .iter()
            .filter(|action| action.kind.targets_record() == record.is_some())
            .filter(|action| self.is_visible(action, record, config, authorizer))
            .map(|action| action.name().to_string())
            .collect()
    }

    /// Runs an action on behalf of the current actor.
    pub async fn execute<S: TreeStore>(
        &self,
        store: &S,
        config: &TreeConfig,
        authorizer: &dyn Authorizer,
        name: &str,
        invocation: ActionInvocation,
    ) -> Result<ActionOutcome> {
        let action = self.resolve(name)?;
        let record = if action.kind.targets_record() {
            let record_id = invocation.record_id.ok_or_else(|| {
                LibError::invalid(
                    "This action needs a record",
                    anyhow!("action {} invoked without a record id", name),
                )
            })?;
            let record = store.find_record(record_id).await?.ok_or_else(|| {
                LibError::not_found(
                    "Tree record not found",
                    anyhow!("action {} targets missing record {}", name, record_id),
                )
            })?;
            Some(record)
        } else {
            None
        };

        if !action.base_visible(record.as_ref())
            || !self.authorized(action, record.as_ref(), config, authorizer)
        {
            let ability = self.ability_for(config, action);
            return Err(LibError::unauthorized_action(
                name,
                ability,
                anyhow!("action {} denied for ability {}", name, ability),
            ));
        }

        match action.kind {
            TreeActionKind::Restore => {
                return Err(LibError::invalid_with_code(
                    "restore_unsupported",
                    "Deleted tree records cannot be restored",
                    anyhow!("tree records are deleted permanently"),
                ));
            }
            TreeActionKind::Delete | TreeActionKind::ForceDelete if !invocation.confirmed => {
                return Err(LibError::invalid_with_code(
                    "confirmation_required",
                    "Deleting a record removes its children too and must be confirmed",
                    anyhow!("{} of {:?} was not confirmed", name, invocation.record_id),
                ));
            }
            _ => {}
        }

        if let Some(before) = &action.hooks.before {
            before(action.kind, record.as_ref());
        }

        let outcome = match (action.kind, record) {
            (TreeActionKind::Create, _) => {
                let data = self.submitted(action, invocation.arguments);
                let new_record = new_record_from_form(config, data, None)?;
                ActionOutcome::Created {
                    record: store.create_record(new_record).await?,
                }
            }
            (TreeActionKind::CreateChild, Some(parent)) => {
                let data = self.submitted(action, invocation.arguments);
                let new_record = new_record_from_form(config, data, Some(parent.id))?;
                ActionOutcome::Created {
                    record: store.create_record(new_record).await?,
                }
            }
            (TreeActionKind::Edit, Some(record)) => {
                let data = self.submitted(action, invocation.arguments);
                let changes = changes_from_form(config, data)?;
                let update = store.update_record(record.id, changes).await?;
                ActionOutcome::Updated {
                    record: update.record,
                    warnings: update.warnings,
                }
            }
            (TreeActionKind::View, Some(record)) => {
                let mut form_data = record_form_data(config, &record);
                if let Some(mutate) = &action.hooks.mutate_record_data {
                    form_data = mutate(form_data);
                }
                ActionOutcome::Viewed { record, form_data }
            }
            (TreeActionKind::Delete | TreeActionKind::ForceDelete, Some(record)) => {
                ActionOutcome::Deleted {
                    removed: store.delete_subtree(record.id).await?,
                }
            }
            (kind, _) => {
                return Err(LibError::invalid(
                    "This action needs a record",
                    anyhow!("action {} cannot run without a record", kind),
                ));
            }
        };

        if let Some(after) = &action.hooks.after {
            after(action.kind, &outcome);
        }
        tracing::info!(action = name, "executed tree action");
        Ok(outcome)
    }

    fn submitted(&self, action: &TreeAction, data: FormData) -> FormData {
        match &action.hooks.mutate_form_data {
            Some(mutate) => mutate(data),
            None => data,
        }
    }
}

fn parent_from_value(config: &TreeConfig, value: &Value) -> Result<Option<NodeId>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .map(|raw| config.parent_from_column(Some(raw)))
            .ok_or_else(|| {
                LibError::invalid("Parent must be a record id", anyhow!("bad parent {}", value))
            }),
        Value::String(raw) if raw.trim().is_empty() => Ok(None),
        Value::String(raw) => raw
            .trim()
            .parse::<i64>()
            .map(|raw| config.parent_from_column(Some(raw)))
            .map_err(|err| LibError::invalid("Parent must be a record id", anyhow!(err))),
        _ => Err(LibError::invalid(
            "Parent must be a record id",
            anyhow!("bad parent {}", value),
        )),
    }
}

fn title_from_value(value: Option<Value>) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(title)) => Ok(Some(title)),
        Some(other) => Err(LibError::invalid(
            "Title must be text",
            anyhow!("bad title {}", other),
        )),
    }
}

/// Builds a new record from create form data. The parent column falls back to the root
/// level and the order column to "append".
pub fn new_record_from_form(
    config: &TreeConfig,
    mut data: FormData,
    parent: Option<NodeId>,
) -> Result<NewTreeRecord> {
    let title = title_from_value(data.remove(&config.column_name.title))?.unwrap_or_default();
    let submitted_parent = data.remove(&config.column_name.parent);
    let parent_id = match parent {
        Some(parent) => Some(parent),
        None => match submitted_parent {
            Some(value) => parent_from_value(config, &value)?,
            None => None,
        },
    };
    let order = match data.remove(&config.column_name.order) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or_else(|| {
            LibError::invalid("Order must be a whole number", anyhow!("bad order {}", value))
        })?),
    };

    Ok(NewTreeRecord {
        parent_id,
        order,
        title,
        metadata: Value::Object(data),
    })
}

/// Translates edit form data into record changes. The order column is ignored;
/// order only changes through tree saves.
pub fn changes_from_form(config: &TreeConfig, mut data: FormData) -> Result<RecordChanges> {
    let title = title_from_value(data.remove(&config.column_name.title))?;
    let parent_id = match data.remove(&config.column_name.parent) {
        Some(value) => Some(parent_from_value(config, &value)?),
        None => None,
    };
    data.remove(&config.column_name.order);

    Ok(RecordChanges {
        title,
        parent_id,
        metadata: if data.is_empty() {
            None
        } else {
            Some(Value::Object(data))
        },
    })
}

/// Form data shown for a record, keyed by the configured column names.
pub fn record_form_data(config: &TreeConfig, record: &TreeRecord) -> FormData {
    let mut data = match &record.metadata {
        Value::Object(fields) => fields.clone(),
        _ => FormData::new(),
    };
    data.insert(
        config.column_name.title.clone(),
        Value::String(record.title.clone()),
    );
    data.insert(
        config.column_name.parent.clone(),
        Value::from(config.parent_to_column(record.parent_id)),
    );
    data.insert(config.column_name.order.clone(), Value::from(record.order));
    data
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::{ErrorDetails, ErrorKind};
    use crate::permissions::AllowAll;
    use crate::store::MemoryTreeStore;
    use crate::test_support::record;

    fn form(value: Value) -> FormData {
        match value {
            Value::Object(map) => map,
            _ => FormData::new(),
        }
    }

    fn authorized_config() -> TreeConfig {
        TreeConfig {
            enable_policy_authorization: true,
            ..TreeConfig::default()
        }
    }

    fn all_flags() -> ActionFlags {
        ActionFlags {
            has_create: true,
            has_create_child: true,
            has_edit: true,
            has_view: true,
            has_delete: true,
        }
    }

    #[test]
    fn action_names_round_trip() {
        for kind in TreeActionKind::ALL {
            assert_eq!(TreeActionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(TreeActionKind::from_name("archive"), None);
        assert_eq!(
            serde_json::to_value(TreeActionKind::ForceDelete).expect("serialize"),
            json!("forceDelete")
        );
    }

    #[test]
    fn standard_set_follows_flags() {
        let defaults = ActionSet::standard(ActionFlags::default());
        let names = defaults
            .actions()
            .iter()
            .map(TreeAction::name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["create", "edit"]);
        assert_eq!(ActionSet::standard(all_flags()).actions().len(), 5);
    }

    #[test]
    fn unknown_or_unconfigured_actions_do_not_resolve() {
        let set = ActionSet::default();
        let err = set.resolve("delete").expect_err("not configured");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.code, "action_not_resolvable");
        assert!(set.resolve("archive").is_err());
        assert!(set.resolve("edit").is_ok());
    }

    #[test]
    fn unauthorized_actions_are_omitted() {
        let set = ActionSet::standard(all_flags());
        let node = record(1, None, 0);
        let only_edit =
            |ability: &str, subject: AuthSubject<'_>| ability == "edit" && matches!(subject, AuthSubject::Record(_));

        let disabled = TreeConfig::default();
        assert_eq!(
            set.visible_actions(Some(&node), &disabled, &only_edit),
            vec!["createChild", "edit", "view", "delete"]
        );
        assert_eq!(
            set.visible_actions(Some(&node), &authorized_config(), &only_edit),
            vec!["edit"]
        );
        assert!(
            set.visible_actions(None, &authorized_config(), &only_edit)
                .is_empty()
        );
        assert_eq!(
            set.visible_actions(None, &authorized_config(), &AllowAll),
            vec!["create"]
        );
    }

    #[test]
    fn create_child_checks_the_mapped_create_ability() {
        let set = ActionSet::standard(all_flags());
        let node = record(1, None, 0);
        let only_create = |ability: &str, _subject: AuthSubject<'_>| ability == "create";
        let visible = set.visible_actions(Some(&node), &authorized_config(), &only_create);
        assert_eq!(visible, vec!["createChild"]);
    }

    #[test]
    fn visibility_predicate_applies_with_and_without_policies() {
        let set = ActionSet::standard(all_flags()).with(
            TreeAction::new(TreeActionKind::Delete)
                .visible_when(|record| record.is_some_and(|record| record.parent_id.is_some())),
        );
        let root = record(1, None, 0);
        let child = record(2, Some(1), 0);
        for config in [TreeConfig::default(), authorized_config()] {
            assert!(
                !set.visible_actions(Some(&root), &config, &AllowAll)
                    .contains(&"delete".to_string())
            );
            assert!(
                set.visible_actions(Some(&child), &config, &AllowAll)
                    .contains(&"delete".to_string())
            );
        }
    }

    #[tokio::test]
    async fn create_uses_configured_columns_and_root_sentinel() {
        let store = MemoryTreeStore::default();
        let set = ActionSet::default();
        let outcome = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "create",
                ActionInvocation {
                    arguments: form(json!({"title": "Root", "parent_id": -1, "icon": "folder"})),
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect("create");

        let ActionOutcome::Created { record } = outcome else {
            panic!("expected a created record");
        };
        assert_eq!(record.parent_id, None);
        assert_eq!(record.order, 0);
        assert_eq!(record.metadata, json!({"icon": "folder"}));
    }

    #[tokio::test]
    async fn create_child_prefills_parent_and_runs_hooks() {
        let store = MemoryTreeStore::with_records(-1, vec![record(1, None, 0)]);
        let calls = Arc::new(AtomicUsize::new(0));
        let after_calls = Arc::clone(&calls);
        let set = ActionSet::standard(all_flags()).with(
            TreeAction::new(TreeActionKind::CreateChild)
                .mutate_form_data(|mut data| {
                    data.insert("title".to_string(), json!("From hook"));
                    data
                })
                .after(move |kind, _| {
                    assert_eq!(kind, TreeActionKind::CreateChild);
                    after_calls.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let outcome = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "createChild",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    arguments: form(json!({"parent_id": 99})),
                    confirmed: false,
                },
            )
            .await
            .expect("create child");

        let ActionOutcome::Created { record } = outcome else {
            panic!("expected a created record");
        };
        assert_eq!(record.parent_id, Some(NodeId(1)));
        assert_eq!(record.title, "From hook");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn edit_reports_dropped_cyclic_parent() {
        let store = MemoryTreeStore::with_records(
            -1,
            vec![record(1, None, 0), record(2, Some(1), 0)],
        );
        let outcome = ActionSet::default()
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "edit",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    arguments: form(json!({"title": "Renamed", "parent_id": 2})),
                    confirmed: false,
                },
            )
            .await
            .expect("edit");

        let ActionOutcome::Updated { record, warnings } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(record.title, "Renamed");
        assert_eq!(record.parent_id, None);
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn direct_invocation_of_unauthorized_action_fails() {
        let store = MemoryTreeStore::with_records(-1, vec![record(1, None, 0)]);
        let deny_all = |_ability: &str, _subject: AuthSubject<'_>| false;
        let err = ActionSet::default()
            .execute(
                &store,
                &authorized_config(),
                &deny_all,
                "edit",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect_err("denied");
        assert_eq!(err.code, "unauthorized_action");
        assert_eq!(
            err.details,
            Some(ErrorDetails::MissingAbility {
                action: "edit".to_string(),
                ability: "edit".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn delete_requires_confirmation() {
        let store = MemoryTreeStore::with_records(
            -1,
            vec![record(1, None, 0), record(2, Some(1), 0), record(3, None, 1)],
        );
        let set = ActionSet::standard(all_flags());
        let err = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "delete",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect_err("unconfirmed");
        assert_eq!(err.code, "confirmation_required");

        let outcome = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "delete",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    confirmed: true,
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect("delete");
        assert_eq!(
            outcome,
            ActionOutcome::Deleted {
                removed: vec![NodeId(1), NodeId(2)],
            }
        );
        let remaining = store.load_records().await.expect("records");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].order, 0);
    }

    #[tokio::test]
    async fn rejected_deletes_and_restores_skip_lifecycle_hooks() {
        let store = MemoryTreeStore::with_records(-1, vec![record(1, None, 0)]);
        let before_calls = Arc::new(AtomicUsize::new(0));
        let set = [TreeActionKind::Delete, TreeActionKind::Restore]
            .into_iter()
            .fold(ActionSet::standard(all_flags()), |set, kind| {
                let counter = Arc::clone(&before_calls);
                set.with(TreeAction::new(kind).before(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            });

        let err = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "delete",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect_err("unconfirmed");
        assert_eq!(err.code, "confirmation_required");

        let err = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "restore",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    confirmed: true,
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect_err("restore");
        assert_eq!(err.code, "restore_unsupported");
        assert_eq!(before_calls.load(Ordering::SeqCst), 0);

        set.execute(
            &store,
            &TreeConfig::default(),
            &AllowAll,
            "delete",
            ActionInvocation {
                record_id: Some(NodeId(1)),
                confirmed: true,
                ..ActionInvocation::default()
            },
        )
        .await
        .expect("delete");
        assert_eq!(before_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn view_fills_form_from_record() {
        let store = MemoryTreeStore::with_records(-1, vec![record(1, None, 0)]);
        let set = ActionSet::standard(all_flags()).with(
            TreeAction::new(TreeActionKind::View).mutate_record_data(|mut data| {
                data.insert("extra".to_string(), json!(true));
                data
            }),
        );
        let outcome = set
            .execute(
                &store,
                &TreeConfig::default(),
                &AllowAll,
                "view",
                ActionInvocation {
                    record_id: Some(NodeId(1)),
                    ..ActionInvocation::default()
                },
            )
            .await
            .expect("view");
        let ActionOutcome::Viewed { form_data, .. } = outcome else {
            panic!("expected a view");
        };
        assert_eq!(form_data.get("title"), Some(&json!("node 1")));
        assert_eq!(form_data.get("parent_id"), Some(&json!(-1)));
        assert_eq!(form_data.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn edit_form_ignores_order_and_keeps_metadata() {
        let config = TreeConfig::default();
        let changes =
            changes_from_form(&config, form(json!({"order": 4, "parent_id": null, "color": "red"})))
                .expect("changes");
        assert_eq!(changes.title, None);
        assert_eq!(changes.parent_id, Some(None));
        assert_eq!(changes.metadata, Some(json!({"color": "red"})));
    }
}
