pub mod actions;
pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod engine;
pub mod error;
pub mod guard;
pub mod invariants;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod protocol;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

pub mod prelude {
    pub use crate::actions::{
        ActionFlags, ActionHooks, ActionInvocation, ActionOutcome, ActionSet, TreeAction,
        TreeActionKind,
    };
    pub use crate::algorithms::build_forest;
    #[cfg(feature = "api")]
    pub use crate::api::TreeApp;
    pub use crate::config::TreeConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgTreeStore, create_tree_tables};
    pub use crate::engine::NestableTree;
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::guard::{screen_parent_change, would_create_cycle};
    pub use crate::invariants::{ensure_forest_invariants, forest_violations};
    pub use crate::models::{
        ExcludedMove, ExclusionReason, NestedNode, NestedNodeList, NodeId, SerializedNode,
        TreeNode, TreeRecord, TreeView, UpdateTreeResponse,
    };
    pub use crate::operations::{TreeOperation, TreeOperationResult, TreeOperations};
    pub use crate::permissions::{AllowAll, AuthSubject, Authorizer, PolicyAbilities};
    pub use crate::protocol::{LayoutPlan, plan_layout};
    pub use crate::session::{SaveState, TreeSession};
    pub use crate::store::{MemoryTreeStore, TreeStore};
}
