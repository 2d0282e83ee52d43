use std::sync::Arc;

use serde_json::json;

use subseq_tree::actions::{ActionFlags, ActionInvocation, ActionOutcome, ActionSet};
use subseq_tree::config::TreeConfig;
use subseq_tree::error::ErrorKind;
use subseq_tree::guard::{ParentIndex, would_create_cycle};
use subseq_tree::invariants::forest_violations;
use subseq_tree::models::{ExclusionReason, NestedNode, NewTreeRecord, NodeId, TreeRecord};
use subseq_tree::operations::TreeOperations;
use subseq_tree::permissions::{AllowAll, AuthSubject};
use subseq_tree::session::{SaveState, TreeSession};
use subseq_tree::store::{MemoryTreeStore, TreeStore};

fn setup(config: TreeConfig) -> TreeOperations<MemoryTreeStore> {
    TreeOperations::new(
        Arc::new(MemoryTreeStore::new(config.default_parent_id)),
        Arc::new(config),
        ActionSet::standard(ActionFlags {
            has_create_child: true,
            has_view: true,
            has_delete: true,
            ..ActionFlags::default()
        }),
    )
}

async fn add(ops: &TreeOperations<MemoryTreeStore>, title: &str, parent: Option<NodeId>) -> NodeId {
    ops.store()
        .create_record(NewTreeRecord {
            parent_id: parent,
            order: None,
            title: title.to_string(),
            metadata: json!({}),
        })
        .await
        .expect("record should be created")
        .id
}

async fn stored(ops: &TreeOperations<MemoryTreeStore>, id: NodeId) -> TreeRecord {
    ops.store()
        .find_record(id)
        .await
        .expect("lookup")
        .expect("record should exist")
}

async fn open_session(ops: &TreeOperations<MemoryTreeStore>) -> TreeSession {
    let view = ops.load_tree(&AllowAll).await.expect("tree should load");
    TreeSession::load(view, ops.config().default_parent_id).expect("session")
}

async fn assert_well_formed(ops: &TreeOperations<MemoryTreeStore>) {
    let records = ops.store().load_records().await.expect("records");
    assert_eq!(forest_violations(&records, Some(ops.config().max_depth)), vec![]);
}

#[tokio::test]
async fn nesting_a_root_under_its_sibling_saves_cleanly() {
    let ops = setup(TreeConfig {
        max_depth: 2,
        ..TreeConfig::default()
    });
    let a = add(&ops, "A", None).await;
    let b = add(&ops, "B", None).await;

    let mut session = open_session(&ops).await;
    session.move_node(b, Some(a), 0).expect("move");
    assert_eq!(session.tree().children(None), &[a]);
    assert_eq!(session.tree().children(Some(a)), &[b]);
    let snapshot = session.tree().serialize();
    assert_eq!(snapshot[0].children[0].parent_id, a.0);
    assert_eq!(snapshot[0].children[0].order, 0);

    let payload = session.begin_save().expect("save");
    let response = session.finish_save(ops.update_tree(&AllowAll, payload).await);
    assert!(!response.expect("save should apply").reload);

    let b_record = stored(&ops, b).await;
    assert_eq!(b_record.parent_id, Some(a));
    assert_eq!(b_record.order, 0);
    assert_eq!(stored(&ops, a).await.order, 0);
    assert_well_formed(&ops).await;
}

#[tokio::test]
async fn reparenting_under_a_descendant_is_refused() {
    let ops = setup(TreeConfig::default());
    let x = add(&ops, "X", None).await;
    let y = add(&ops, "Y", Some(x)).await;
    let z = add(&ops, "Z", Some(y)).await;

    let records = ops.store().load_records().await.expect("records");
    assert!(would_create_cycle(
        &ParentIndex::from_records(&records),
        x,
        Some(z)
    ));

    let outcome = ops
        .mount_action(
            &AllowAll,
            "edit",
            ActionInvocation {
                record_id: Some(x),
                arguments: serde_json::from_value(json!({"parent_id": z.0, "title": "X2"}))
                    .expect("form"),
                confirmed: false,
            },
        )
        .await
        .expect("edit should apply without the parent change");
    let ActionOutcome::Updated { record, warnings } = outcome else {
        panic!("expected an update");
    };
    assert_eq!(record.parent_id, None);
    assert_eq!(record.title, "X2");
    assert_eq!(
        warnings,
        vec!["Parent change ignored: would create circular reference.".to_string()]
    );

    let mut session = open_session(&ops).await;
    let err = session.move_node(x, Some(z), 0).expect_err("cycle");
    assert_eq!(err.code, "tree_cycle_rejected");
    assert_well_formed(&ops).await;
}

#[tokio::test]
async fn too_deep_moves_are_rejected_before_saving() {
    let ops = setup(TreeConfig {
        max_depth: 1,
        ..TreeConfig::default()
    });
    let a = add(&ops, "A", None).await;
    let b = add(&ops, "B", Some(a)).await;
    let c = add(&ops, "C", None).await;

    let mut session = open_session(&ops).await;
    let before = session.tree().to_payload();
    let err = session.move_node(c, Some(b), 0).expect_err("too deep");
    assert_eq!(err.code, "tree_depth_exceeded");
    assert_eq!(session.tree().to_payload(), before);
    assert_eq!(session.state(), SaveState::Idle);

    let err = ops
        .update_tree(
            &AllowAll,
            vec![NestedNode::with_children(
                a,
                vec![NestedNode::with_children(b, vec![NestedNode::leaf(c)])],
            )],
        )
        .await
        .expect_err("server applies the same bound");
    assert_eq!(err.code, "tree_depth_exceeded");
    assert_eq!(stored(&ops, c).await.parent_id, None);
}

#[tokio::test]
async fn stale_save_commits_valid_moves_and_asks_for_reload() {
    let ops = setup(TreeConfig::default());
    let a = add(&ops, "A", None).await;
    let b = add(&ops, "B", None).await;
    let c = add(&ops, "C", None).await;
    let d = add(&ops, "D", None).await;
    let k = add(&ops, "K", None).await;
    let e = add(&ops, "E", None).await;

    let mut session = open_session(&ops).await;

    // Meanwhile another editor nests A under B and deletes K.
    ops.update_tree(
        &AllowAll,
        vec![
            NestedNode::with_children(b, vec![NestedNode::leaf(a)]),
            NestedNode::leaf(c),
            NestedNode::leaf(d),
            NestedNode::leaf(k),
            NestedNode::leaf(e),
        ],
    )
    .await
    .expect("concurrent save");
    ops.mount_action(
        &AllowAll,
        "delete",
        ActionInvocation {
            record_id: Some(k),
            confirmed: true,
            ..ActionInvocation::default()
        },
    )
    .await
    .expect("concurrent delete");

    session.move_node(a, Some(k), 0).expect("move A");
    session.move_node(b, Some(a), 0).expect("move B");
    session.move_node(c, Some(d), 0).expect("valid move 1");
    session.move_node(e, Some(d), 1).expect("valid move 2");

    let payload = session.begin_save().expect("save");
    let response = session
        .finish_save(ops.update_tree(&AllowAll, payload).await)
        .expect("save should apply");
    assert!(response.reload);
    assert!(session.needs_reload());
    assert!(
        response
            .excluded
            .iter()
            .any(|excluded| excluded.node_id == b && excluded.reason == ExclusionReason::Cycle)
    );

    let c_record = stored(&ops, c).await;
    let e_record = stored(&ops, e).await;
    assert_eq!((c_record.parent_id, c_record.order), (Some(d), 0));
    assert_eq!((e_record.parent_id, e_record.order), (Some(d), 1));
    assert_eq!(stored(&ops, b).await.parent_id, None);
    assert_eq!(stored(&ops, a).await.parent_id, Some(b));
    assert_well_formed(&ops).await;

    let fresh = ops.load_tree(&AllowAll).await.expect("reload");
    session.reload(fresh).expect("session reload");
    assert_eq!(session.tree().children(Some(d)), &[c, e]);
}

#[tokio::test]
async fn unchanged_save_is_a_noop() {
    let ops = setup(TreeConfig::default());
    let a = add(&ops, "A", None).await;
    add(&ops, "B", Some(a)).await;
    add(&ops, "C", None).await;

    let mut session = open_session(&ops).await;
    let payload = session.begin_save().expect("save");
    let before = ops.store().load_records().await.expect("records");
    let response = session
        .finish_save(ops.update_tree(&AllowAll, payload.clone()).await)
        .expect("save");
    assert!(!response.reload);
    assert_eq!(ops.store().load_records().await.expect("records"), before);

    session.acknowledge();
    let second = ops.update_tree(&AllowAll, payload).await.expect("save");
    assert!(!second.reload);
    assert_eq!(ops.store().load_records().await.expect("records"), before);
}

#[tokio::test]
async fn delete_visibility_follows_the_policy_switch() {
    let deny_delete = |ability: &str, _subject: AuthSubject<'_>| ability != "delete";

    let open = setup(TreeConfig::default());
    let node = add(&open, "A", None).await;
    let view = open.load_tree(&deny_delete).await.expect("load");
    assert!(view.nodes[0].actions.contains(&"delete".to_string()));

    let guarded = setup(TreeConfig {
        enable_policy_authorization: true,
        ..TreeConfig::default()
    });
    let node_guarded = add(&guarded, "A", None).await;
    let view = guarded.load_tree(&deny_delete).await.expect("load");
    assert!(!view.nodes[0].actions.contains(&"delete".to_string()));
    assert!(view.nodes[0].actions.contains(&"edit".to_string()));

    let err = guarded
        .mount_action(
            &deny_delete,
            "delete",
            ActionInvocation {
                record_id: Some(node_guarded),
                confirmed: true,
                ..ActionInvocation::default()
            },
        )
        .await
        .expect_err("denied");
    assert_eq!(err.kind, ErrorKind::Forbidden);
    assert_eq!(err.code, "unauthorized_action");
    assert!(guarded.store().find_record(node_guarded).await.expect("lookup").is_some());

    let outcome = open
        .mount_action(
            &deny_delete,
            "delete",
            ActionInvocation {
                record_id: Some(node),
                confirmed: true,
                ..ActionInvocation::default()
            },
        )
        .await
        .expect("policy checks are off");
    assert_eq!(outcome, ActionOutcome::Deleted { removed: vec![node] });
}
