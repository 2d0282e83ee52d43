use chrono::NaiveDate;
use serde_json::json;

use crate::models::{NodeId, TreeRecord};

pub(crate) fn record(id: i64, parent: Option<i64>, order: i64) -> TreeRecord {
    let now = NaiveDate::from_ymd_opt(2026, 1, 1)
        .expect("valid date")
        .and_hms_opt(0, 0, 0)
        .expect("valid datetime");
    TreeRecord {
        id: NodeId(id),
        parent_id: parent.map(NodeId),
        order,
        title: format!("node {id}"),
        metadata: json!({}),
        created_at: now,
        updated_at: now,
    }
}
