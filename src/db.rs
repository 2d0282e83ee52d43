use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};

use crate::algorithms::next_order;
use crate::config::{TreeConfig, is_plain_identifier};
use crate::error::{LibError, Result};
use crate::guard::{ParentIndex, screen_parent_change};
use crate::models::{
    NestedNode, NewTreeRecord, NodeId, RecordChanges, RecordUpdate, TreeRecord,
    UpdateTreeResponse,
};
use crate::protocol::plan_layout;
use crate::store::{TreeStore, require_title};

pub const DEFAULT_SCHEMA: &str = "tree";
pub const DEFAULT_TABLE: &str = "nodes";

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

/// Creates `tree.nodes` with the default column layout (`parent_id`, `"order"`, `title`)
/// and a `-1` root sentinel. Trees with other table or column names need their own
/// migration.
pub async fn create_tree_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct TreeRow {
    id: i64,
    parent_id: Option<i64>,
    sort_order: i64,
    title: String,
    metadata: serde_json::Value,
    created_at: chrono::NaiveDateTime,
    updated_at: chrono::NaiveDateTime,
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// Tree records in one PostgreSQL table. Column names come from [`TreeConfig`];
/// writers take a table lock so layout saves and edits are serialized.
#[derive(Debug, Clone)]
pub struct PgTreeStore {
    pool: PgPool,
    config: TreeConfig,
    table: String,
    parent: String,
    order: String,
    title: String,
}

impl PgTreeStore {
    pub fn new(pool: PgPool, config: TreeConfig) -> Result<Self> {
        Self::with_table(pool, config, DEFAULT_SCHEMA, DEFAULT_TABLE)
    }

    /// Binds to an existing table. The table must already carry the columns named in
    /// `config.column_name`; [`create_tree_tables`] only provisions the default layout.
    pub fn with_table(pool: PgPool, config: TreeConfig, schema: &str, table: &str) -> Result<Self> {
        config.validate()?;
        if !is_plain_identifier(schema) || !is_plain_identifier(table) {
            return Err(LibError::invalid_with_code(
                "invalid_tree_config",
                "Tree table names must be plain identifiers",
                anyhow!("invalid table name '{}.{}'", schema, table),
            ));
        }
        Ok(Self {
            table: format!("{}.{}", quote(schema), quote(table)),
            parent: quote(&config.column_name.parent),
            order: quote(&config.column_name.order),
            title: quote(&config.column_name.title),
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT id, {parent} AS parent_id, {order} AS sort_order, {title} AS title, \
             metadata, created_at, updated_at FROM {table}",
            parent = self.parent,
            order = self.order,
            title = self.title,
            table = self.table,
        )
    }

    fn returning_sql(&self) -> String {
        format!(
            "RETURNING id, {} AS parent_id, {} AS sort_order, {} AS title, \
             metadata, created_at, updated_at",
            self.parent, self.order, self.title
        )
    }

    /// Filter on one sibling group, bound to `$1`. The root group matches both the
    /// sentinel and NULL.
    fn group_filter(&self, parent: Option<NodeId>) -> (String, i64) {
        match parent {
            None => (
                format!("({p} IS NULL OR {p} = $1)", p = self.parent),
                self.config.default_parent_id,
            ),
            Some(parent) => (format!("{} = $1", self.parent), parent.0),
        }
    }

    fn hydrate(&self, row: TreeRow) -> TreeRecord {
        TreeRecord {
            id: NodeId(row.id),
            parent_id: self.config.parent_from_column(row.parent_id),
            order: row.sort_order,
            title: row.title,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        let lock = format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", self.table);
        sqlx::query(&lock)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to lock tree table", err))?;
        Ok(tx)
    }

    async fn fetch_all(&self, conn: &mut PgConnection) -> Result<Vec<TreeRecord>> {
        let sql = format!("{} ORDER BY id ASC", self.select_sql());
        let rows = sqlx::query_as::<_, TreeRow>(&sql)
            .fetch_all(conn)
            .await
            .map_err(|err| db_err("Failed to query tree records", err))?;
        Ok(rows.into_iter().map(|row| self.hydrate(row)).collect())
    }

    async fn fetch_one(&self, conn: &mut PgConnection, id: NodeId) -> Result<Option<TreeRecord>> {
        let sql = format!("{} WHERE id = $1", self.select_sql());
        let row = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(id.0)
            .fetch_optional(conn)
            .await
            .map_err(|err| db_err("Failed to query tree record", err))?;
        Ok(row.map(|row| self.hydrate(row)))
    }

    async fn fetch_max_order(
        &self,
        conn: &mut PgConnection,
        parent: Option<NodeId>,
    ) -> Result<Option<i64>> {
        let (filter, value) = self.group_filter(parent);
        let sql = format!("SELECT MAX({}) FROM {} WHERE {}", self.order, self.table, filter);
        let max: (Option<i64>,) = sqlx::query_as(&sql)
            .bind(value)
            .fetch_one(conn)
            .await
            .map_err(|err| db_err("Failed to query sibling order", err))?;
        Ok(max.0)
    }

    /// Rewrites one sibling group to `0..n-1`, touching only rows whose order changes.
    async fn renumber_group(&self, conn: &mut PgConnection, parent: Option<NodeId>) -> Result<()> {
        let (filter, value) = self.group_filter(parent);
        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT id, ROW_NUMBER() OVER (ORDER BY {order} ASC, id ASC) - 1 AS next_order
                FROM {table}
                WHERE {filter}
            )
            UPDATE {table} AS t
            SET {order} = ranked.next_order,
                updated_at = CURRENT_TIMESTAMP
            FROM ranked
            WHERE t.id = ranked.id
              AND t.{order} <> ranked.next_order
            "#,
            order = self.order,
            table = self.table,
            filter = filter,
        );
        sqlx::query(&sql)
            .bind(value)
            .execute(conn)
            .await
            .map_err(|err| db_err("Failed to renumber sibling group", err))?;
        Ok(())
    }
}

impl TreeStore for PgTreeStore {
    async fn load_records(&self) -> Result<Vec<TreeRecord>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))?;
        self.fetch_all(&mut conn).await
    }

    async fn find_record(&self, id: NodeId) -> Result<Option<TreeRecord>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))?;
        self.fetch_one(&mut conn, id).await
    }

    async fn children_of(&self, parent: Option<NodeId>) -> Result<Vec<TreeRecord>> {
        let (filter, value) = self.group_filter(parent);
        let sql = format!(
            "{} WHERE {} ORDER BY {} ASC, id ASC",
            self.select_sql(),
            filter,
            self.order
        );
        let rows = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| db_err("Failed to query child records", err))?;
        Ok(rows.into_iter().map(|row| self.hydrate(row)).collect())
    }

    async fn max_order(&self, parent: Option<NodeId>) -> Result<Option<i64>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))?;
        self.fetch_max_order(&mut conn, parent).await
    }

    async fn create_record(&self, record: NewTreeRecord) -> Result<TreeRecord> {
        let title = require_title(&record.title)?;
        let mut tx = self.begin_locked().await?;

        if let Some(parent) = record.parent_id {
            if self.fetch_one(&mut tx, parent).await?.is_none() {
                return Err(LibError::not_found(
                    "Parent record not found",
                    anyhow!("cannot create a child of missing record {}", parent),
                ));
            }
        }

        let order = match record.order {
            Some(order) => order,
            None => next_order(
                self.fetch_max_order(&mut tx, record.parent_id).await?,
            ),
        };
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}, metadata) VALUES ($1, $2, $3, $4) {}",
            self.table,
            self.parent,
            self.order,
            self.title,
            self.returning_sql()
        );
        let row = sqlx::query_as::<_, TreeRow>(&sql)
            .bind(self.config.parent_to_column(record.parent_id))
            .bind(order)
            .bind(&title)
            .bind(&record.metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to create tree record", err))?;
        let id = NodeId(row.id);

        if record.order.is_some() {
            self.renumber_group(&mut tx, record.parent_id).await?;
        }
        let created = self.fetch_one(&mut tx, id).await?.ok_or_else(|| {
            LibError::database(
                "Failed to create tree record",
                anyhow!("record {} vanished after insert", id),
            )
        })?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        tracing::debug!(record_id = %created.id, parent_id = ?created.parent_id, "created tree record");
        Ok(created)
    }

    async fn update_record(&self, id: NodeId, changes: RecordChanges) -> Result<RecordUpdate> {
        let mut tx = self.begin_locked().await?;
        let records = self.fetch_all(&mut tx).await?;
        let current = records
            .iter()
            .find(|record| record.id == id)
            .cloned()
            .ok_or_else(|| {
                LibError::not_found("Tree record not found", anyhow!("record {} not found", id))
            })?;
        let screened = screen_parent_change(&ParentIndex::from_records(&records), &current, changes)?;

        let title = screened
            .changes
            .title
            .as_deref()
            .map(require_title)
            .transpose()?
            .unwrap_or_else(|| current.title.clone());
        let metadata = screened
            .changes
            .metadata
            .clone()
            .unwrap_or_else(|| current.metadata.clone());
        let (parent, order) = match screened.changes.parent_id {
            Some(parent) => (
                parent,
                next_order(self.fetch_max_order(&mut tx, parent).await?),
            ),
            None => (current.parent_id, current.order),
        };

        let sql = format!(
            r#"
            UPDATE {table}
            SET {title} = $1,
                metadata = $2,
                {parent} = $3,
                {order} = $4,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $5
            "#,
            table = self.table,
            title = self.title,
            parent = self.parent,
            order = self.order,
        );
        sqlx::query(&sql)
            .bind(&title)
            .bind(&metadata)
            .bind(self.config.parent_to_column(parent))
            .bind(order)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to update tree record", err))?;

        if screened.changes.parent_id.is_some() {
            self.renumber_group(&mut tx, current.parent_id).await?;
        }
        let record = self.fetch_one(&mut tx, id).await?.ok_or_else(|| {
            LibError::database(
                "Failed to update tree record",
                anyhow!("record {} vanished during update", id),
            )
        })?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(RecordUpdate {
            record,
            warnings: screened.warnings,
        })
    }

    async fn delete_subtree(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut tx = self.begin_locked().await?;
        let record = self.fetch_one(&mut tx, id).await?.ok_or_else(|| {
            LibError::not_found("Tree record not found", anyhow!("record {} not found", id))
        })?;

        // UNION, not UNION ALL: stops on pre-existing parent cycles.
        let sql = format!(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT id FROM {table} WHERE id = $1
                UNION
                SELECT child.id
                FROM {table} child
                JOIN subtree ON child.{parent} = subtree.id
            )
            DELETE FROM {table}
            WHERE id IN (SELECT id FROM subtree)
            RETURNING id
            "#,
            table = self.table,
            parent = self.parent,
        );
        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_all(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to delete tree records", err))?;

        self.renumber_group(&mut tx, record.parent_id).await?;
        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;

        let mut removed = vec![id];
        let mut descendants = rows
            .into_iter()
            .map(|(row_id,)| NodeId(row_id))
            .filter(|row_id| *row_id != id)
            .collect::<Vec<_>>();
        descendants.sort();
        removed.extend(descendants);
        tracing::info!(record_id = %id, removed = removed.len(), "deleted tree subtree");
        Ok(removed)
    }

    async fn commit_layout(
        &self,
        layout: &[NestedNode],
        max_depth: Option<usize>,
    ) -> Result<UpdateTreeResponse> {
        let mut tx = self.begin_locked().await?;
        let records = self.fetch_all(&mut tx).await?;
        let plan = plan_layout(&records, layout, max_depth)?;

        let sql = format!(
            "UPDATE {} SET {} = $1, {} = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $3",
            self.table, self.parent, self.order
        );
        for planned in &plan.moves {
            sqlx::query(&sql)
                .bind(self.config.parent_to_column(planned.parent_id))
                .bind(planned.order)
                .bind(planned.node_id.0)
                .execute(&mut *tx)
                .await
                .map_err(|err| db_err("Failed to save tree layout", err))?;
        }

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(plan.response())
    }
}
