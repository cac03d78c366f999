//! SQLite-backed [`HarvestStore`] implementation.
//!
//! Timestamps are stored as RFC 3339 text and dates as `YYYY-MM-DD`; JSON
//! documents and index lists are stored as serialized text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    CatalogEntry, HarvestJobConfig, HarvestRunState, IndexNode, NewIndexNode, RunStatus,
    UpdateStyle,
};
use crate::schema::ItemTypeSchema;
use crate::store::HarvestStore;

/// SQLite implementation of the [`HarvestStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid stored timestamp: {}", s))
        })
        .transpose()
}

fn parse_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid stored date: {}", s))
        })
        .transpose()
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn job_from_row(row: &SqliteRow) -> Result<HarvestJobConfig> {
    let style: String = row.try_get("update_style")?;
    Ok(HarvestJobConfig {
        id: row.try_get("id")?,
        repository_name: row.try_get("repository_name")?,
        base_url: row.try_get("base_url")?,
        metadata_prefix: row.try_get("metadata_prefix")?,
        from_date: parse_date(row.try_get("from_date")?)?,
        until_date: parse_date(row.try_get("until_date")?)?,
        set_spec: row.try_get("set_spec")?,
        index_id: row.try_get("index_id")?,
        update_style: UpdateStyle::parse(&style)
            .with_context(|| format!("Unknown update style: {}", style))?,
        auto_distribution: row.try_get::<i64, _>("auto_distribution")? != 0,
    })
}

fn index_from_row(row: &SqliteRow) -> Result<IndexNode> {
    Ok(IndexNode {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        index_name: row.try_get("index_name")?,
        index_name_english: row.try_get("index_name_english")?,
        harvest_spec: row.try_get("harvest_spec")?,
        browsing_role: row.try_get("browsing_role")?,
        contribute_role: row.try_get("contribute_role")?,
        public_state: row.try_get::<i64, _>("public_state")? != 0,
        recursive_public_state: row.try_get::<i64, _>("recursive_public_state")? != 0,
        position: row.try_get("position")?,
    })
}

const INDEX_COLUMNS: &str = "id, parent_id, index_name, index_name_english, harvest_spec, \
     browsing_role, contribute_role, public_state, recursive_public_state, position";

#[async_trait]
impl HarvestStore for SqliteStore {
    async fn register_job(&self, job: &HarvestJobConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvest_jobs (id, repository_name, base_url, metadata_prefix,
                                      from_date, until_date, set_spec, index_id,
                                      update_style, auto_distribution, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                repository_name = excluded.repository_name,
                base_url = excluded.base_url,
                metadata_prefix = excluded.metadata_prefix,
                from_date = excluded.from_date,
                until_date = excluded.until_date,
                set_spec = excluded.set_spec,
                index_id = excluded.index_id,
                update_style = excluded.update_style,
                auto_distribution = excluded.auto_distribution,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.repository_name)
        .bind(&job.base_url)
        .bind(&job.metadata_prefix)
        .bind(format_date(job.from_date))
        .bind(format_date(job.until_date))
        .bind(&job.set_spec)
        .bind(job.index_id)
        .bind(job.update_style.as_str())
        .bind(job.auto_distribution as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_config(&self, job_id: &str) -> Result<Option<HarvestJobConfig>> {
        let row = sqlx::query("SELECT * FROM harvest_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<HarvestJobConfig>> {
        let rows = sqlx::query("SELECT * FROM harvest_jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn run_state(&self, job_id: &str) -> Result<HarvestRunState> {
        let row = sqlx::query(
            "SELECT task_id, resumption_token, item_processed, last_status, last_started_at, \
             last_finished_at FROM harvest_runs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(HarvestRunState::default());
        };
        let status: Option<String> = row.try_get("last_status")?;
        Ok(HarvestRunState {
            task_id: row.try_get("task_id")?,
            resumption_token: row.try_get("resumption_token")?,
            item_processed: row.try_get::<i64, _>("item_processed")?.max(0) as u64,
            last_status: status.as_deref().and_then(RunStatus::parse),
            last_started_at: parse_ts(row.try_get("last_started_at")?)?,
            last_finished_at: parse_ts(row.try_get("last_finished_at")?)?,
        })
    }

    async fn save_run_state(&self, job_id: &str, state: &HarvestRunState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvest_runs (job_id, task_id, resumption_token, item_processed,
                                      last_status, last_started_at, last_finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                task_id = excluded.task_id,
                resumption_token = excluded.resumption_token,
                item_processed = excluded.item_processed,
                last_status = excluded.last_status,
                last_started_at = excluded.last_started_at,
                last_finished_at = excluded.last_finished_at
            "#,
        )
        .bind(job_id)
        .bind(&state.task_id)
        .bind(&state.resumption_token)
        .bind(state.item_processed as i64)
        .bind(state.last_status.map(|s| s.as_str()))
        .bind(state.last_started_at.map(|t| t.to_rfc3339()))
        .bind(state.last_finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_run(&self, job_id: &str, task_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO harvest_runs (job_id) VALUES (?) ON CONFLICT(job_id) DO NOTHING")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        let claimed = sqlx::query(
            "UPDATE harvest_runs SET task_id = ?, last_started_at = ? \
             WHERE job_id = ? AND task_id IS NULL",
        )
        .bind(task_id)
        .bind(started_at.to_rfc3339())
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(claimed == 1)
    }

    async fn checkpoint(&self, job_id: &str, token: Option<&str>, processed: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvest_runs (job_id, resumption_token, item_processed)
            VALUES (?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                resumption_token = excluded.resumption_token,
                item_processed = excluded.item_processed
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(processed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_item(&self, harvest_id: &str) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query(
            "SELECT id, harvest_id, schema_id, document_json, indexes_json, published_on, \
             action, dedup_hash FROM catalog_items WHERE harvest_id = ?",
        )
        .bind(harvest_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let document: String = row.try_get("document_json")?;
        let indexes: String = row.try_get("indexes_json")?;
        let published_on: String = row.try_get("published_on")?;
        Ok(Some(CatalogEntry {
            id: row.try_get("id")?,
            harvest_id: row.try_get("harvest_id")?,
            schema_id: row.try_get("schema_id")?,
            document: serde_json::from_str(&document)
                .with_context(|| format!("Corrupt document for {}", harvest_id))?,
            indexes: serde_json::from_str(&indexes)
                .with_context(|| format!("Corrupt index list for {}", harvest_id))?,
            published_on: parse_date(Some(published_on))?.unwrap_or_default(),
            action: row.try_get("action")?,
            dedup_hash: row.try_get("dedup_hash")?,
        }))
    }

    async fn upsert_item(&self, entry: &CatalogEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO catalog_items (id, harvest_id, schema_id, document_json, indexes_json,
                                       published_on, action, dedup_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(harvest_id) DO UPDATE SET
                schema_id = excluded.schema_id,
                document_json = excluded.document_json,
                indexes_json = excluded.indexes_json,
                published_on = excluded.published_on,
                action = excluded.action,
                dedup_hash = excluded.dedup_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.harvest_id)
        .bind(entry.schema_id)
        .bind(entry.document.to_string())
        .bind(serde_json::to_string(&entry.indexes)?)
        .bind(entry.published_on.format("%Y-%m-%d").to_string())
        .bind(&entry.action)
        .bind(&entry.dedup_hash)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_items(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn index_node(&self, id: i64) -> Result<Option<IndexNode>> {
        let row = sqlx::query(&format!("SELECT {} FROM index_nodes WHERE id = ?", INDEX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(index_from_row).transpose()
    }

    async fn child_indexes(&self, parent_id: Option<i64>) -> Result<Vec<IndexNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM index_nodes WHERE parent_id IS ? ORDER BY position, id",
            INDEX_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(index_from_row).collect()
    }

    async fn create_index(&self, node: &NewIndexNode) -> Result<IndexNode> {
        let id = sqlx::query(
            r#"
            INSERT INTO index_nodes (parent_id, index_name, index_name_english, harvest_spec,
                                     browsing_role, contribute_role, public_state,
                                     recursive_public_state, position)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.parent_id)
        .bind(&node.index_name)
        .bind(&node.index_name_english)
        .bind(&node.harvest_spec)
        .bind(&node.browsing_role)
        .bind(&node.contribute_role)
        .bind(node.public_state as i64)
        .bind(node.recursive_public_state as i64)
        .bind(node.position)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(IndexNode {
            id,
            parent_id: node.parent_id,
            index_name: node.index_name.clone(),
            index_name_english: node.index_name_english.clone(),
            harvest_spec: node.harvest_spec.clone(),
            browsing_role: node.browsing_role.clone(),
            contribute_role: node.contribute_role.clone(),
            public_state: node.public_state,
            recursive_public_state: node.recursive_public_state,
            position: node.position,
        })
    }

    async fn find_linked_index(&self, parent_id: i64, harvest_spec: &str) -> Result<Option<IndexNode>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM index_nodes WHERE parent_id = ? AND harvest_spec = ?",
            INDEX_COLUMNS
        ))
        .bind(parent_id)
        .bind(harvest_spec)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(index_from_row).transpose()
    }

    async fn item_type_schemas(&self) -> Result<Vec<ItemTypeSchema>> {
        let rows = sqlx::query(
            "SELECT id, category, updated_at, schema_json FROM item_type_schemas ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut schemas = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let json: String = row.try_get("schema_json")?;
            let updated_at = parse_ts(row.try_get("updated_at")?)?.unwrap_or_default();
            let schema = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt item type schema {}", id))?;
            schemas.push(ItemTypeSchema::new(
                id,
                row.try_get::<String, _>("category")?,
                updated_at,
                schema,
            ));
        }
        Ok(schemas)
    }

    async fn save_schema(&self, schema: &ItemTypeSchema) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_type_schemas (id, category, updated_at, schema_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                category = excluded.category,
                updated_at = excluded.updated_at,
                schema_json = excluded.schema_json
            "#,
        )
        .bind(schema.id)
        .bind(&schema.category)
        .bind(schema.updated_at.to_rfc3339())
        .bind(schema.schema.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
