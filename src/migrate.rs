use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Job descriptors, refreshed from the config file on every invocation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_jobs (
            id TEXT PRIMARY KEY,
            repository_name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            metadata_prefix TEXT NOT NULL,
            from_date TEXT,
            until_date TEXT,
            set_spec TEXT,
            index_id INTEGER NOT NULL,
            update_style TEXT NOT NULL,
            auto_distribution INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Run state: lease, continuation token, counter
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_runs (
            job_id TEXT PRIMARY KEY,
            task_id TEXT,
            resumption_token TEXT,
            item_processed INTEGER NOT NULL DEFAULT 0,
            last_status TEXT,
            last_started_at TEXT,
            last_finished_at TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_items (
            id TEXT PRIMARY KEY,
            harvest_id TEXT NOT NULL UNIQUE,
            schema_id INTEGER NOT NULL,
            document_json TEXT NOT NULL,
            indexes_json TEXT NOT NULL DEFAULT '[]',
            published_on TEXT NOT NULL,
            action TEXT NOT NULL,
            dedup_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id INTEGER,
            index_name TEXT NOT NULL,
            index_name_english TEXT NOT NULL,
            harvest_spec TEXT,
            browsing_role TEXT NOT NULL DEFAULT '',
            contribute_role TEXT NOT NULL DEFAULT '',
            public_state INTEGER NOT NULL DEFAULT 0,
            recursive_public_state INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0,
            UNIQUE(parent_id, harvest_spec)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_type_schemas (
            id INTEGER PRIMARY KEY,
            category TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            schema_json TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_nodes_parent ON index_nodes(parent_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_item_type_schemas_category ON item_type_schemas(category, updated_at DESC)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
