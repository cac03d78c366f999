//! Implementations of the `oaih` subcommands.
//!
//! Every command opens the SQLite store (running migrations and registering
//! the configured jobs first) and prints its result on stdout.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::controller::{HarvestController, RetryPolicy};
use crate::db;
use crate::mapper::DcMapper;
use crate::migrate;
use crate::models::{JobState, NewIndexNode, RunStatus};
use crate::notify::LogNotifier;
use crate::oai::{OaiClient, OaiSource};
use crate::progress::ProgressMode;
use crate::schema::{ItemTypeSchema, SchemaRegistry};
use crate::sqlite_store::SqliteStore;
use crate::store::HarvestStore;
use crate::tasks::{ActorContext, HarvestExecutor, LogHooks};

/// Migrate, connect and register every configured job.
pub async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    migrate::run_migrations(config).await?;
    let store = SqliteStore::new(db::connect(config).await?);
    for job in config.job_configs() {
        store
            .register_job(&job)
            .await
            .with_context(|| format!("Failed to register job '{}'", job.id))?;
    }
    Ok(Arc::new(store))
}

fn client(config: &Config) -> Result<Arc<OaiClient>> {
    Ok(Arc::new(OaiClient::new(
        config.harvest.timeout(),
        &config.harvest.user_agent,
    )?))
}

async fn job_or_bail(
    store: &dyn HarvestStore,
    job_id: &str,
) -> Result<crate::models::HarvestJobConfig> {
    match store.job_config(job_id).await? {
        Some(job) => Ok(job),
        None => bail!("Unknown harvest job: '{}'", job_id),
    }
}

pub async fn run_init(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let jobs = store.list_jobs().await?;
    println!("Database initialized successfully.");
    println!("jobs registered: {}", jobs.len());
    Ok(())
}

pub async fn list_jobs(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let jobs = store.list_jobs().await?;

    println!(
        "{:<16} {:<8} {:>10}  {:<20} TOKEN",
        "JOB", "STATE", "PROCESSED", "REPOSITORY"
    );
    for job in jobs {
        let state = store.run_state(&job.id).await?;
        println!(
            "{:<16} {:<8} {:>10}  {:<20} {}",
            job.id,
            JobState::of(&state),
            state.item_processed,
            job.repository_name,
            state.resumption_token.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_harvest(config: &Config, job_id: &str, progress: ProgressMode) -> Result<()> {
    let store = open_store(config).await?;
    job_or_bail(store.as_ref(), job_id).await?;

    let controller = HarvestController::new(store.clone(), client(config)?, Arc::new(LogNotifier))
        .with_retry(RetryPolicy::from_settings(&config.harvest))
        .with_progress(progress.reporter());
    let executor = HarvestExecutor::new(Arc::new(controller), Arc::new(LogHooks));

    let handle = executor.submit(job_id, Utc::now(), ActorContext::default())?;

    let pauser = Arc::clone(&executor);
    let pause_job = job_id.to_string();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Pause requested; finishing the current page...");
            pauser.pause(&pause_job);
        }
    });

    let outcome = handle.await.context("Harvest task panicked")?;
    signal_task.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(failure) => bail!("{}", failure.error),
    };
    let state = store.run_state(job_id).await?;
    let status = state.last_status.unwrap_or(RunStatus::Error);

    println!("task:       {}", result.task_id);
    println!("status:     {}", status);
    println!("processed:  {}", result.total_records);
    println!("elapsed:    {}", result.execution_time);
    if let Some(token) = &state.resumption_token {
        println!("token:      {}", token);
    }

    if status == RunStatus::Error {
        bail!("Harvest of '{}' failed; see log for details", job_id);
    }
    Ok(())
}

pub async fn run_clear(config: &Config, job_id: &str, force: bool) -> Result<()> {
    let store = open_store(config).await?;
    let controller = HarvestController::new(store, client(config)?, Arc::new(LogNotifier));
    controller.clear(job_id, force).await?;
    println!("ok");
    Ok(())
}

pub async fn show_status(config: &Config, job_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let job = job_or_bail(store.as_ref(), job_id).await?;
    let state = store.run_state(job_id).await?;

    let ts = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
    println!("job:          {}", job.id);
    println!("repository:   {}", job.repository_name);
    println!("base_url:     {}", job.base_url);
    println!("update_style: {}", job.update_style.as_str());
    println!("state:        {}", JobState::of(&state));
    println!("processed:    {}", state.item_processed);
    println!(
        "token:        {}",
        state.resumption_token.as_deref().unwrap_or("-")
    );
    println!(
        "last_status:  {}",
        state.last_status.map(|s| s.as_str()).unwrap_or("-")
    );
    println!("started_at:   {}", ts(state.last_started_at));
    println!("finished_at:  {}", ts(state.last_finished_at));
    Ok(())
}

pub async fn list_remote_sets(config: &Config, job_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let job = job_or_bail(store.as_ref(), job_id).await?;
    let sets = client(config)?.list_sets(&job.base_url).await?;

    println!("{:<32} NAME", "SPEC");
    for set in sets {
        println!("{:<32} {}", set.spec, set.name);
    }
    Ok(())
}

pub async fn preview_record(config: &Config, job_id: &str, identifier: &str) -> Result<()> {
    let store = open_store(config).await?;
    let job = job_or_bail(store.as_ref(), job_id).await?;
    let record = client(config)?
        .get_record(&job.base_url, identifier, &job.metadata_prefix)
        .await?;
    let registry = SchemaRegistry::new(store.item_type_schemas().await?);

    let mapper = DcMapper::new(&record, &registry)?;
    println!("identifier: {}", mapper.identifier());
    println!("datestamp:  {}", mapper.datestamp().to_rfc3339());
    println!("deleted:    {}", mapper.is_deleted());
    println!("sets:       {}", mapper.set_specs().join(", "));
    println!("category:   {}", mapper.category().as_str());
    if mapper.is_deleted() {
        return Ok(());
    }
    let item = mapper.map()?;
    println!("{}", serde_json::to_string_pretty(&item.document())?);
    Ok(())
}

pub async fn import_schema(
    config: &Config,
    path: &Path,
    id: i64,
    category: &str,
    updated_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse schema file: {}", path.display()))?;
    if json.get("properties").and_then(|p| p.as_object()).is_none() {
        bail!("Schema has no 'properties' object: {}", path.display());
    }

    let schema = ItemTypeSchema::new(id, category, updated_at.unwrap_or_else(Utc::now), json);
    let store = open_store(config).await?;
    store.save_schema(&schema).await?;
    println!(
        "schema {} imported for '{}' ({} fields)",
        schema.id,
        schema.category,
        schema.field_count()
    );
    Ok(())
}

pub async fn list_schemas(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let schemas = store.item_type_schemas().await?;

    println!("{:<6} {:<24} {:<26} FIELDS", "ID", "CATEGORY", "UPDATED");
    for schema in schemas {
        println!(
            "{:<6} {:<24} {:<26} {}",
            schema.id,
            schema.category,
            schema.updated_at.to_rfc3339(),
            schema.field_count()
        );
    }
    Ok(())
}

pub async fn add_index(
    config: &Config,
    name: &str,
    parent_id: Option<i64>,
    browsing_role: &str,
    contribute_role: &str,
) -> Result<()> {
    let store = open_store(config).await?;
    if let Some(parent) = parent_id {
        if store.index_node(parent).await?.is_none() {
            bail!("Parent index {} does not exist", parent);
        }
    }
    let position = store
        .child_indexes(parent_id)
        .await?
        .iter()
        .map(|n| n.position)
        .max()
        .map(|p| p + 1)
        .unwrap_or(0);

    let node = store
        .create_index(&NewIndexNode {
            parent_id,
            index_name: name.to_string(),
            index_name_english: name.to_string(),
            harvest_spec: None,
            browsing_role: browsing_role.to_string(),
            contribute_role: contribute_role.to_string(),
            public_state: true,
            recursive_public_state: true,
            position,
        })
        .await?;
    println!("index {} created", node.id);
    Ok(())
}

pub async fn list_indexes(config: &Config, parent_id: Option<i64>) -> Result<()> {
    let store = open_store(config).await?;
    let nodes = store.child_indexes(parent_id).await?;

    println!("{:<6} {:<8} {:<4} {:<20} NAME", "ID", "PARENT", "POS", "SPEC");
    for node in nodes {
        println!(
            "{:<6} {:<8} {:<4} {:<20} {}",
            node.id,
            node.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            node.position,
            node.harvest_spec.as_deref().unwrap_or("-"),
            node.index_name
        );
    }
    Ok(())
}
