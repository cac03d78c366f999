//! Storage abstraction for the harvest engine.
//!
//! The [`HarvestStore`] trait covers everything the controller and the
//! distribution resolver persist: job descriptors, run state, catalog
//! entries, taxonomy nodes and item type schemas. Two backends ship with
//! the crate: [`SqliteStore`](crate::sqlite_store::SqliteStore) for the CLI
//! and [`InMemoryStore`](memory::InMemoryStore) for tests and embedding.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CatalogEntry, HarvestJobConfig, HarvestRunState, IndexNode, NewIndexNode};
use crate::schema::ItemTypeSchema;

/// Abstract storage backend for harvest jobs and their output.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`register_job`](HarvestStore::register_job) | Insert or replace a job descriptor |
/// | [`claim_run`](HarvestStore::claim_run) | Take the run lease if nobody holds it |
/// | [`checkpoint`](HarvestStore::checkpoint) | Persist token and counter together |
/// | [`upsert_item`](HarvestStore::upsert_item) | Create or update a catalog entry in one transaction |
/// | [`find_linked_index`](HarvestStore::find_linked_index) | Child node linked to a remote set |
/// | [`item_type_schemas`](HarvestStore::item_type_schemas) | Every stored schema version |
#[async_trait]
pub trait HarvestStore: Send + Sync {
    async fn register_job(&self, job: &HarvestJobConfig) -> Result<()>;

    async fn job_config(&self, job_id: &str) -> Result<Option<HarvestJobConfig>>;

    /// All jobs, ordered by id.
    async fn list_jobs(&self) -> Result<Vec<HarvestJobConfig>>;

    /// Run state of a job; a job that never ran has the default state.
    async fn run_state(&self, job_id: &str) -> Result<HarvestRunState>;

    async fn save_run_state(&self, job_id: &str, state: &HarvestRunState) -> Result<()>;

    /// Set `task_id` and `last_started_at` unless another run holds the
    /// lease. Returns `false` when the lease is taken.
    async fn claim_run(&self, job_id: &str, task_id: &str, started_at: DateTime<Utc>) -> Result<bool>;

    /// Persist the continuation token and processed counter atomically.
    async fn checkpoint(&self, job_id: &str, token: Option<&str>, processed: u64) -> Result<()>;

    /// Catalog entry linked to a harvest identifier.
    async fn find_item(&self, harvest_id: &str) -> Result<Option<CatalogEntry>>;

    /// Create or update the entry keyed by `entry.harvest_id`. The stored id
    /// of an existing entry is kept.
    async fn upsert_item(&self, entry: &CatalogEntry) -> Result<()>;

    async fn count_items(&self) -> Result<u64>;

    async fn index_node(&self, id: i64) -> Result<Option<IndexNode>>;

    /// Children of `parent_id` (roots when `None`), ordered by position.
    async fn child_indexes(&self, parent_id: Option<i64>) -> Result<Vec<IndexNode>>;

    async fn create_index(&self, node: &NewIndexNode) -> Result<IndexNode>;

    async fn find_linked_index(&self, parent_id: i64, harvest_spec: &str) -> Result<Option<IndexNode>>;

    async fn item_type_schemas(&self) -> Result<Vec<ItemTypeSchema>>;

    /// Insert or replace a schema version by id.
    async fn save_schema(&self, schema: &ItemTypeSchema) -> Result<()>;
}
