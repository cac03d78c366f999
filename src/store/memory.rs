//! In-memory [`HarvestStore`] implementation for tests and embedding.
//!
//! Uses `HashMap`/`BTreeMap` and `Vec` behind `std::sync::RwLock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CatalogEntry, HarvestJobConfig, HarvestRunState, IndexNode, NewIndexNode};
use crate::schema::ItemTypeSchema;

use super::HarvestStore;

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<String, HarvestJobConfig>,
    runs: HashMap<String, HarvestRunState>,
    items: HashMap<String, CatalogEntry>,
    indexes: Vec<IndexNode>,
    schemas: Vec<ItemTypeSchema>,
    /// Number of successful `upsert_item` calls.
    writes: u64,
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Total catalog writes since creation, including updates in place.
    pub fn write_count(&self) -> u64 {
        self.read().map(|t| t.writes).unwrap_or(0)
    }
}

#[async_trait]
impl HarvestStore for InMemoryStore {
    async fn register_job(&self, job: &HarvestJobConfig) -> Result<()> {
        self.write()?.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn job_config(&self, job_id: &str) -> Result<Option<HarvestJobConfig>> {
        Ok(self.read()?.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<HarvestJobConfig>> {
        Ok(self.read()?.jobs.values().cloned().collect())
    }

    async fn run_state(&self, job_id: &str) -> Result<HarvestRunState> {
        Ok(self.read()?.runs.get(job_id).cloned().unwrap_or_default())
    }

    async fn save_run_state(&self, job_id: &str, state: &HarvestRunState) -> Result<()> {
        self.write()?.runs.insert(job_id.to_string(), state.clone());
        Ok(())
    }

    async fn claim_run(&self, job_id: &str, task_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.write()?;
        let state = tables.runs.entry(job_id.to_string()).or_default();
        if state.task_id.is_some() {
            return Ok(false);
        }
        state.task_id = Some(task_id.to_string());
        state.last_started_at = Some(started_at);
        Ok(true)
    }

    async fn checkpoint(&self, job_id: &str, token: Option<&str>, processed: u64) -> Result<()> {
        let mut tables = self.write()?;
        let state = tables.runs.entry(job_id.to_string()).or_default();
        state.resumption_token = token.map(str::to_string);
        state.item_processed = processed;
        Ok(())
    }

    async fn find_item(&self, harvest_id: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.read()?.items.get(harvest_id).cloned())
    }

    async fn upsert_item(&self, entry: &CatalogEntry) -> Result<()> {
        let mut tables = self.write()?;
        let mut stored = entry.clone();
        if let Some(existing) = tables.items.get(&entry.harvest_id) {
            stored.id = existing.id.clone();
        }
        tables.items.insert(entry.harvest_id.clone(), stored);
        tables.writes += 1;
        Ok(())
    }

    async fn count_items(&self) -> Result<u64> {
        Ok(self.read()?.items.len() as u64)
    }

    async fn index_node(&self, id: i64) -> Result<Option<IndexNode>> {
        Ok(self.read()?.indexes.iter().find(|n| n.id == id).cloned())
    }

    async fn child_indexes(&self, parent_id: Option<i64>) -> Result<Vec<IndexNode>> {
        let mut children: Vec<IndexNode> = self
            .read()?
            .indexes
            .iter()
            .filter(|n| n.parent_id == parent_id)
            .cloned()
            .collect();
        children.sort_by_key(|n| (n.position, n.id));
        Ok(children)
    }

    async fn create_index(&self, node: &NewIndexNode) -> Result<IndexNode> {
        let mut tables = self.write()?;
        let id = tables.indexes.iter().map(|n| n.id).max().unwrap_or(0) + 1;
        let created = IndexNode {
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
        };
        tables.indexes.push(created.clone());
        Ok(created)
    }

    async fn find_linked_index(&self, parent_id: i64, harvest_spec: &str) -> Result<Option<IndexNode>> {
        Ok(self
            .read()?
            .indexes
            .iter()
            .find(|n| n.parent_id == Some(parent_id) && n.harvest_spec.as_deref() == Some(harvest_spec))
            .cloned())
    }

    async fn item_type_schemas(&self) -> Result<Vec<ItemTypeSchema>> {
        Ok(self.read()?.schemas.clone())
    }

    async fn save_schema(&self, schema: &ItemTypeSchema) -> Result<()> {
        let mut tables = self.write()?;
        tables.schemas.retain(|s| s.id != schema.id);
        tables.schemas.push(schema.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn entry(harvest_id: &str, id: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.into(),
            harvest_id: harvest_id.into(),
            schema_id: 1,
            document: json!({ "$schema": 1 }),
            indexes: vec![1],
            published_on: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            action: "publish".into(),
            dedup_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_existing_id() {
        let store = InMemoryStore::new();
        store.upsert_item(&entry("oai:a", "first")).await.unwrap();
        store.upsert_item(&entry("oai:a", "second")).await.unwrap();

        let found = store.find_item("oai:a").await.unwrap().unwrap();
        assert_eq!(found.id, "first");
        assert_eq!(store.count_items().await.unwrap(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        assert!(store.claim_run("job", "t1", now).await.unwrap());
        assert!(!store.claim_run("job", "t2", now).await.unwrap());
        assert_eq!(
            store.run_state("job").await.unwrap().task_id.as_deref(),
            Some("t1")
        );
    }
}
