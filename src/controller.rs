//! Harvest job controller.
//!
//! Drives one job through its page sequence: fetch a page, map and write
//! each record, checkpoint the continuation token, repeat. A run is
//! resumable from its last checkpoint and never leaves the job marked as
//! running, whatever happens inside it.
//!
//! # States
//!
//! ```text
//!            run                      page sequence drained
//!   Idle ─────────────▶ Running ─────────────────────────────▶ Idle
//!    ▲                   │   │
//!    │ clear     pause   │   │ page-level failure
//!    │                   ▼   ▼
//!    └──────────────── Paused  Error ──── clear ──▶ Idle
//!                        │
//!                        └── run (resumes from the token)
//! ```
//!
//! The state is derived from the persisted [`HarvestRunState`], see
//! [`JobState::of`].
//!
//! # Records
//!
//! Each record yields a [`RecordOutcome`]. Mapping and catalog failures are
//! tallied as `Failed` and the page goes on; only page-level failures
//! (protocol, setup, checkpoint) end the run with `ERROR`.
//!
//! # Cancellation
//!
//! A pause cancels the run's [`CancellationToken`]. The controller checks it
//! after a page is checkpointed, never mid-page, so the persisted token
//! always points at the first unprocessed page.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HarvestSettings;
use crate::error::{HarvestError, ProtocolError};
use crate::mapper::DcMapper;
use crate::models::{
    CatalogEntry, HarvestJobConfig, HarvestRunState, JobState, OaiRecord, RunReport, RunStats,
    RunStatus, UpdateStyle, ACTION_PUBLISH,
};
use crate::notify::{Notifier, RunStatusMessage};
use crate::oai::{ListRecordsRequest, OaiSource};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress};
use crate::schema::SchemaRegistry;
use crate::store::HarvestStore;
use crate::taxonomy::{resolve_indexes, sync_taxonomy};

/// Retry policy for transient protocol failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &HarvestSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    /// Exponential backoff: base, 2×base, 4×base, ... capped at 32×base.
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&HarvestSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Bulk update and the stored entry is current.
    Unchanged,
    /// Deleted upstream; the catalog is left as is.
    Deleted,
}

/// What happened to one record.
#[derive(Debug)]
pub enum RecordOutcome {
    Upserted,
    Skipped(SkipReason),
    Failed(HarvestError),
}

pub struct HarvestController {
    store: Arc<dyn HarvestStore>,
    source: Arc<dyn OaiSource>,
    notifier: Arc<dyn Notifier>,
    progress: Arc<dyn HarvestProgressReporter>,
    retry: RetryPolicy,
    /// Cancellation handles of runs active in this process.
    signals: Mutex<HashMap<String, CancellationToken>>,
}

impl HarvestController {
    pub fn new(
        store: Arc<dyn HarvestStore>,
        source: Arc<dyn OaiSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            progress: Arc::new(NoProgress),
            retry: RetryPolicy::default(),
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn HarvestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn HarvestStore> {
        &self.store
    }

    pub async fn state(&self, job_id: &str) -> Result<JobState, HarvestError> {
        let state = self.store.run_state(job_id).await?;
        Ok(JobState::of(&state))
    }

    /// Ask the job's active run to stop at its next page boundary.
    ///
    /// Returns `false` when no run of this job is active in this process.
    pub fn pause(&self, job_id: &str) -> bool {
        let signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match signals.get(job_id) {
            Some(token) => {
                info!(job = %job_id, "pause requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_live(&self, job_id: &str) -> bool {
        match self.signals.lock() {
            Ok(guard) => guard.contains_key(job_id),
            Err(poisoned) => poisoned.into_inner().contains_key(job_id),
        }
    }

    fn register(&self, job_id: &str, cancel: &CancellationToken) {
        let mut signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        signals.insert(job_id.to_string(), cancel.clone());
    }

    fn unregister(&self, job_id: &str) {
        let mut signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        signals.remove(job_id);
    }

    async fn job(&self, job_id: &str) -> Result<HarvestJobConfig, HarvestError> {
        self.store
            .job_config(job_id)
            .await?
            .ok_or_else(|| HarvestError::Configuration(format!("unknown harvest job '{}'", job_id)))
    }

    /// Discard a paused or failed job's token and counter.
    ///
    /// With `force`, a lease left behind by a run that no longer exists is
    /// released as well. A run active in this process is never cleared.
    pub async fn clear(&self, job_id: &str, force: bool) -> Result<HarvestRunState, HarvestError> {
        let job = self.job(job_id).await?;
        let mut state = self.store.run_state(job_id).await?;
        let current = JobState::of(&state);

        let allowed = match current {
            JobState::Paused | JobState::Error => true,
            JobState::Running => force && !self.is_live(job_id),
            JobState::Idle => false,
        };
        if !allowed {
            return Err(HarvestError::InvalidTransition {
                job: job_id.to_string(),
                action: "clear",
                state: current,
            });
        }

        let processed = state.item_processed;
        let finished_at = Utc::now();
        state.task_id = None;
        state.resumption_token = None;
        state.item_processed = 0;
        state.last_status = Some(RunStatus::Cancel);
        state.last_finished_at = Some(finished_at);
        self.store.save_run_state(job_id, &state).await?;
        info!(job = %job_id, from = %current, "harvest cleared");

        self.notify(RunStatusMessage {
            status: RunStatus::Cancel,
            job_id: job.id.clone(),
            repository_name: job.repository_name.clone(),
            update_style: job.update_style,
            started_at: state.last_started_at,
            finished_at,
            processed,
        })
        .await;
        Ok(state)
    }

    /// Run (or resume) a harvest.
    ///
    /// Fails only when the run cannot start: unknown job, a run already
    /// active, or a job in `Error` that must be cleared first. Everything
    /// after the lease is taken is reported through the returned
    /// [`RunReport`] and the persisted state.
    pub async fn run(
        &self,
        job_id: &str,
        started_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<RunReport, HarvestError> {
        let job = self.job(job_id).await?;
        let state = self.store.run_state(job_id).await?;
        match JobState::of(&state) {
            JobState::Running => return Err(HarvestError::AlreadyRunning(job_id.to_string())),
            JobState::Error => {
                return Err(HarvestError::InvalidTransition {
                    job: job_id.to_string(),
                    action: "run",
                    state: JobState::Error,
                })
            }
            JobState::Idle | JobState::Paused => {}
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        if !self.store.claim_run(job_id, &task_id, started_at).await? {
            return Err(HarvestError::AlreadyRunning(job_id.to_string()));
        }
        self.register(job_id, &cancel);

        let token = state.resumption_token.clone();
        let mut processed = if token.is_some() { state.item_processed } else { 0 };
        info!(
            job = %job_id,
            task = %task_id,
            resume = token.is_some(),
            "harvest started"
        );

        let mut stats = RunStats::default();
        let reset = if token.is_none() {
            self.store
                .checkpoint(job_id, None, 0)
                .await
                .map_err(HarvestError::from)
        } else {
            Ok(())
        };
        let outcome = match reset {
            Ok(()) => self.drive(&job, token, &mut processed, &mut stats, &cancel).await,
            Err(e) => Err(e),
        };

        let (status, error) = match outcome {
            Ok(true) => (RunStatus::Pause, None),
            Ok(false) => (RunStatus::Success, None),
            Err(e) => {
                error!(job = %job_id, error = %e, "harvest failed");
                (RunStatus::Error, Some(e.to_string()))
            }
        };

        Ok(self
            .finish(&job, task_id, started_at, status, processed, stats, error)
            .await)
    }

    /// Page loop. Returns `true` when a pause stopped it early.
    async fn drive(
        &self,
        job: &HarvestJobConfig,
        mut token: Option<String>,
        processed: &mut u64,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> Result<bool, HarvestError> {
        job.validate()?;

        if job.auto_distribution {
            self.progress.report(HarvestProgressEvent::SyncingSets {
                job: job.id.clone(),
            });
            let sets = self
                .fetch_with_retry("ListSets", move || self.source.list_sets(&job.base_url))
                .await?;
            sync_taxonomy(self.store.as_ref(), job.index_id, &sets).await?;
        }

        let registry = SchemaRegistry::new(self.store.item_type_schemas().await?);
        if registry.is_empty() {
            warn!(job = %job.id, "no item type schemas stored; every record will fail to map");
        }

        loop {
            let request = ListRecordsRequest::for_job(job, token.clone());
            let page = self
                .fetch_with_retry("ListRecords", || self.source.list_records(&request))
                .await?;
            stats.pages += 1;
            debug!(job = %job.id, page = stats.pages, records = page.records.len(), "page fetched");

            for record in &page.records {
                let outcome = self.process_record(job, &registry, record).await;
                tally(job, &record.identifier, outcome, processed, stats);
            }
            for rejected in &page.rejected {
                let outcome = RecordOutcome::Failed(HarvestError::InvalidRecord {
                    identifier: rejected.identifier.clone(),
                    reason: rejected.reason.clone(),
                });
                tally(job, &rejected.identifier, outcome, processed, stats);
            }

            token = page.resumption_token;
            self.store
                .checkpoint(&job.id, token.as_deref(), *processed)
                .await?;
            self.progress.report(HarvestProgressEvent::Page {
                job: job.id.clone(),
                page: stats.pages,
                records: page.records.len(),
                processed: *processed,
            });

            if token.is_none() {
                return Ok(false);
            }
            if cancel.is_cancelled() {
                info!(job = %job.id, page = stats.pages, "pausing at page boundary");
                return Ok(true);
            }
        }
    }

    /// Map and write one record. Never fails the page.
    pub async fn process_record(
        &self,
        job: &HarvestJobConfig,
        registry: &SchemaRegistry,
        record: &OaiRecord,
    ) -> RecordOutcome {
        match self.try_process_record(job, registry, record).await {
            Ok(outcome) => outcome,
            Err(e) => RecordOutcome::Failed(e),
        }
    }

    async fn try_process_record(
        &self,
        job: &HarvestJobConfig,
        registry: &SchemaRegistry,
        record: &OaiRecord,
    ) -> Result<RecordOutcome, HarvestError> {
        let transient = |e: anyhow::Error| HarvestError::TransientUpsert {
            identifier: record.identifier.clone(),
            message: format!("{:#}", e),
        };

        let mapper = DcMapper::new(record, registry)?;
        let existing = self
            .store
            .find_item(mapper.identifier())
            .await
            .map_err(transient)?;

        let mut indexes = existing
            .as_ref()
            .map(|e| e.indexes.clone())
            .unwrap_or_default();
        if job.auto_distribution {
            let linked = resolve_indexes(self.store.as_ref(), mapper.set_specs(), job.index_id)
                .await
                .map_err(transient)?;
            for id in linked {
                if !indexes.contains(&id) {
                    indexes.push(id);
                }
            }
        } else if !indexes.contains(&job.index_id) {
            indexes.push(job.index_id);
        }

        let published_on = mapper.datestamp().date_naive();
        if let Some(ref entry) = existing {
            if job.update_style == UpdateStyle::Bulk
                && entry.published_on >= published_on
                && entry.indexes == indexes
            {
                return Ok(RecordOutcome::Skipped(SkipReason::Unchanged));
            }
        }

        if mapper.is_deleted() {
            debug!(identifier = %record.identifier, "deleted upstream; catalog left unchanged");
            return Ok(RecordOutcome::Skipped(SkipReason::Deleted));
        }

        let item = mapper.map()?;
        let entry = CatalogEntry {
            id: existing
                .map(|e| e.id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            harvest_id: record.identifier.clone(),
            schema_id: item.schema_id,
            document: item.document(),
            indexes,
            published_on,
            action: ACTION_PUBLISH.to_string(),
            dedup_hash: item.dedup_hash(),
        };
        self.store.upsert_item(&entry).await.map_err(transient)?;
        Ok(RecordOutcome::Upserted)
    }

    /// Retry `op` on transient protocol failures with exponential backoff.
    async fn fetch_with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProtocolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        request = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the lease, persist the outcome and notify. Never fails.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        job: &HarvestJobConfig,
        task_id: String,
        started_at: DateTime<Utc>,
        status: RunStatus,
        processed: u64,
        stats: RunStats,
        error: Option<String>,
    ) -> RunReport {
        self.unregister(&job.id);
        let finished_at = Utc::now();

        let persisted = async {
            let mut state = self.store.run_state(&job.id).await?;
            state.task_id = None;
            state.item_processed = processed;
            state.last_status = Some(status);
            state.last_finished_at = Some(finished_at);
            self.store.save_run_state(&job.id, &state).await
        };
        if let Err(e) = persisted.await {
            error!(job = %job.id, error = %format!("{:#}", e), "failed to persist final run state");
        }

        self.notify(RunStatusMessage {
            status,
            job_id: job.id.clone(),
            repository_name: job.repository_name.clone(),
            update_style: job.update_style,
            started_at: Some(started_at),
            finished_at,
            processed,
        })
        .await;

        self.progress.report(HarvestProgressEvent::Finished {
            job: job.id.clone(),
            status,
            processed,
        });
        info!(
            job = %job.id,
            status = %status,
            pages = stats.pages,
            upserted = stats.upserted,
            skipped = stats.skipped,
            deleted = stats.deleted,
            failed = stats.failed,
            "harvest finished"
        );

        RunReport {
            task_id,
            job_id: job.id.clone(),
            repository_name: job.repository_name.clone(),
            status,
            started_at,
            finished_at,
            processed,
            stats,
            error,
        }
    }

    async fn notify(&self, message: RunStatusMessage) {
        if let Err(e) = self.notifier.send_run_status(&message).await {
            warn!(job = %message.job_id, error = %format!("{:#}", e), "status notification failed");
        }
    }
}

/// Fold one record's outcome into the run counters.
fn tally(
    job: &HarvestJobConfig,
    identifier: &str,
    outcome: RecordOutcome,
    processed: &mut u64,
    stats: &mut RunStats,
) {
    match outcome {
        RecordOutcome::Upserted => {
            stats.upserted += 1;
            *processed += 1;
        }
        RecordOutcome::Skipped(SkipReason::Unchanged) => stats.skipped += 1,
        RecordOutcome::Skipped(SkipReason::Deleted) => stats.deleted += 1,
        RecordOutcome::Failed(e) => {
            stats.failed += 1;
            warn!(job = %job.id, identifier, error = %e, "record skipped");
        }
    }
}
