//! Core data types shared by the protocol client, mapper, resolver and
//! controller.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HarvestError;

/// Longest repository name the job table accepts.
pub const MAX_REPOSITORY_NAME_LEN: usize = 20;

/// How existing catalog entries are treated on re-harvest.
///
/// Only `Bulk` enables the unchanged-record skip; `Differential` rewrites
/// every delivered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStyle {
    Differential,
    Bulk,
}

impl UpdateStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStyle::Differential => "differential",
            UpdateStyle::Bulk => "bulk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "differential" => Some(UpdateStyle::Differential),
            "bulk" => Some(UpdateStyle::Bulk),
            _ => None,
        }
    }
}

/// Immutable per-run description of what to harvest and where to put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestJobConfig {
    pub id: String,
    pub repository_name: String,
    pub base_url: String,
    pub metadata_prefix: String,
    pub from_date: Option<NaiveDate>,
    pub until_date: Option<NaiveDate>,
    pub set_spec: Option<String>,
    /// Taxonomy node receiving items (or parenting auto-distributed sets).
    pub index_id: i64,
    pub update_style: UpdateStyle,
    pub auto_distribution: bool,
}

impl HarvestJobConfig {
    /// Checks the settings a run relies on before it fetches anything.
    pub fn validate(&self) -> Result<(), HarvestError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(HarvestError::Configuration(format!(
                "job '{}' has no base URL",
                self.id
            )));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(HarvestError::Configuration(format!(
                "job '{}' base URL must be http(s): {}",
                self.id, url
            )));
        }
        if self.metadata_prefix.trim().is_empty() {
            return Err(HarvestError::Configuration(format!(
                "job '{}' has an empty metadata prefix",
                self.id
            )));
        }
        if self.repository_name.chars().count() > MAX_REPOSITORY_NAME_LEN {
            return Err(HarvestError::Configuration(format!(
                "job '{}' repository name exceeds {} characters",
                self.id, MAX_REPOSITORY_NAME_LEN
            )));
        }
        if let (Some(from), Some(until)) = (self.from_date, self.until_date) {
            if from > until {
                return Err(HarvestError::Configuration(format!(
                    "job '{}' from_date {} is after until_date {}",
                    self.id, from, until
                )));
            }
        }
        Ok(())
    }
}

/// Terminal outcome of a run (or of a clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Pause,
    Error,
    Cancel,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Pause => "PAUSE",
            RunStatus::Error => "ERROR",
            RunStatus::Cancel => "CANCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunStatus::Success),
            "PAUSE" => Some(RunStatus::Pause),
            "ERROR" => Some(RunStatus::Error),
            "CANCEL" => Some(RunStatus::Cancel),
            _ => None,
        }
    }

    /// Human-readable result used in notification subjects.
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Success => "Successful",
            RunStatus::Pause => "Suspended",
            RunStatus::Error => "Failed",
            RunStatus::Cancel => "Cancel",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable, persisted state of a job's harvest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestRunState {
    /// Lease held by the active run; `None` when nothing is running.
    pub task_id: Option<String>,
    /// Present only while a page sequence is unfinished.
    pub resumption_token: Option<String>,
    pub item_processed: u64,
    pub last_status: Option<RunStatus>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a job, derived from its [`HarvestRunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Idle,
    Running,
    Paused,
    Error,
}

impl JobState {
    pub fn of(state: &HarvestRunState) -> Self {
        if state.task_id.is_some() {
            JobState::Running
        } else if state.last_status == Some(RunStatus::Error) {
            JobState::Error
        } else if state.resumption_token.is_some() {
            JobState::Paused
        } else {
            JobState::Idle
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One harvested record, normalized at the protocol boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct OaiRecord {
    pub identifier: String,
    pub datestamp: DateTime<Utc>,
    pub deleted: bool,
    /// Raw inner XML of the `<metadata>` element (empty for deletions).
    pub metadata: String,
    pub set_specs: Vec<String>,
}

/// A remote set as listed by `ListSets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiSet {
    pub spec: String,
    pub name: String,
}

/// A record whose header could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Header identifier, or `"<unknown>"` when it is missing.
    pub identifier: String,
    pub reason: String,
}

/// One page of a `ListRecords` sequence.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<OaiRecord>,
    /// Records dropped at the protocol boundary; the rest of the page stands.
    pub rejected: Vec<RejectedRecord>,
    /// `None` when the sequence is complete.
    pub resumption_token: Option<String>,
}

/// A taxonomy node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexNode {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub index_name: String,
    pub index_name_english: String,
    /// Remote set spec this node was created for, if any.
    pub harvest_spec: Option<String>,
    pub browsing_role: String,
    pub contribute_role: String,
    pub public_state: bool,
    pub recursive_public_state: bool,
    pub position: i64,
}

/// Fields of an [`IndexNode`] before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIndexNode {
    pub parent_id: Option<i64>,
    pub index_name: String,
    pub index_name_english: String,
    pub harvest_spec: Option<String>,
    pub browsing_role: String,
    pub contribute_role: String,
    pub public_state: bool,
    pub recursive_public_state: bool,
    pub position: i64,
}

/// Action recorded alongside a catalog write.
pub const ACTION_PUBLISH: &str = "publish";

/// A catalog item linked to a remote record by its harvest identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub harvest_id: String,
    pub schema_id: i64,
    pub document: serde_json::Value,
    pub indexes: Vec<i64>,
    pub published_on: NaiveDate,
    pub action: String,
    pub dedup_hash: String,
}

/// Outcome tallies for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pages: u64,
    pub upserted: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
}

/// What a finished run reports to its invoker.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task_id: String,
    pub job_id: String,
    pub repository_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Value of the job's processed-item counter at the end of the run.
    pub processed: u64,
    pub stats: RunStats,
    /// Message of the error that ended the run, if any.
    pub error: Option<String>,
}
