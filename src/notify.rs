//! Run status notifications.
//!
//! The controller hands a [`RunStatusMessage`] to a [`Notifier`] after every
//! run and every clear. Delivery is best-effort: the controller logs a failed
//! send and carries on.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{RunStatus, UpdateStyle};

/// Everything a status notification reports about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatusMessage {
    pub status: RunStatus,
    pub job_id: String,
    pub repository_name: String,
    pub update_style: UpdateStyle,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub processed: u64,
}

impl RunStatusMessage {
    /// `harvester running status [<repo>(<job>)] [<label>]`
    pub fn subject(&self) -> String {
        format!(
            "harvester running status [{}({})] [{}]",
            self.repository_name,
            self.job_id,
            self.status.label()
        )
    }

    /// Plain-text body listing the run's figures.
    pub fn body(&self) -> String {
        let started = self
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "result: {}\nrepository: {}\nupdate style: {}\nstarted: {}\nfinished: {}\nprocessed: {}\n",
            self.status.label(),
            self.repository_name,
            self.update_style.as_str(),
            started,
            self.finished_at.to_rfc3339(),
            self.processed
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_run_status(&self, message: &RunStatusMessage) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_run_status(&self, message: &RunStatusMessage) -> Result<()> {
        info!(
            job = %message.job_id,
            status = %message.status,
            processed = message.processed,
            "{}",
            message.subject()
        );
        Ok(())
    }
}
