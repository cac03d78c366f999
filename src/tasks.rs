//! Background execution of harvest runs.
//!
//! [`HarvestExecutor`] spawns one tokio task per submitted run, refuses a
//! second submission for a job whose run is still active, and routes each
//! finished run to [`TaskHooks`]: a [`TaskResult`] plus the submitting
//! actor on success, a [`TaskFailure`] when the run could not start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::HarvestController;
use crate::error::HarvestError;
use crate::models::RunReport;
use crate::store::HarvestStore;

pub const TASK_NAME: &str = "harvest";

/// Who asked for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Execution record of a run, in the shape task statistics consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_state: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_records: u64,
    pub execution_time: String,
    pub task_name: String,
    pub repository_name: String,
    pub task_id: String,
}

impl TaskResult {
    /// The executor ran the task to completion; the harvest outcome itself
    /// lives in the report's status.
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            task_state: "SUCCESS".to_string(),
            start_time: report.started_at,
            end_time: report.finished_at,
            total_records: report.processed,
            execution_time: format_duration(report.finished_at - report.started_at),
            task_name: TASK_NAME.to_string(),
            repository_name: report.repository_name.clone(),
            task_id: report.task_id.clone(),
        }
    }
}

/// A run that never got going, with the arguments it was submitted with.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub job_id: String,
    /// Empty when the job is not registered.
    pub repository_name: String,
    pub start_time: DateTime<Utc>,
    pub actor: ActorContext,
    pub error: String,
    pub end_time: DateTime<Utc>,
}

impl TaskFailure {
    pub fn exec_data(&self) -> TaskResult {
        TaskResult {
            task_state: "FAILURE".to_string(),
            start_time: self.start_time,
            end_time: self.end_time,
            total_records: 0,
            execution_time: format_duration(self.end_time - self.start_time),
            task_name: TASK_NAME.to_string(),
            repository_name: self.repository_name.clone(),
            task_id: String::new(),
        }
    }
}

fn format_duration(d: chrono::Duration) -> String {
    let millis = d.num_milliseconds().max(0);
    format!("{}.{:03}s", millis / 1000, millis % 1000)
}

#[async_trait]
pub trait TaskHooks: Send + Sync {
    async fn on_success(&self, result: &TaskResult, actor: &ActorContext);
    async fn on_failure(&self, failure: &TaskFailure);
}

/// Hooks that only log.
pub struct LogHooks;

#[async_trait]
impl TaskHooks for LogHooks {
    async fn on_success(&self, result: &TaskResult, _actor: &ActorContext) {
        info!(
            task = %result.task_id,
            records = result.total_records,
            elapsed = %result.execution_time,
            "harvest task finished"
        );
    }

    async fn on_failure(&self, failure: &TaskFailure) {
        warn!(
            job = %failure.job_id,
            repository = %failure.repository_name,
            error = %failure.error,
            "harvest task failed"
        );
    }
}

pub struct HarvestExecutor {
    controller: Arc<HarvestController>,
    hooks: Arc<dyn TaskHooks>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl HarvestExecutor {
    pub fn new(controller: Arc<HarvestController>, hooks: Arc<dyn TaskHooks>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            hooks,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn a run of `job_id`.
    pub fn submit(
        self: &Arc<Self>,
        job_id: &str,
        started_at: DateTime<Utc>,
        actor: ActorContext,
    ) -> Result<JoinHandle<Result<TaskResult, TaskFailure>>, HarvestError> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active();
            if active.contains_key(job_id) {
                return Err(HarvestError::AlreadyRunning(job_id.to_string()));
            }
            active.insert(job_id.to_string(), cancel.clone());
        }

        let this = Arc::clone(self);
        let job_id = job_id.to_string();
        Ok(tokio::spawn(async move {
            let outcome = this.controller.run(&job_id, started_at, cancel).await;
            this.active().remove(&job_id);

            match outcome {
                Ok(report) => {
                    let result = TaskResult::from_report(&report);
                    this.hooks.on_success(&result, &actor).await;
                    Ok(result)
                }
                Err(e) => {
                    let repository_name = this
                        .controller
                        .store()
                        .job_config(&job_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|job| job.repository_name)
                        .unwrap_or_default();
                    let failure = TaskFailure {
                        job_id,
                        repository_name,
                        start_time: started_at,
                        actor,
                        error: e.to_string(),
                        end_time: Utc::now(),
                    };
                    this.hooks.on_failure(&failure).await;
                    Err(failure)
                }
            }
        }))
    }

    /// Request a pause of the job's active run.
    pub fn pause(&self, job_id: &str) -> bool {
        match self.active().get(job_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active().contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::models::{
        HarvestJobConfig, HarvestRunState, OaiRecord, OaiSet, RecordPage, RunStatus, UpdateStyle,
    };
    use crate::notify::LogNotifier;
    use crate::oai::{ListRecordsRequest, OaiSource};
    use crate::store::memory::InMemoryStore;
    use tokio::sync::Notify;

    /// One endless page sequence; each request waits for a permit.
    struct GatedSource {
        gate: Notify,
    }

    #[async_trait]
    impl OaiSource for GatedSource {
        async fn list_sets(&self, _base_url: &str) -> Result<Vec<OaiSet>, ProtocolError> {
            Ok(Vec::new())
        }

        async fn list_records(&self, request: &ListRecordsRequest) -> Result<RecordPage, ProtocolError> {
            self.gate.notified().await;
            let n: u32 = request
                .resumption_token
                .as_deref()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            Ok(RecordPage {
                records: Vec::new(),
                rejected: Vec::new(),
                resumption_token: Some((n + 1).to_string()),
            })
        }

        async fn get_record(&self, _: &str, id: &str, _: &str) -> Result<OaiRecord, ProtocolError> {
            Err(ProtocolError::Oai {
                code: "idDoesNotExist".into(),
                message: id.into(),
            })
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        successes: Mutex<Vec<TaskResult>>,
        failures: Mutex<Vec<TaskFailure>>,
    }

    #[async_trait]
    impl TaskHooks for CountingHooks {
        async fn on_success(&self, result: &TaskResult, _actor: &ActorContext) {
            self.successes.lock().unwrap().push(result.clone());
        }
        async fn on_failure(&self, failure: &TaskFailure) {
            self.failures.lock().unwrap().push(failure.clone());
        }
    }

    async fn setup() -> (Arc<HarvestExecutor>, Arc<GatedSource>, Arc<CountingHooks>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .register_job(&HarvestJobConfig {
                id: "j".into(),
                repository_name: "Repo".into(),
                base_url: "https://repo.example.org/oai".into(),
                metadata_prefix: "oai_dc".into(),
                from_date: None,
                until_date: None,
                set_spec: None,
                index_id: 1,
                update_style: UpdateStyle::Bulk,
                auto_distribution: false,
            })
            .await
            .unwrap();
        let source = Arc::new(GatedSource {
            gate: Notify::new(),
        });
        let hooks = Arc::new(CountingHooks::default());
        let controller = Arc::new(HarvestController::new(
            store.clone(),
            source.clone(),
            Arc::new(LogNotifier),
        ));
        (HarvestExecutor::new(controller, hooks.clone()), source, hooks, store)
    }

    #[tokio::test]
    async fn second_submission_is_rejected_and_pause_stops_run() {
        let (executor, source, hooks, store) = setup().await;

        let handle = executor
            .submit("j", Utc::now(), ActorContext::default())
            .unwrap();
        assert!(executor.is_active("j"));
        assert!(matches!(
            executor.submit("j", Utc::now(), ActorContext::default()),
            Err(HarvestError::AlreadyRunning(_))
        ));

        assert!(executor.pause("j"));
        source.gate.notify_one();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.task_state, "SUCCESS");
        assert_eq!(result.task_name, "harvest");
        assert!(!executor.is_active("j"));
        assert_eq!(hooks.successes.lock().unwrap().len(), 1);

        let state = store.run_state("j").await.unwrap();
        assert_eq!(state.last_status, Some(RunStatus::Pause));
        assert_eq!(state.resumption_token.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn unknown_job_reaches_failure_hook() {
        let (executor, _source, hooks, _store) = setup().await;
        let actor = ActorContext {
            user_id: Some("admin".into()),
            ..Default::default()
        };
        let failure = executor
            .submit("missing", Utc::now(), actor.clone())
            .unwrap()
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.actor, actor);
        let data = failure.exec_data();
        assert_eq!(data.task_state, "FAILURE");
        assert_eq!(data.repository_name, "");
        assert_eq!(hooks.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_known_job_reports_its_repository() {
        let (executor, _source, hooks, store) = setup().await;
        store
            .save_run_state(
                "j",
                &HarvestRunState {
                    resumption_token: Some("5".into()),
                    last_status: Some(RunStatus::Error),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failure = executor
            .submit("j", Utc::now(), ActorContext::default())
            .unwrap()
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.repository_name, "Repo");
        let data = failure.exec_data();
        assert_eq!(data.repository_name, "Repo");
        assert_eq!(data.total_records, 0);
        assert_eq!(hooks.failures.lock().unwrap()[0].repository_name, "Repo");
    }
}
