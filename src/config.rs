use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{HarvestJobConfig, UpdateStyle};

/// Upper bound on `harvest.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestSettings,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Transport and retry settings shared by every job.
#[derive(Debug, Deserialize, Clone)]
pub struct HarvestSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl HarvestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_user_agent() -> String {
    format!("oaih/{}", env!("CARGO_PKG_VERSION"))
}

/// One `[jobs.<id>]` table. The table key becomes the job id.
#[derive(Debug, Deserialize, Clone)]
pub struct JobEntry {
    pub repository_name: String,
    pub base_url: String,
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
    #[serde(default)]
    pub until_date: Option<NaiveDate>,
    #[serde(default)]
    pub set_spec: Option<String>,
    pub index_id: i64,
    #[serde(default = "default_update_style")]
    pub update_style: UpdateStyle,
    #[serde(default)]
    pub auto_distribution: bool,
}

fn default_metadata_prefix() -> String {
    "oai_dc".to_string()
}
fn default_update_style() -> UpdateStyle {
    UpdateStyle::Differential
}

impl JobEntry {
    pub fn to_job_config(&self, id: &str) -> HarvestJobConfig {
        HarvestJobConfig {
            id: id.to_string(),
            repository_name: self.repository_name.clone(),
            base_url: self.base_url.trim().to_string(),
            metadata_prefix: self.metadata_prefix.clone(),
            from_date: self.from_date,
            until_date: self.until_date,
            set_spec: self.set_spec.clone().filter(|s| !s.trim().is_empty()),
            index_id: self.index_id,
            update_style: self.update_style,
            auto_distribution: self.auto_distribution,
        }
    }
}

impl Config {
    /// All configured jobs, ordered by id.
    pub fn job_configs(&self) -> Vec<HarvestJobConfig> {
        self.jobs
            .iter()
            .map(|(id, entry)| entry.to_job_config(id))
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.harvest.timeout_secs == 0 {
        anyhow::bail!("harvest.timeout_secs must be > 0");
    }
    if config.harvest.max_retries > MAX_RETRIES_LIMIT {
        anyhow::bail!("harvest.max_retries must be <= {}", MAX_RETRIES_LIMIT);
    }

    for job in config.job_configs() {
        job.validate()
            .with_context(|| format!("Invalid configuration for job '{}'", job.id))?;
    }

    Ok(config)
}
