//! Harvest progress reporting.
//!
//! `oaih run` reports every checkpointed page on **stderr**, leaving stdout
//! to the final run summary.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

use crate::models::RunStatus;

/// A single progress event for a harvest run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarvestProgressEvent {
    /// Remote sets are being mirrored into the taxonomy.
    SyncingSets { job: String },
    /// A page finished and was checkpointed.
    Page {
        job: String,
        page: u64,
        records: usize,
        processed: u64,
    },
    /// The run ended.
    Finished {
        job: String,
        status: RunStatus,
        processed: u64,
    },
}

impl HarvestProgressEvent {
    fn human_line(&self) -> String {
        match self {
            HarvestProgressEvent::SyncingSets { job } => format!("harvest {}  syncing sets", job),
            HarvestProgressEvent::Page {
                job,
                page,
                records,
                processed,
            } => format!(
                "harvest {}  page {}  {} records  {} processed",
                job,
                page,
                records,
                group_thousands(*processed)
            ),
            HarvestProgressEvent::Finished {
                job,
                status,
                processed,
            } => format!(
                "harvest {}  {}  {} processed",
                job,
                status.label().to_lowercase(),
                group_thousands(*processed)
            ),
        }
    }
}

pub trait HarvestProgressReporter: Send + Sync {
    /// Called by the controller at page boundaries and once at the end.
    fn report(&self, event: HarvestProgressEvent);
}

/// `harvest physics  page 3  100 records  1,234 processed`
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.human_line());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr, tagged by `event`.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Which reporter `oaih run` installs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human on a terminal, off when stderr is redirected.
    pub fn default_for_tty() -> Self {
        match atty::is(atty::Stream::Stderr) {
            true => ProgressMode::Human,
            false => ProgressMode::Off,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "off" => ProgressMode::Off,
            "human" => ProgressMode::Human,
            "json" => ProgressMode::Json,
            _ => return None,
        })
    }

    pub fn reporter(&self) -> Arc<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(12_345), "12,345");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn page_event_lines() {
        let event = HarvestProgressEvent::Page {
            job: "physics".into(),
            page: 3,
            records: 100,
            processed: 1234,
        };
        assert_eq!(
            event.human_line(),
            "harvest physics  page 3  100 records  1,234 processed"
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "page");
        assert_eq!(json["processed"], 1234);
    }

    #[test]
    fn finished_event_uses_status_codes() {
        let event = HarvestProgressEvent::Finished {
            job: "physics".into(),
            status: RunStatus::Pause,
            processed: 7,
        };
        assert_eq!(event.human_line(), "harvest physics  suspended  7 processed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["status"], "PAUSE");
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
