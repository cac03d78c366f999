//! Error taxonomy for the harvest engine.
//!
//! Errors are split by the scope they abort:
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`ProtocolError`] | page | aborts the run, final status `ERROR` |
//! | [`HarvestError::InvalidRecord`] | record | unreadable header, counted as failed |
//! | [`HarvestError::SchemaUnavailable`] | record | record counted as failed, run continues |
//! | [`MappingError`] | record | record counted as failed, run continues |
//! | [`HarvestError::TransientUpsert`] | record | write rolled back, run continues |
//! | [`HarvestError::Configuration`] | setup | fails before any page is fetched |

use thiserror::Error;

use crate::models::JobState;

/// Failure talking to, or understanding, a remote OAI-PMH repository.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("repository returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed OAI-PMH response: {0}")]
    Xml(String),

    #[error("repository error '{code}': {message}")]
    Oai { code: String, message: String },

    #[error("invalid datestamp '{0}'")]
    InvalidDatestamp(String),

    #[error("record header is missing <{0}>")]
    MissingField(&'static str),
}

impl ProtocolError {
    /// Whether retrying the same request may succeed.
    ///
    /// Connection failures, timeouts, rate limiting and server errors are
    /// transient; parse failures and OAI error codes are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Transport { .. } => true,
            ProtocolError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A harvested record's metadata could not be placed into the item schema.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("schema {schema_id} has no field for '{path}'")]
    MissingField { schema_id: i64, path: String },

    #[error("cannot decode <{element}> content: {reason}")]
    Malformed { element: String, reason: String },
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no item type schema for category '{0}'")]
    SchemaUnavailable(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("record '{identifier}' rejected: {reason}")]
    InvalidRecord { identifier: String, reason: String },

    #[error("catalog write for '{identifier}' failed: {message}")]
    TransientUpsert { identifier: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("harvest job '{0}' already has an active run")]
    AlreadyRunning(String),

    #[error("cannot {action} harvest job '{job}' while it is {state}")]
    InvalidTransition {
        job: String,
        action: &'static str,
        state: JobState,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
