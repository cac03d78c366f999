//! # OAI Harvest
//!
//! An incremental OAI-PMH harvester that maps Dublin Core records into a
//! schema-driven catalog and distributes them into taxonomy nodes.
//!
//! A harvest job walks a remote repository's `ListRecords` sequence page by
//! page, maps every record into the newest item schema for its resource
//! type, and upserts it into the catalog keyed by its OAI identifier. The
//! continuation token is checkpointed after each page, so a paused or
//! crashed run resumes at the first unprocessed page.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  OAI-PMH    │──▶│ Controller  │──▶│   SQLite     │
//! │  repository │   │ map + skip  │   │ catalog/runs │
//! └─────────────┘   └──────┬──────┘   └──────────────┘
//!                          │
//!            ┌─────────────┼─────────────┐
//!            ▼             ▼             ▼
//!       ┌─────────┐  ┌───────────┐  ┌──────────┐
//!       │ Mapper  │  │ Taxonomy  │  │ Notifier │
//!       │ DC→item │  │ sets→idx  │  │  status  │
//!       └─────────┘  └───────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! oaih init                          # create database, register jobs
//! oaih schema import dc.json --id 1 --category Multiple
//! oaih index add "Harvested"         # target node for the job
//! oaih run physics                   # harvest; Ctrl-C pauses
//! oaih status physics
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`commands`] | `oaih` subcommand implementations |
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`oai`] | OAI-PMH protocol client |
//! | [`schema`] | Item type schemas and title lookup |
//! | [`mapper`] | Dublin Core classification and mapping |
//! | [`taxonomy`] | Remote sets → taxonomy nodes |
//! | [`controller`] | Harvest job state machine |
//! | [`tasks`] | Background run executor |
//! | [`notify`] | Run status notifications |
//! | [`progress`] | Page progress reporting |
//! | [`store`] | Storage trait and in-memory backend |
//! | [`sqlite_store`] | SQLite backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod commands;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod mapper;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod oai;
pub mod progress;
pub mod schema;
pub mod sqlite_store;
pub mod store;
pub mod tasks;
pub mod taxonomy;
