//! # Case Ingest
//!
//! Orchestrates ingestion of court-case documents into a downstream
//! search/answering service.
//!
//! Case materials are discovered per case, resolved to stable document ids
//! (re-runs reuse existing documents instead of uploading twice), uploaded,
//! and queued for verification. A polling scheduler confirms ingestion with
//! the status service under lease-based claims and, once documents are
//! ready, starts answer generation exactly once for the cases involved.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────────┐
//! │ case_ingest- │──▶│   documents    │──▶│ verification_     │
//! │ ion job      │   │   (SQLite)     │   │ tasks (queue)     │
//! └──────────────┘   └───────────────┘   └────────┬─────────┘
//!                                                 │ claim / lease
//!                                                 ▼
//!                    ┌───────────────┐   ┌──────────────────┐
//!                    │ answer_gener- │◀──│ Verification      │
//!                    │ ation job     │   │ Scheduler         │
//!                    └───────────────┘   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! caseingest init
//! caseingest ingest 6f1c2a34-0b7e-4d1a-9a55-2f6de1c0a001
//! caseingest verify run
//! caseingest tasks --status failed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite document store, verification queue, job instances |
//! | [`traits`] | Collaborator traits and the task registry |
//! | [`clients`] | HTTP collaborators |
//! | [`retry`] | Retry decorator |
//! | [`fanout`] | Bounded parallel partition execution |
//! | [`ingest`] | Case ingestion job |
//! | [`answers`] | Answer generation job |
//! | [`launcher`] | Deduplicating job launcher |
//! | [`verification`] | Verification scheduler |
//! | [`status`] | Queue and readiness commands |
//! | [`app`] | Runtime wiring for the CLI |

pub mod answers;
pub mod app;
pub mod clients;
pub mod config;
pub mod db;
pub mod fanout;
pub mod ingest;
pub mod launcher;
pub mod migrate;
pub mod retry;
pub mod sqlite_store;
pub mod status;
pub mod traits;
pub mod verification;
