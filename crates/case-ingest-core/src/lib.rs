//! # Case Ingest Core
//!
//! Runtime-free logic for Case Ingest: the document and verification-task
//! model, store traits, identity resolution, fan-out partitioning, fan-in
//! aggregation, and immutable job execution records.
//!
//! This crate contains no tokio, sqlx, or network I/O. The application
//! crate provides the SQLite stores, HTTP collaborators, and the
//! verification scheduler on top of it.

pub mod aggregate;
pub mod execution;
pub mod identity;
pub mod models;
pub mod partition;
pub mod store;
