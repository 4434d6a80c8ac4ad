//! Collaborator and unit-of-work traits.
//!
//! Everything the orchestrator talks to outside its own database sits
//! behind one of these traits, so the scheduler and the jobs can be driven
//! by HTTP clients in production and by fakes in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              TaskRegistry                │
//! │  ┌──────────────┐  ┌──────────────────┐  │
//! │  │case_ingestion│  │answer_generation │  │
//! │  └──────┬───────┘  └────────┬─────────┘  │
//! └─────────┼───────────────────┼────────────┘
//!           ▼                   ▼
//!   MaterialSource         AnswerGenerator
//!   BlobUploader
//!           │
//!           ▼
//!   verification_tasks ──▶ VerificationScheduler
//!                            │  IngestionStatusChecker
//!                            ▼
//!                         JobTrigger ──▶ answer_generation
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use case_ingest_core::execution::{ExecutionRecord, JobParameters};
use case_ingest_core::models::{Document, IngestionStatus, Material};

// ═══════════════════════════════════════════════════════════════════════
// External collaborators
// ═══════════════════════════════════════════════════════════════════════

/// Reports whether a blob has been indexed by the ingestion service.
#[async_trait]
pub trait IngestionStatusChecker: Send + Sync {
    /// `Ok(None)` when the service has no status for the blob yet.
    async fn check(&self, blob_name: &str) -> Result<Option<IngestionStatus>>;
}

/// Handle to a started (or previously started) job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub job_name: String,
    /// `false` when a run with the same identifying parameters already
    /// existed and nothing new was started.
    pub created: bool,
}

/// Starts downstream jobs.
///
/// Implementations must not start a second run for a job name and
/// identifying-parameter set that already ran.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    async fn start(&self, job_name: &str, params: JobParameters) -> Result<RunHandle>;
}

/// Lists the materials the source system holds for a case.
#[async_trait]
pub trait MaterialSource: Send + Sync {
    async fn materials_for_case(&self, case_id: &str) -> Result<Vec<Material>>;
}

/// Result of copying a material into document storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub blob_name: String,
    pub blob_uri: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
}

/// Copies a material's content into document storage.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    async fn upload(&self, doc: &Document, material: &Material) -> Result<UploadedBlob>;
}

/// Asks the answer service to answer one query against one document.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, case_id: &str, doc_id: &str, query_id: Option<&str>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Task trait and registry
// ═══════════════════════════════════════════════════════════════════════

/// A named unit of work the launcher can run.
///
/// `execute` may be invoked more than once for the same record when the
/// task is wrapped in [`Retrying`](crate::retry::Retrying).
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, record: &ExecutionRecord) -> Result<Value>;
}

/// Explicit name → task mapping, built once at startup.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registers a task under its own name. Duplicate names are an error.
    pub fn register(&mut self, task: Arc<dyn Task>) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            bail!("task '{}' is already registered", name);
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
