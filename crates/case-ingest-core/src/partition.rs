//! Fan-out partitioning.
//!
//! A [`Partitioner`] splits one step's scope into independently processable
//! [`PartitionWorkItem`]s keyed by a name that is unique within a single
//! invocation. Partitions carry only the context their worker needs; there
//! is no shared mutable state between them, so the executor may run them in
//! any order and in parallel.
//!
//! | Partitioner | Scope | Key |
//! |-------------|-------|-----|
//! | [`CasePartitioner`] | explicit case-id list | `case-<caseId>` |
//! | [`MaterialPartitioner`] | eligible materials of one case | `material-<materialId>` |
//! | [`ReadyDocumentPartitioner`] | ingested documents in the store | `doc-<docId>[-query-<queryId>]` |
//!
//! An empty scope yields an empty map, never an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{IngestionPhase, Material, PartitionWorkItem};
use crate::store::DocumentStore;

pub type Partitions = BTreeMap<String, PartitionWorkItem>;

#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Produces the work items for this step.
    ///
    /// `grid_size` is the executor's parallelism hint. Every item in scope
    /// is always produced regardless of its value.
    async fn partition(&self, grid_size: usize) -> Result<Partitions>;
}

pub fn case_key(case_id: &str) -> String {
    format!("case-{}", case_id)
}

/// One partition per case id. Duplicate ids collapse into one partition.
pub struct CasePartitioner {
    case_ids: Vec<String>,
}

impl CasePartitioner {
    pub fn new(case_ids: Vec<String>) -> Self {
        Self { case_ids }
    }
}

#[async_trait]
impl Partitioner for CasePartitioner {
    async fn partition(&self, _grid_size: usize) -> Result<Partitions> {
        Ok(self
            .case_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(|id| (case_key(id), PartitionWorkItem::for_case(id)))
            .collect())
    }
}

/// One partition per eligible material discovered for a case.
pub struct MaterialPartitioner {
    case_id: String,
    materials: BTreeMap<String, Material>,
}

impl MaterialPartitioner {
    pub fn new(case_id: &str, materials: BTreeMap<String, Material>) -> Self {
        Self {
            case_id: case_id.to_string(),
            materials,
        }
    }
}

#[async_trait]
impl Partitioner for MaterialPartitioner {
    async fn partition(&self, _grid_size: usize) -> Result<Partitions> {
        Ok(self
            .materials
            .iter()
            .map(|(material_id, material)| {
                (
                    format!("material-{}", material_id),
                    PartitionWorkItem {
                        case_id: self.case_id.clone(),
                        material_id: Some(material_id.clone()),
                        material_name: Some(material.name.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect())
    }
}

/// Partitions the documents that are ready for answer generation.
///
/// Reads the latest row per `(case, material)` whose phase is `INGESTED`,
/// optionally restricted to `case_filter`. Filter ids that are not valid
/// UUIDs are logged and dropped. When `query_ids` is non-empty, each
/// document yields one partition per query.
pub struct ReadyDocumentPartitioner {
    store: Arc<dyn DocumentStore>,
    case_filter: Option<Vec<String>>,
    query_ids: Vec<String>,
}

impl ReadyDocumentPartitioner {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            case_filter: None,
            query_ids: Vec::new(),
        }
    }

    pub fn with_case_filter(mut self, case_ids: Vec<String>) -> Self {
        self.case_filter = Some(case_ids);
        self
    }

    pub fn with_query_ids(mut self, query_ids: Vec<String>) -> Self {
        self.query_ids = query_ids;
        self
    }
}

/// Case ids are UUIDs in any accepted textual form.
pub fn is_valid_case_id(id: &str) -> bool {
    Uuid::parse_str(id.trim()).is_ok()
}

/// Keeps the ids that parse as UUIDs, warning about the rest.
///
/// Kept ids are only trimmed, never reformatted, so they still match the
/// `case_id` stored at ingestion.
pub fn valid_case_ids(ids: &[String]) -> Vec<String> {
    ids.iter()
        .filter_map(|raw| {
            let id = raw.trim();
            if is_valid_case_id(id) {
                Some(id.to_string())
            } else {
                tracing::warn!(case_id = %raw, "dropping unparseable case id from filter");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Partitioner for ReadyDocumentPartitioner {
    async fn partition(&self, _grid_size: usize) -> Result<Partitions> {
        let filter = self.case_filter.as_deref().map(valid_case_ids);
        if let Some(ref ids) = filter {
            if ids.is_empty() {
                return Ok(Partitions::new());
            }
        }

        let docs = self
            .store
            .latest_in_phase(IngestionPhase::Ingested, filter.as_deref())
            .await?;

        let mut out = Partitions::new();
        for doc in docs {
            let base = PartitionWorkItem {
                case_id: doc.case_id.clone(),
                material_id: Some(doc.material_id.clone()),
                material_name: Some(doc.doc_name.clone()),
                document_id: Some(doc.doc_id.clone()),
                query_id: None,
            };
            if self.query_ids.is_empty() {
                out.insert(format!("doc-{}", doc.doc_id), base);
                continue;
            }
            for query_id in &self.query_ids {
                out.insert(
                    format!("doc-{}-query-{}", doc.doc_id, query_id),
                    PartitionWorkItem {
                        query_id: Some(query_id.clone()),
                        ..base.clone()
                    },
                );
            }
        }
        tracing::debug!(partitions = out.len(), "ready documents partitioned");
        Ok(out)
    }
}
