//! Case ingestion job.
//!
//! Discovers the materials of each requested case, resolves every material
//! to a stable document id, and pushes new documents through upload into
//! the verification queue:
//!
//! ```text
//! caseIds ─▶ CasePartitioner ─▶ fan-out: MaterialSource ─▶ MaterialPartitioner
//!        ─▶ aggregate_materials (IdentityResolver)
//!        ─▶ per new document:
//!             WAITING_FOR_UPLOAD ─▶ UPLOADING ─▶ upload ─▶ UPLOADED ─▶ enqueue
//! ```
//!
//! Materials that already map to a document in a claimed phase keep that
//! document, so re-running the job for the same cases never uploads twice.
//! A reused document still `WAITING_FOR_UPLOAD` is uploaded, and one left
//! `UPLOADED` is enqueued again (a no-op while its task is open).
//!
//! Case ids must be UUIDs; anything else fails the run permanently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use case_ingest_core::aggregate::aggregate_materials;
use case_ingest_core::execution::{ExecutionRecord, PARAM_CASE_IDS};
use case_ingest_core::identity::IdentityResolver;
use case_ingest_core::models::{
    Document, IngestionPhase, Material, MaterialDocumentMapping, NewVerificationTask,
    PartitionResult,
};
use case_ingest_core::partition::{
    is_valid_case_id, CasePartitioner, MaterialPartitioner, Partitioner,
};
use case_ingest_core::store::{DocumentStore, VerificationQueue};

use crate::config::Config;
use crate::fanout::run_partitions;
use crate::retry::permanent;
use crate::traits::{BlobUploader, MaterialSource, Task};

pub const CASE_INGESTION_JOB: &str = "case_ingestion";

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub concurrency: usize,
    pub grid_size: usize,
    /// Source tag written on new documents.
    pub source: String,
    /// `max_attempts` given to each verification task.
    pub verification_max_attempts: u32,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.pipeline.concurrency,
            grid_size: config.pipeline.grid_size,
            source: config.pipeline.source.clone(),
            verification_max_attempts: config.verification.max_attempts,
        }
    }
}

/// Counters returned as the job's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub cases: usize,
    pub failed_cases: usize,
    pub materials: usize,
    pub reused: usize,
    /// Reused documents whose upload or enqueue was finished by this run.
    pub resumed: usize,
    pub uploaded: usize,
    pub failed_uploads: usize,
}

pub struct CaseIngestionTask {
    documents: Arc<dyn DocumentStore>,
    queue: Arc<dyn VerificationQueue>,
    materials: Arc<dyn MaterialSource>,
    uploader: Arc<dyn BlobUploader>,
    settings: IngestSettings,
}

impl CaseIngestionTask {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        queue: Arc<dyn VerificationQueue>,
        materials: Arc<dyn MaterialSource>,
        uploader: Arc<dyn BlobUploader>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            documents,
            queue,
            materials,
            uploader,
            settings,
        }
    }

    /// Fetches materials per case in parallel and flattens them into
    /// partition results plus a lookup of the full material records.
    async fn discover(
        &self,
        case_ids: Vec<String>,
        report: &mut IngestReport,
    ) -> Result<(Vec<PartitionResult>, HashMap<(String, String), Material>)> {
        let partitions = CasePartitioner::new(case_ids)
            .partition(self.settings.grid_size)
            .await?;
        report.cases = partitions.len();

        let source = self.materials.clone();
        let fetched = run_partitions(partitions, self.settings.concurrency, move |_key, item| {
            let source = source.clone();
            async move {
                let materials = source.materials_for_case(&item.case_id).await?;
                Ok((item.case_id, materials))
            }
        })
        .await;

        let mut results = Vec::new();
        let mut lookup = HashMap::new();
        for (_key, outcome) in fetched {
            let (case_id, materials) = match outcome {
                Ok(found) => found,
                Err(_) => {
                    report.failed_cases += 1;
                    continue;
                }
            };
            let by_id: BTreeMap<String, Material> = materials
                .into_iter()
                .map(|m| (m.material_id.clone(), m))
                .collect();
            let items = MaterialPartitioner::new(&case_id, by_id.clone())
                .partition(self.settings.grid_size)
                .await?;
            for item in items.into_values() {
                results.push(PartitionResult {
                    case_id: Some(item.case_id),
                    material_id: item.material_id,
                    material_name: item.material_name,
                });
            }
            for (material_id, material) in by_id {
                lookup.insert((case_id.clone(), material_id), material);
            }
        }
        Ok((results, lookup))
    }

    /// Creates, uploads, and enqueues one new document.
    async fn upload_new(&self, mapping: &MaterialDocumentMapping, material: &Material) -> Result<()> {
        let doc = Document::waiting_for_upload(
            &mapping.resolved_doc_id,
            &mapping.case_id,
            &mapping.material_id,
            &self.settings.source,
            &mapping.material_name,
            Utc::now(),
        );
        self.documents.upsert_document(&doc).await?;
        self.upload(doc, material).await
    }

    /// Moves a `WAITING_FOR_UPLOAD` document through upload into the queue.
    async fn upload(&self, mut doc: Document, material: &Material) -> Result<()> {
        self.documents
            .set_phase(&doc.doc_id, IngestionPhase::Uploading, Utc::now())
            .await?;

        let blob = match self.uploader.upload(&doc, material).await {
            Ok(blob) => blob,
            Err(e) => {
                self.documents
                    .set_phase(&doc.doc_id, IngestionPhase::Failed, Utc::now())
                    .await?;
                return Err(e);
            }
        };

        doc.blob_name = Some(blob.blob_name);
        doc.blob_uri = Some(blob.blob_uri);
        doc.content_type = blob.content_type;
        doc.size_bytes = blob.size_bytes;
        doc.checksum = blob.checksum;
        doc.ingestion_phase = IngestionPhase::Uploaded;
        doc.ingestion_phase_at = Utc::now();
        self.documents.upsert_document(&doc).await?;
        self.enqueue(&doc).await
    }

    /// Enqueues verification for an uploaded document. Returns the open
    /// task when one already exists.
    async fn enqueue(&self, doc: &Document) -> Result<()> {
        let blob_name = doc
            .blob_name
            .clone()
            .ok_or_else(|| anyhow!("document {} has no blob name", doc.doc_id))?;
        let task = self
            .queue
            .enqueue(NewVerificationTask {
                doc_id: doc.doc_id.clone(),
                case_id: doc.case_id.clone(),
                blob_name,
                max_attempts: self.settings.verification_max_attempts,
            })
            .await?;
        tracing::info!(
            doc_id = %doc.doc_id,
            case_id = %doc.case_id,
            task_id = %task.id,
            "document uploaded, awaiting ingestion"
        );
        Ok(())
    }

    /// Finishes whatever an interrupted earlier run left undone for a
    /// reused document.
    async fn resume(
        &self,
        mapping: &MaterialDocumentMapping,
        material: Option<&Material>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let Some(doc) = self.documents.get_document(&mapping.resolved_doc_id).await? else {
            return Ok(());
        };
        match doc.ingestion_phase {
            IngestionPhase::Uploaded if doc.blob_name.is_some() => {
                self.enqueue(&doc).await?;
                report.resumed += 1;
            }
            IngestionPhase::WaitingForUpload => {
                let Some(material) = material else {
                    return Ok(());
                };
                tracing::info!(doc_id = %doc.doc_id, "resuming upload of reused document");
                report.resumed += 1;
                match self.upload(doc, material).await {
                    Ok(()) => report.uploaded += 1,
                    Err(e) => {
                        report.failed_uploads += 1;
                        tracing::warn!(
                            case_id = %mapping.case_id,
                            material_id = %mapping.material_id,
                            error = %format!("{:#}", e),
                            "upload failed"
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Task for CaseIngestionTask {
    fn name(&self) -> &str {
        CASE_INGESTION_JOB
    }

    async fn execute(&self, record: &ExecutionRecord) -> Result<Value> {
        let case_ids = record.parameters.list(PARAM_CASE_IDS);
        if case_ids.is_empty() {
            return Err(permanent(format!("{} parameter is required", PARAM_CASE_IDS)));
        }
        let invalid: Vec<&str> = case_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !is_valid_case_id(id))
            .collect();
        if !invalid.is_empty() {
            return Err(permanent(format!(
                "case ids must be UUIDs: {}",
                invalid.join(", ")
            )));
        }

        let mut report = IngestReport::default();
        let (results, lookup) = self.discover(case_ids, &mut report).await?;
        if report.cases > 0 && report.failed_cases == report.cases {
            bail!("material discovery failed for all {} cases", report.cases);
        }

        let resolver = IdentityResolver::new(self.documents.clone());
        let mappings = aggregate_materials(&results, &resolver).await?;
        report.materials = mappings.len();

        for mapping in mappings.values() {
            let key = (mapping.case_id.clone(), mapping.material_id.clone());
            let material = lookup.get(&key);
            if mapping.is_reused() {
                report.reused += 1;
                self.resume(mapping, material, &mut report).await?;
                continue;
            }
            let Some(material) = material else {
                continue;
            };
            match self.upload_new(mapping, material).await {
                Ok(()) => report.uploaded += 1,
                Err(e) => {
                    report.failed_uploads += 1;
                    tracing::warn!(
                        case_id = %mapping.case_id,
                        material_id = %mapping.material_id,
                        error = %format!("{:#}", e),
                        "upload failed"
                    );
                }
            }
        }

        let attempted = report.uploaded + report.failed_uploads;
        if attempted > 0 && report.uploaded == 0 {
            bail!("all {} uploads failed", attempted);
        }

        tracing::info!(
            run_id = %record.run_id,
            cases = report.cases,
            materials = report.materials,
            reused = report.reused,
            resumed = report.resumed,
            uploaded = report.uploaded,
            "case ingestion finished"
        );
        Ok(serde_json::to_value(&report)?)
    }
}
