//! SQLite-backed [`DocumentStore`] and [`VerificationQueue`].
//!
//! Timestamps are stored as Unix milliseconds. The verification claim is a
//! single `UPDATE ... WHERE id IN (SELECT ...) RETURNING` statement, so two
//! scheduler instances sharing the database never receive the same row.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use case_ingest_core::execution::{JobParameters, RunStatus};
use case_ingest_core::models::{
    Document, IngestionPhase, NewVerificationTask, VerificationStatus, VerificationTask,
};
use case_ingest_core::store::{DocumentStore, VerificationQueue};

use crate::traits::RunHandle;

/// SQLite implementation of the store traits.
///
/// Wraps a [`SqlitePool`] and translates every trait method into SQL
/// against the `documents`, `verification_tasks`, and `job_instances`
/// tables created by [`crate::migrate`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let phase: String = row.try_get("ingestion_phase")?;
    Ok(Document {
        doc_id: row.try_get("doc_id")?,
        case_id: row.try_get("case_id")?,
        material_id: row.try_get("material_id")?,
        source: row.try_get("source")?,
        doc_name: row.try_get("doc_name")?,
        blob_name: row.try_get("blob_name")?,
        blob_uri: row.try_get("blob_uri")?,
        content_type: row.try_get("content_type")?,
        size_bytes: row.try_get("size_bytes")?,
        checksum: row.try_get("checksum")?,
        ingestion_phase: phase.parse()?,
        ingestion_phase_at: from_ms(row.try_get("ingestion_phase_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<VerificationTask> {
    let status: String = row.try_get("status")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let last_status_ts: Option<i64> = row.try_get("last_status_ts")?;
    let lock_acquired_at: Option<i64> = row.try_get("lock_acquired_at")?;
    Ok(VerificationTask {
        id: row.try_get("id")?,
        doc_id: row.try_get("doc_id")?,
        case_id: row.try_get("case_id")?,
        blob_name: row.try_get("blob_name")?,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        status: status.parse()?,
        last_status: row.try_get("last_status")?,
        last_reason: row.try_get("last_reason")?,
        last_status_ts: last_status_ts.map(from_ms),
        next_attempt_at: from_ms(row.try_get("next_attempt_at")?),
        lock_owner: row.try_get("lock_owner")?,
        lock_acquired_at: lock_acquired_at.map(from_ms),
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn sort_tasks(tasks: &mut [VerificationTask]) {
    tasks.sort_by(|a, b| {
        a.next_attempt_at
            .cmp(&b.next_attempt_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, case_id, material_id, source, doc_name, blob_name,
                                   blob_uri, content_type, size_bytes, checksum,
                                   ingestion_phase, ingestion_phase_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                case_id = excluded.case_id,
                material_id = excluded.material_id,
                source = excluded.source,
                doc_name = excluded.doc_name,
                blob_name = excluded.blob_name,
                blob_uri = excluded.blob_uri,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                ingestion_phase = excluded.ingestion_phase,
                ingestion_phase_at = excluded.ingestion_phase_at
            "#,
        )
        .bind(&doc.doc_id)
        .bind(&doc.case_id)
        .bind(&doc.material_id)
        .bind(&doc.source)
        .bind(&doc.doc_name)
        .bind(&doc.blob_name)
        .bind(&doc.blob_uri)
        .bind(&doc.content_type)
        .bind(doc.size_bytes)
        .bind(&doc.checksum)
        .bind(doc.ingestion_phase.as_str())
        .bind(to_ms(doc.ingestion_phase_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_latest_in_phases(
        &self,
        case_id: &str,
        material_id: &str,
        phases: &[IngestionPhase],
    ) -> Result<Option<Document>> {
        if phases.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; phases.len()].join(", ");
        let sql = format!(
            "SELECT * FROM documents \
             WHERE case_id = ? AND material_id = ? AND ingestion_phase IN ({}) \
             ORDER BY ingestion_phase_at DESC, doc_id DESC LIMIT 1",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(case_id).bind(material_id);
        for phase in phases {
            query = query.bind(phase.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn set_phase(
        &self,
        doc_id: &str,
        phase: IngestionPhase,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT ingestion_phase FROM documents WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current: IngestionPhase = match current {
            Some(p) => p.parse()?,
            None => return Ok(false),
        };
        if current != phase && !current.can_transition_to(phase) {
            bail!(
                "document {} cannot move from {} to {}",
                doc_id,
                current,
                phase
            );
        }

        sqlx::query(
            "UPDATE documents SET ingestion_phase = ?, ingestion_phase_at = ? WHERE doc_id = ?",
        )
        .bind(phase.as_str())
        .bind(to_ms(at))
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn latest_in_phase(
        &self,
        phase: IngestionPhase,
        case_filter: Option<&[String]>,
    ) -> Result<Vec<Document>> {
        let filter_sql = match case_filter {
            Some(ids) if ids.is_empty() => return Ok(Vec::new()),
            Some(ids) => format!("WHERE case_id IN ({})", vec!["?"; ids.len()].join(", ")),
            None => String::new(),
        };
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT d.*, ROW_NUMBER() OVER (
                    PARTITION BY case_id, material_id
                    ORDER BY ingestion_phase_at DESC, doc_id DESC
                ) AS rn
                FROM documents d
                {}
            )
            WHERE rn = 1 AND ingestion_phase = ?
            ORDER BY case_id, material_id
            "#,
            filter_sql
        );

        let mut query = sqlx::query(&sql);
        if let Some(ids) = case_filter {
            for id in ids {
                query = query.bind(id);
            }
        }
        query = query.bind(phase.as_str());

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(document_from_row).collect()
    }
}

#[async_trait]
impl VerificationQueue for SqliteStore {
    async fn enqueue(&self, new: NewVerificationTask) -> Result<VerificationTask> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT * FROM verification_tasks \
             WHERE doc_id = ? AND status NOT IN ('SUCCEEDED', 'FAILED') LIMIT 1",
        )
        .bind(&new.doc_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            return task_from_row(&row);
        }

        let now = to_ms(Utc::now());
        let row = sqlx::query(
            r#"
            INSERT INTO verification_tasks (id, doc_id, case_id, blob_name, attempt_count,
                                            max_attempts, status, next_attempt_at,
                                            created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, 'PENDING', ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.doc_id)
        .bind(&new.case_id)
        .bind(&new.blob_name)
        .bind(new.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let task = task_from_row(&row)?;

        tx.commit().await?;
        Ok(task)
    }

    async fn claim(
        &self,
        owner: &str,
        batch_size: usize,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationTask>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_ms(now);
        let expired_before = to_ms(now - lock_ttl);

        let rows = sqlx::query(
            r#"
            UPDATE verification_tasks
            SET lock_owner = ?, lock_acquired_at = ?, status = 'IN_PROGRESS', updated_at = ?
            WHERE id IN (
                SELECT id FROM verification_tasks
                WHERE status NOT IN ('SUCCEEDED', 'FAILED')
                  AND next_attempt_at <= ?
                  AND (lock_owner IS NULL OR lock_acquired_at IS NULL OR lock_acquired_at <= ?)
                ORDER BY next_attempt_at, created_at, id
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(expired_before)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .context("claiming verification tasks")?;

        let mut tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>>>()?;
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn save(&self, tasks: &[VerificationTask]) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(tasks.len());

        for task in tasks {
            let result = sqlx::query(
                r#"
                UPDATE verification_tasks SET
                    attempt_count = ?,
                    max_attempts = ?,
                    status = ?,
                    last_status = ?,
                    last_reason = ?,
                    last_status_ts = ?,
                    next_attempt_at = ?,
                    lock_owner = NULL,
                    lock_acquired_at = NULL,
                    updated_at = ?
                WHERE id = ? AND lock_owner IS ?
                "#,
            )
            .bind(task.attempt_count as i64)
            .bind(task.max_attempts as i64)
            .bind(task.status.as_str())
            .bind(&task.last_status)
            .bind(&task.last_reason)
            .bind(task.last_status_ts.map(to_ms))
            .bind(to_ms(task.next_attempt_at))
            .bind(to_ms(task.updated_at))
            .bind(&task.id)
            .bind(&task.lock_owner)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                written.push(task.id.clone());
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn get(&self, id: &str) -> Result<Option<VerificationTask>> {
        let row = sqlx::query("SELECT * FROM verification_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list(&self, status: Option<VerificationStatus>) -> Result<Vec<VerificationTask>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM verification_tasks WHERE status = ? ORDER BY created_at, id",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM verification_tasks ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = to_ms(now);
        let result = sqlx::query(
            r#"
            UPDATE verification_tasks SET
                status = 'PENDING',
                attempt_count = 0,
                next_attempt_at = ?,
                lock_owner = NULL,
                lock_acquired_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'FAILED'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ─── Job instances ──────────────────────────────────────────────────

impl SqliteStore {
    /// Records a job instance unless one with the same name and identity
    /// key already exists. Returns the instance's handle and whether it was
    /// newly created.
    pub async fn create_job_instance(
        &self,
        job_name: &str,
        params: &JobParameters,
    ) -> Result<RunHandle> {
        let identity_key = params.identity_key();
        let now = to_ms(Utc::now());
        let run_id = Uuid::new_v4().to_string();
        let params_json = serde_json::to_string(params)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_instances (run_id, job_name, identity_key, parameters_json,
                                       status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_name, identity_key) DO NOTHING
            "#,
        )
        .bind(&run_id)
        .bind(job_name)
        .bind(&identity_key)
        .bind(&params_json)
        .bind(RunStatus::Starting.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            return Ok(RunHandle {
                run_id,
                job_name: job_name.to_string(),
                created: true,
            });
        }

        let existing: String = sqlx::query_scalar(
            "SELECT run_id FROM job_instances WHERE job_name = ? AND identity_key = ?",
        )
        .bind(job_name)
        .bind(&identity_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunHandle {
            run_id: existing,
            job_name: job_name.to_string(),
            created: false,
        })
    }

    pub async fn set_job_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE job_instances SET status = ?, error = ?, updated_at = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(to_ms(Utc::now()))
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn job_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_instances WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| s.parse()).transpose()
    }

    pub async fn job_instance_count(&self, job_name: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_instances WHERE job_name = ?")
            .bind(job_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
