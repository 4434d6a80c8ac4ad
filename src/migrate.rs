use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            source TEXT NOT NULL,
            doc_name TEXT NOT NULL,
            blob_name TEXT,
            blob_uri TEXT,
            content_type TEXT,
            size_bytes INTEGER,
            checksum TEXT,
            ingestion_phase TEXT NOT NULL,
            ingestion_phase_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before documents carried their blob name
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('documents')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "blob_name") {
        sqlx::query("ALTER TABLE documents ADD COLUMN blob_name TEXT")
            .execute(pool)
            .await?;
    }

    // Create verification task queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verification_tasks (
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            case_id TEXT NOT NULL,
            blob_name TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            last_status TEXT,
            last_reason TEXT,
            last_status_ts INTEGER,
            next_attempt_at INTEGER NOT NULL,
            lock_owner TEXT,
            lock_acquired_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job instances table (one row per distinct identifying parameter set)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_instances (
            run_id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            identity_key TEXT NOT NULL,
            parameters_json TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(job_name, identity_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_case_material ON documents(case_id, material_id, ingestion_phase_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_phase ON documents(ingestion_phase)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_verification_claim ON verification_tasks(status, next_attempt_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_verification_doc ON verification_tasks(doc_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
