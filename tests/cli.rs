use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use case_ingest::config::load_config;
use case_ingest::sqlite_store::SqliteStore;
use case_ingest::{db, migrate};
use case_ingest_core::models::{NewVerificationTask, VerificationStatus};
use case_ingest_core::store::VerificationQueue;

fn caseingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("caseingest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/cases.sqlite"

[verification]
lock_ttl_ms = 60000
trigger_answer_job_on_success = false

[services]
ingestion_status_url = "http://127.0.0.1:9"
timeout_secs = 1
"#,
        root.display()
    );

    let config_path = config_dir.join("cases.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_caseingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = caseingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run caseingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Enqueues a task and drives it to FAILED through the queue API.
async fn seed_failed_task(config_path: &Path) -> String {
    let config = load_config(config_path).unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = SqliteStore::new(pool);

    store
        .enqueue(NewVerificationTask {
            doc_id: "doc-1".to_string(),
            case_id: "case-1".to_string(),
            blob_name: "doc-1.pdf".to_string(),
            max_attempts: 1,
        })
        .await
        .unwrap();
    let now = chrono::Utc::now();
    let mut claimed = store
        .claim("seeder", 1, chrono::Duration::seconds(60), now)
        .await
        .unwrap();
    claimed[0].record_failed_attempt("no ingestion status yet", now);
    claimed[0].record_failed_attempt("no ingestion status yet", now);
    assert_eq!(claimed[0].status, VerificationStatus::Failed);
    store.save(&claimed).await.unwrap();
    let id = claimed[0].id.clone();
    store.pool().close().await;
    id
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_caseingest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/cases.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_caseingest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_caseingest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_lock_ttl_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("cases.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/cases.sqlite\"\n\n[verification]\nenabled = true\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_caseingest(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("lock_ttl_ms"), "stderr={}", stderr);
}

#[test]
fn test_tasks_empty_queue() {
    let (_tmp, config_path) = setup_test_env();
    run_caseingest(&config_path, &["init"]);

    let (stdout, stderr, success) = run_caseingest(&config_path, &["tasks"]);
    assert!(success, "tasks failed: stderr={}", stderr);
    assert!(stdout.contains("No verification tasks."));
}

#[test]
fn test_tasks_rejects_unknown_status() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_caseingest(&config_path, &["tasks", "--status", "sleeping"]);
    assert!(!success);
    assert!(stderr.contains("unknown verification status"));
}

#[tokio::test]
async fn test_requeue_failed_task() {
    let (_tmp, config_path) = setup_test_env();
    let task_id = seed_failed_task(&config_path).await;

    let (stdout, _, success) = run_caseingest(&config_path, &["tasks", "--status", "failed"]);
    assert!(success);
    assert!(stdout.contains(&task_id));
    assert!(stdout.contains("no ingestion status yet"));

    let (stdout, stderr, success) = run_caseingest(&config_path, &["requeue", &task_id]);
    assert!(success, "requeue failed: stderr={}", stderr);
    assert!(stdout.contains("Requeued"));

    let (stdout, _, _) = run_caseingest(&config_path, &["tasks", "--status", "pending"]);
    assert!(stdout.contains(&task_id));

    // Only FAILED tasks can be requeued.
    let (_, _, again) = run_caseingest(&config_path, &["requeue", &task_id]);
    assert!(!again);
}

#[test]
fn test_requeue_unknown_task_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_caseingest(&config_path, &["requeue", "no-such-task"]);
    assert!(!success);
    assert!(stderr.contains("not found or not FAILED"));
}

#[test]
fn test_verify_once_with_empty_queue() {
    let (_tmp, config_path) = setup_test_env();
    run_caseingest(&config_path, &["init"]);

    let (stdout, stderr, success) = run_caseingest(&config_path, &["verify", "once"]);
    assert!(success, "verify failed: stderr={}", stderr);
    assert!(stdout.contains("claimed:   0"));
}

#[test]
fn test_verify_requires_answers_service_when_triggering() {
    let (_tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("trigger_answer_job_on_success = false", "trigger_answer_job_on_success = true");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_caseingest(&config_path, &["verify", "once"]);
    assert!(!success);
    assert!(stderr.contains("answers_url"));
}

#[test]
fn test_ingest_requires_services() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_caseingest(&config_path, &["ingest", "case-1"]);
    assert!(!success);
    assert!(stderr.contains("services.materials_url"));
}

#[test]
fn test_ingest_rejects_non_uuid_case_ids() {
    let (tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path).unwrap().replace(
        "timeout_secs = 1",
        "timeout_secs = 1\nmaterials_url = \"http://127.0.0.1:9\"\nstorage_url = \"http://127.0.0.1:9\"",
    );
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_caseingest(&config_path, &["ingest", "case-1"]);
    assert!(!success);
    assert!(stderr.contains("case ids must be UUIDs: case-1"), "stderr={}", stderr);
    assert!(!tmp.path().join("data/cases.sqlite").exists());
}

#[test]
fn test_ready_with_no_documents() {
    let (_tmp, config_path) = setup_test_env();
    run_caseingest(&config_path, &["init"]);

    let (stdout, _, success) = run_caseingest(
        &config_path,
        &["ready", "--case", "6f1c2a34-0b7e-4d1a-9a55-2f6de1c0a001"],
    );
    assert!(success);
    assert!(stdout.contains("No ready documents."));
}
