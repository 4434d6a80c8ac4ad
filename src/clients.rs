//! HTTP implementations of the collaborator traits.
//!
//! Each client is a thin JSON wrapper over `reqwest` with a per-request
//! timeout taken from `[services]`. Retrying is left to the caller: the
//! scheduler counts failed checks itself, and jobs run under
//! [`Retrying`](crate::retry::Retrying).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use case_ingest_core::models::{Document, IngestionStatus, Material};

use crate::config::ServicesConfig;
use crate::retry::permanent;
use crate::traits::{AnswerGenerator, BlobUploader, IngestionStatusChecker, MaterialSource, UploadedBlob};

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn require_url(value: &Option<String>, key: &str) -> Result<String> {
    value
        .as_ref()
        .map(|u| u.trim_end_matches('/').to_string())
        .ok_or_else(|| anyhow!("services.{} must be set", key))
}

/// Maps a non-success response to an error. 4xx responses other than 429
/// are [`Permanent`](crate::retry::Permanent).
async fn error_for(response: reqwest::Response, what: &str) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        permanent(format!("{} failed with {}: {}", what, status, body))
    } else {
        anyhow!("{} failed with {}: {}", what, status, body)
    }
}

// ─── Ingestion status ───────────────────────────────────────────────

/// `GET {base}/ingestion/status?blob=<name>`; 404 means "no status yet".
pub struct HttpStatusChecker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusChecker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(services: &ServicesConfig, timeout: Duration) -> Result<Self> {
        let url = require_url(&services.ingestion_status_url, "ingestion_status_url")?;
        Self::new(&url, timeout)
    }
}

#[async_trait]
impl IngestionStatusChecker for HttpStatusChecker {
    async fn check(&self, blob_name: &str) -> Result<Option<IngestionStatus>> {
        let response = self
            .client
            .get(format!("{}/ingestion/status", self.base_url))
            .query(&[("blob", blob_name)])
            .send()
            .await
            .with_context(|| format!("status request for {}", blob_name))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response, "status check").await);
        }
        let status: IngestionStatus = response.json().await?;
        Ok(Some(status))
    }
}

// ─── Materials ──────────────────────────────────────────────────────

/// `GET {base}/cases/{caseId}/materials` returning a JSON array.
pub struct HttpMaterialSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMaterialSource {
    pub fn from_config(services: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(services.timeout_secs))?,
            base_url: require_url(&services.materials_url, "materials_url")?,
        })
    }
}

#[async_trait]
impl MaterialSource for HttpMaterialSource {
    async fn materials_for_case(&self, case_id: &str) -> Result<Vec<Material>> {
        let response = self
            .client
            .get(format!("{}/cases/{}/materials", self.base_url, case_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(error_for(response, "materials lookup").await);
        }
        Ok(response.json().await?)
    }
}

// ─── Storage ────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    blob_name: String,
    blob_uri: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size_bytes: Option<i64>,
    #[serde(default)]
    checksum: Option<String>,
}

/// `POST {base}/blobs` asking storage to copy a material under the
/// document's id.
pub struct HttpBlobUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobUploader {
    pub fn from_config(services: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(services.timeout_secs))?,
            base_url: require_url(&services.storage_url, "storage_url")?,
        })
    }
}

#[async_trait]
impl BlobUploader for HttpBlobUploader {
    async fn upload(&self, doc: &Document, material: &Material) -> Result<UploadedBlob> {
        let source_uri = match material.source_uri.as_deref() {
            Some(uri) => uri,
            None => {
                return Err(permanent(format!(
                    "material {} has no source uri",
                    material.material_id
                )))
            }
        };
        let body = serde_json::json!({
            "docId": doc.doc_id,
            "caseId": doc.case_id,
            "materialId": material.material_id,
            "sourceUri": source_uri,
            "contentType": material.content_type,
        });
        let response = self
            .client
            .post(format!("{}/blobs", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, "blob upload").await);
        }
        let uploaded: UploadResponse = response.json().await?;
        Ok(UploadedBlob {
            blob_name: uploaded.blob_name,
            blob_uri: uploaded.blob_uri,
            content_type: uploaded.content_type.or_else(|| material.content_type.clone()),
            size_bytes: uploaded.size_bytes,
            checksum: uploaded.checksum,
        })
    }
}

// ─── Answers ────────────────────────────────────────────────────────

/// `POST {base}/answers` with `{caseId, docId, queryId}`.
pub struct HttpAnswerGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnswerGenerator {
    pub fn from_config(services: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(services.timeout_secs))?,
            base_url: require_url(&services.answers_url, "answers_url")?,
        })
    }
}

#[async_trait]
impl AnswerGenerator for HttpAnswerGenerator {
    async fn generate(&self, case_id: &str, doc_id: &str, query_id: Option<&str>) -> Result<()> {
        let body = serde_json::json!({
            "caseId": case_id,
            "docId": doc_id,
            "queryId": query_id,
        });
        let response = self
            .client
            .post(format!("{}/answers", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response, "answer generation").await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::is_recoverable;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serves one canned response and yields the raw request it received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });
        (format!("http://{}", addr), handle)
    }

    fn checker(base: &str) -> HttpStatusChecker {
        HttpStatusChecker::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn status_not_found_means_no_status_yet() {
        let (base, server) = serve_once("404 Not Found", "").await;
        let status = checker(&base).check("doc-1.pdf").await.unwrap();
        assert!(status.is_none());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /ingestion/status?blob=doc-1.pdf "));
    }

    #[tokio::test]
    async fn status_body_is_parsed_from_camel_case() {
        let (base, _server) = serve_once(
            "200 OK",
            r#"{"status":"INGESTION_SUCCESS","lastUpdated":"2024-05-01T10:00:00Z"}"#,
        )
        .await;
        let status = checker(&base).check("doc-1.pdf").await.unwrap().unwrap();
        assert!(status.is_success());
        assert_eq!(status.last_updated.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let (base, _server) = serve_once("400 Bad Request", r#"{"error":"bad blob"}"#).await;
        let err = checker(&base).check("doc-1.pdf").await.unwrap_err();
        assert!(!is_recoverable(&err));
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_recoverable() {
        let (base, _server) = serve_once("503 Service Unavailable", "").await;
        let err = checker(&base).check("doc-1.pdf").await.unwrap_err();
        assert!(is_recoverable(&err));

        let (base, _server) = serve_once("429 Too Many Requests", "").await;
        let err = checker(&base).check("doc-1.pdf").await.unwrap_err();
        assert!(is_recoverable(&err));
    }

    #[tokio::test]
    async fn upload_response_fills_blob_fields() {
        let (base, server) = serve_once(
            "201 Created",
            r#"{"blobName":"doc-1.pdf","blobUri":"blob://docs/doc-1.pdf","sizeBytes":2048}"#,
        )
        .await;
        let services = ServicesConfig {
            storage_url: Some(base),
            ..Default::default()
        };
        let uploader = HttpBlobUploader::from_config(&services).unwrap();
        let doc = Document::waiting_for_upload("doc-1", "case", "m1", "progression", "m1", chrono::Utc::now());
        let material = Material {
            material_id: "m1".to_string(),
            name: "m1.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            source_uri: Some("source://m1".to_string()),
        };

        let blob = uploader.upload(&doc, &material).await.unwrap();
        assert_eq!(blob.blob_name, "doc-1.pdf");
        assert_eq!(blob.size_bytes, Some(2048));
        assert_eq!(blob.content_type.as_deref(), Some("application/pdf"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /blobs "));
        assert!(request.contains(r#""docId":"doc-1""#));
    }

    #[test]
    fn missing_url_is_reported_by_key() {
        let services = ServicesConfig::default();
        let err = HttpMaterialSource::from_config(&services).err().unwrap();
        assert!(err.to_string().contains("services.materials_url"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let url = require_url(&Some("http://status.local/".to_string()), "x").unwrap();
        assert_eq!(url, "http://status.local");
    }
}
