//! OCR fallback for image-only edital documents.
//!
//! Defines the [`OcrProvider`] trait so the pipeline can swap the backend
//! (or a test fake) without touching the bundle resolver. The production
//! backend is Mistral's OCR API.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Per-page OCR output (always 1-indexed).
#[derive(Debug, Clone)]
pub struct OcrPage {
    pub page_num: u32,
    pub text: String,
}

/// Unified OCR result returned by every provider. `text` is the
/// page-ordered concatenation of per-page output.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub pages: Vec<OcrPage>,
    pub total_pages: u32,
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, filename: &str, data: &[u8]) -> anyhow::Result<OcrResult>;
}

// ── Mistral OCR backend ─────────────────────────────────────────────────────

pub struct MistralOcrProvider {
    api_key: String,
    client: reqwest::Client,
}

impl MistralOcrProvider {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client,
        }
    }

    /// Upload raw bytes to the Mistral Files API, return the file_id.
    async fn upload_file(&self, filename: &str, data: &[u8]) -> anyhow::Result<String> {
        use reqwest::multipart::{Form, Part};

        info!(
            "MistralOcrProvider: uploading {} ({} bytes) to Files API",
            filename,
            data.len()
        );

        let mime = if filename.to_lowercase().ends_with(".pdf") {
            "application/pdf"
        } else {
            "application/octet-stream"
        };

        let part = Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)?;

        let form = Form::new().part("file", part).text("purpose", "ocr");

        let resp = self
            .client
            .post("https://api.mistral.ai/v1/files")
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Mistral Files API error ({}): {}", status, text);
        }

        let upload: FileUploadResponse = resp.json().await?;
        debug!("MistralOcrProvider: uploaded file_id={}", upload.id);
        Ok(upload.id)
    }
}

#[derive(Serialize)]
struct OcrRequest {
    model: String,
    document: DocumentSource,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DocumentSource {
    #[serde(rename = "file")]
    File { file_id: String },
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<MistralPage>,
}

#[derive(Deserialize)]
struct MistralPage {
    index: u32,
    markdown: String,
}

#[derive(Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[async_trait::async_trait]
impl OcrProvider for MistralOcrProvider {
    fn name(&self) -> &str {
        "mistral_ocr"
    }

    async fn process(&self, filename: &str, data: &[u8]) -> anyhow::Result<OcrResult> {
        let file_id = self.upload_file(filename, data).await?;

        let body = OcrRequest {
            model: "mistral-ocr-latest".to_string(),
            document: DocumentSource::File { file_id },
        };

        info!("MistralOcrProvider: calling OCR API for {}", filename);

        let resp = self
            .client
            .post("https://api.mistral.ai/v1/ocr")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Mistral OCR API error ({}): {}", status, text);
        }

        let ocr: OcrResponse = resp.json().await?;
        let total_pages = ocr.pages.len() as u32;

        let mut pages: Vec<OcrPage> = ocr
            .pages
            .into_iter()
            .map(|p| OcrPage {
                page_num: p.index + 1, // Normalize 0-indexed → 1-indexed
                text: p.markdown,
            })
            .collect();
        pages.sort_by_key(|p| p.page_num);

        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(OcrResult {
            text,
            pages,
            total_pages,
        })
    }
}
