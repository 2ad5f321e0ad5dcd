//! Whole-document text for a locator: remote URL, `file://` URL or local path.
//! Network-facing callers restrict it to remote URLs with [`HttpDocumentSource::remote_only`].

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::error::{RagError, RagResult};

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> RagResult<String>;
}

/// Fetches documents over HTTP or from disk. PDF bodies go through the configured extraction service.
pub struct HttpDocumentSource {
    client: reqwest::Client,
    extractor_url: Option<String>,
    remote_only: bool,
}

/// Per-page output of the extraction service.
#[derive(Debug, Deserialize)]
pub struct ExtractedPage {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tables: Vec<Vec<Vec<Option<String>>>>,
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    pages: Vec<ExtractedPage>,
}

struct Body {
    bytes: Vec<u8>,
    is_pdf: bool,
}

impl HttpDocumentSource {
    pub fn new(config: &SourceConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Internal(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            extractor_url: config.extractor_url.clone().filter(|u| !u.trim().is_empty()),
            remote_only: false,
        })
    }

    /// Refuse anything but `http`/`https` locators. Used when locators come from network clients.
    pub fn remote_only(mut self) -> Self {
        self.remote_only = true;
        self
    }

    async fn download(&self, url: &str) -> RagResult<Body> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RagError::SourceFetch(format!("Failed to download {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RagError::SourceFetch(format!("Failed to download {url}: HTTP {status}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RagError::SourceFetch(format!("Failed to read body of {url}: {e}")))?
            .to_vec();
        let is_pdf = content_type.contains("application/pdf") || looks_like_pdf(url, &bytes);
        Ok(Body { bytes, is_pdf })
    }

    async fn read_local(&self, path: PathBuf) -> RagResult<Body> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RagError::SourceFetch(format!("Failed to read {}: {e}", path.display())))?;
        let is_pdf = looks_like_pdf(&path.to_string_lossy(), &bytes);
        Ok(Body { bytes, is_pdf })
    }

    async fn extract(&self, pdf: Vec<u8>) -> RagResult<String> {
        let url = self.extractor_url.as_deref().ok_or_else(|| {
            RagError::SourceFetch("PDF document but no source.extractor_url configured".into())
        })?;
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(pdf)
            .send()
            .await
            .map_err(|e| RagError::SourceFetch(format!("Extraction request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(RagError::SourceFetch(format!("Extraction service returned {}", resp.status())));
        }
        let parsed: ExtractionResponse = resp
            .json()
            .await
            .map_err(|e| RagError::SourceFetch(format!("Failed to parse extraction response: {e}")))?;
        tracing::debug!(pages = parsed.pages.len(), "PDF extracted");
        Ok(render_pages(&parsed.pages))
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, locator: &str) -> RagResult<String> {
        if self.remote_only && !is_remote_locator(locator) {
            tracing::warn!(locator, "Rejected non-remote document locator");
            return Err(RagError::InvalidLocator(locator.to_string()));
        }
        let body = match url::Url::parse(locator) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => self.download(locator).await?,
            Ok(u) if u.scheme() == "file" => {
                let path = u
                    .to_file_path()
                    .map_err(|_| RagError::SourceFetch(format!("Invalid file URL: {locator}")))?;
                self.read_local(path).await?
            }
            _ => self.read_local(PathBuf::from(locator)).await?,
        };

        if body.is_pdf {
            return self.extract(body.bytes).await;
        }
        String::from_utf8(body.bytes)
            .map_err(|_| RagError::SourceFetch(format!("{locator} is neither UTF-8 text nor PDF")))
    }
}

/// `http` or `https` URL.
pub fn is_remote_locator(locator: &str) -> bool {
    url::Url::parse(locator).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

fn looks_like_pdf(name: &str, bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF") || name.to_ascii_lowercase().split('?').next().unwrap_or("").ends_with(".pdf")
}

/// Page text and tables with `[PAGE n TEXT]` / `[PAGE n TABLE t]` markers, in page order.
pub fn render_pages(pages: &[ExtractedPage]) -> String {
    let mut parts = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let text = page.text.trim();
        if !text.is_empty() {
            parts.push(format!("\n[PAGE {} TEXT]\n{}", i + 1, text));
        }
        for (t, table) in page.tables.iter().enumerate() {
            let markdown = table_to_markdown(table);
            if !markdown.is_empty() {
                parts.push(format!("\n[PAGE {} TABLE {}]\n{}", i + 1, t + 1, markdown));
            }
        }
    }
    parts.join("\n")
}

/// Markdown table whose first row is the header. Empty cells render blank.
pub fn table_to_markdown(table: &[Vec<Option<String>>]) -> String {
    let Some(header) = table.first().filter(|h| !h.is_empty()) else {
        return String::new();
    };
    let row = |cells: &[Option<String>]| {
        let cells: Vec<&str> = cells.iter().map(|c| c.as_deref().unwrap_or("").trim()).collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = vec![row(header), format!("| {} |", vec!["---"; header.len()].join(" | "))];
    lines.extend(table[1..].iter().map(|r| row(r)));
    lines.join("\n")
}
