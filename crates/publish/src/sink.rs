//! File and HTTP sinks

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Errors raised by a sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// How a file sink writes its target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Write a temporary file next to the target and rename it over
    #[default]
    Replace,
    /// Append to the target
    Append,
}

/// Writes bodies to a local file
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    mode: WriteMode,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one body
    ///
    /// In replace mode readers see either the old or the new content, never
    /// a partial file.
    pub fn write(&self, body: &[u8]) -> Result<(), SinkError> {
        match self.mode {
            WriteMode::Replace => {
                let dir = match self.path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                let mut tmp =
                    NamedTempFile::new_in(dir).map_err(|e| SinkError::io(&self.path, e))?;
                tmp.write_all(body)
                    .and_then(|_| tmp.as_file().sync_all())
                    .map_err(|e| SinkError::io(&self.path, e))?;
                tmp.persist(&self.path)
                    .map_err(|e| SinkError::io(&self.path, e.error))?;
            }
            WriteMode::Append => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| SinkError::io(&self.path, e))?;
                file.write_all(body)
                    .map_err(|e| SinkError::io(&self.path, e))?;
            }
        }
        debug!(path = %self.path.display(), bytes = body.len(), mode = ?self.mode, "Wrote file");
        Ok(())
    }
}

/// HTTP method used by an HTTP sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Put,
    Post,
}

/// Sends bodies to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    method: HttpMethod,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            method,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one body with the given content type
    pub async fn send(&self, mime: &str, body: Vec<u8>) -> Result<(), SinkError> {
        self.send_to(&self.url, mime, body).await
    }

    /// Send one body to `url` instead of the configured URL
    ///
    /// Reuses the sink's client, so connections are pooled across items.
    #[instrument(skip(self, body), fields(method = ?self.method))]
    pub async fn send_to(&self, url: &str, mime: &str, body: Vec<u8>) -> Result<(), SinkError> {
        let request = match self.method {
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Post => self.client.post(url),
        };
        let response = request
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(status = status.as_u16(), "Delivered");
        Ok(())
    }
}
