//! Read-only web locations: `http://…` and `https://…`.
//!
//! Existence is a HEAD request; any failure to get a success status (network
//! error included) reads as "does not exist". Reads stream the GET body into
//! the staged file. Nothing can be written.

use super::{PathParts, StorageBackend};
use crate::error::DerivationError;
use crate::uri::LocationUri;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpBackend {
    pub fn new(timeout_secs: u64) -> Result<Self, DerivationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| DerivationError::Http {
                url: String::new(),
                reason: format!("client construction failed: {e}"),
            })?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }

    fn request_error(&self, url: &str, e: reqwest::Error) -> DerivationError {
        let reason = if e.is_timeout() {
            format!("timed out after {}s", self.timeout_secs)
        } else {
            e.to_string()
        };
        DerivationError::Http {
            url: url.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl StorageBackend for HttpBackend {
    fn schemes(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    /// Host and path, e.g. `example.com/docs/a.pdf`.
    fn key(&self, uri: &LocationUri) -> Result<String, DerivationError> {
        Ok(uri.path().to_string())
    }

    fn create_uri(&self, path: &str, parts: PathParts) -> Result<String, DerivationError> {
        Ok(format!(
            "https://{}",
            parts.take(path).trim_start_matches('/')
        ))
    }

    async fn exists(&self, uri: &LocationUri) -> Result<bool, DerivationError> {
        match self.client.head(uri.as_str()).send().await {
            Ok(resp) => {
                debug!(url = %uri, status = %resp.status(), "HEAD");
                Ok(resp.status().is_success())
            }
            Err(e) => {
                warn!(url = %uri, error = %e, "HEAD failed, treating as absent");
                Ok(false)
            }
        }
    }

    async fn fetch(&self, uri: &LocationUri, dest: &Path) -> Result<(), DerivationError> {
        info!(url = %uri, "Downloading");
        let url = uri.as_str();
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(url, e))?;

        if !response.status().is_success() {
            return Err(DerivationError::RemoteMissing {
                uri: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| DerivationError::io(dest, e))?;
        let mut written = 0usize;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.request_error(url, e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| DerivationError::io(dest, e))?;
            written += chunk.len();
        }
        file.flush().await.map_err(|e| DerivationError::io(dest, e))?;
        debug!(url, bytes = written, path = %dest.display(), "Downloaded");
        Ok(())
    }

    async fn store(&self, uri: &LocationUri, _src: &Path) -> Result<(), DerivationError> {
        Err(DerivationError::ReadOnlyLocation {
            uri: uri.to_string(),
        })
    }

    async fn list_matching(
        &self,
        _uri: &LocationUri,
        _pattern: &str,
    ) -> Result<Vec<LocationUri>, DerivationError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpBackend {
        HttpBackend::new(5).unwrap()
    }

    #[test]
    fn key_and_create_uri() {
        let b = backend();
        let uri = LocationUri::parse("https://example.com/docs/a.pdf").unwrap();
        assert_eq!(b.key(&uri).unwrap(), "example.com/docs/a.pdf");
        assert_eq!(
            b.create_uri("example.com/docs/a.pdf", PathParts::All).unwrap(),
            "https://example.com/docs/a.pdf"
        );
    }

    #[tokio::test]
    async fn writes_are_refused() {
        let uri = LocationUri::parse("https://example.com/a.hocr").unwrap();
        let err = backend().store(&uri, Path::new("/tmp/a.hocr")).await.unwrap_err();
        assert!(matches!(err, DerivationError::ReadOnlyLocation { .. }));
    }

    #[tokio::test]
    async fn nothing_to_list() {
        let uri = LocationUri::parse("https://example.com/a.pdf").unwrap();
        assert!(backend().list_matching(&uri, "*").await.unwrap().is_empty());
    }
}
