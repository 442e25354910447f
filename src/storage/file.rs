//! Local disk: `file:///absolute/path`.

use super::{glob, PathParts, StorageBackend};
use crate::error::DerivationError;
use crate::uri::LocationUri;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Default, Clone)]
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &LocationUri) -> PathBuf {
        PathBuf::from(uri.path())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn schemes(&self) -> &'static [&'static str] {
        &["file"]
    }

    fn key(&self, uri: &LocationUri) -> Result<String, DerivationError> {
        Ok(uri.path().to_string())
    }

    fn create_uri(&self, path: &str, parts: PathParts) -> Result<String, DerivationError> {
        let kept = parts.take(path);
        if matches!(parts, PathParts::Last(_)) && !kept.starts_with('/') {
            return Ok(format!("file:///{kept}"));
        }
        Ok(format!("file://{kept}"))
    }

    async fn exists(&self, uri: &LocationUri) -> Result<bool, DerivationError> {
        let path = Self::path_of(uri);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| DerivationError::io(path, e))
    }

    async fn fetch(&self, uri: &LocationUri, dest: &Path) -> Result<(), DerivationError> {
        let path = Self::path_of(uri);
        tokio::fs::copy(&path, dest).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DerivationError::MissingSource {
                    uri: uri.to_string(),
                }
            } else {
                DerivationError::io(&path, e)
            }
        })?;
        Ok(())
    }

    async fn store(&self, uri: &LocationUri, src: &Path) -> Result<(), DerivationError> {
        let path = Self::path_of(uri);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DerivationError::io(parent, e))?;
        }
        let bytes = tokio::fs::copy(src, &path)
            .await
            .map_err(|e| DerivationError::io(&path, e))?;
        debug!(uri = %uri, bytes, "Stored file");
        Ok(())
    }

    async fn list_matching(
        &self,
        uri: &LocationUri,
        pattern: &str,
    ) -> Result<Vec<LocationUri>, DerivationError> {
        let full = format!(
            "{}/{}",
            glob::escape(uri.directory()),
            pattern.trim_start_matches('/')
        );
        let root = match glob::literal_directory(&full) {
            dir if dir.is_empty() => "/".to_string(),
            dir => dir,
        };
        let matcher = glob::to_regex(&full);
        let max_depth = glob::max_depth(&full).unwrap_or(usize::MAX);

        // The walk is blocking; keep it off the runtime threads.
        let found = tokio::task::spawn_blocking(move || {
            let mut found: Vec<String> = WalkDir::new(&root)
                .max_depth(max_depth)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| entry.path().to_str().map(str::to_string))
                .filter(|path| matcher.is_match(path))
                .collect();
            found.sort();
            found
        })
        .await
        .map_err(|e| DerivationError::Internal(format!("directory walk panicked: {e}")))?;

        debug!(pattern = %full, matches = found.len(), "Listed local files");
        found
            .into_iter()
            .map(|path| LocationUri::parse(format!("file://{path}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &Path) -> LocationUri {
        LocationUri::parse(format!("file://{}", path.display())).unwrap()
    }

    #[tokio::test]
    async fn exists_fetch_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new();
        let src = dir.path().join("a.tiff");
        std::fs::write(&src, b"tiff").unwrap();

        assert!(backend.exists(&uri(&src)).await.unwrap());
        assert!(!backend.exists(&uri(&dir.path().join("b.tiff"))).await.unwrap());

        let fetched = dir.path().join("fetched");
        backend.fetch(&uri(&src), &fetched).await.unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"tiff");

        let nested = dir.path().join("x/y/a.tiff");
        backend.store(&uri(&nested), &src).await.unwrap();
        assert_eq!(std::fs::read(&nested).unwrap(), b"tiff");
    }

    #[tokio::test]
    async fn fetch_missing_is_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBackend::new()
            .fetch(&uri(&dir.path().join("gone.pdf")), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn list_matching_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a--page-1.tiff", "a--page-2.tiff", "b--page-1.tiff", "a.pdf"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a--page-3.tiff"), b"x").unwrap();

        let backend = FileBackend::new();
        let anchor = uri(&dir.path().join("a.tiff"));
        let found = backend.list_matching(&anchor, "a--page-*.tiff").await.unwrap();
        let names: Vec<&str> = found.iter().map(|u| u.file_name()).collect();
        assert_eq!(names, vec!["a--page-1.tiff", "a--page-2.tiff"]);

        let deep = backend.list_matching(&anchor, "**/a--page-*.tiff").await.unwrap();
        assert_eq!(deep.len(), 3);

        let none = backend.list_matching(&anchor, "c--page-*.tiff").await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn create_uri_variants() {
        let backend = FileBackend::new();
        assert_eq!(
            backend.create_uri("/x/y/a.tiff", PathParts::All).unwrap(),
            "file:///x/y/a.tiff"
        );
        assert_eq!(
            backend.create_uri("/x/y/a.tiff", PathParts::Last(2)).unwrap(),
            "file:///y/a.tiff"
        );
    }
}
