//! Storage locations.
//!
//! A [`Location`] is a URI plus the backend that owns its scheme. Every
//! backend implements [`StorageBackend`]; callers never talk to one directly
//! and instead go through the location, which adds the staging lifecycle:
//!
//! ```text
//!  stage_for_read            stage_for_write
//!  ──────────────            ───────────────
//!  exists? ── no ──▶ MissingSource
//!     │ yes                  create empty temp file
//!  fetch into temp dir             │
//!     │                      scope(path)
//!  scope(path)                     │
//!     │                      commit (AutoCommit)
//!  temp dir removed          temp dir removed
//! ```
//!
//! Staged paths only exist inside the scope closure. The temp directory is a
//! [`tempfile::TempDir`] held by the staging future, so it is removed on
//! success, on error and when the future is dropped.
//!
//! Backends are looked up by scheme in a [`Registry`], which also carries the
//! [`StorageConfig`] they were built from.

pub mod file;
pub(crate) mod glob;
pub mod http;
pub mod memory;
pub mod s3;
pub mod sqs;

pub use file::FileBackend;
pub use http::HttpBackend;
pub use memory::{MemoryObjectStore, MemoryQueue};
pub use s3::{ObjectStore, S3Backend};
pub use sqs::{MessageQueue, QueueAddress, QueueMessage, SqsBackend};

use crate::config::StorageConfig;
use crate::error::DerivationError;
use crate::template::{literal_scheme, OutputExtension, Rewrite};
use crate::uri::LocationUri;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::TempDir;
use tracing::debug;

// ── Backend contract ──────────────────────────────────────────────────────

/// How much of a path [`StorageBackend::create_uri`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathParts {
    /// The whole path.
    All,
    /// Only the last N `/`-separated segments.
    Last(usize),
}

impl PathParts {
    /// Apply to a path, returning the kept segments joined by `/`.
    pub fn take(self, path: &str) -> String {
        match self {
            Self::All => path.to_string(),
            Self::Last(n) => {
                let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                let start = segments.len().saturating_sub(n);
                segments[start..].join("/")
            }
        }
    }
}

/// One storage service, addressed by one or more URI schemes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Schemes this backend answers for.
    fn schemes(&self) -> &'static [&'static str];

    /// The backend-specific path of a URI, used as the source path when
    /// deriving other locations from it.
    fn key(&self, uri: &LocationUri) -> Result<String, DerivationError>;

    /// Build a URI on this backend for a bare path.
    fn create_uri(&self, path: &str, parts: PathParts) -> Result<String, DerivationError>;

    /// Segments [`Registry::create`] keeps when the caller does not say.
    fn default_path_parts(&self) -> PathParts {
        PathParts::All
    }

    async fn exists(&self, uri: &LocationUri) -> Result<bool, DerivationError>;

    /// Copy the bytes at `uri` to the local file `dest`.
    async fn fetch(&self, uri: &LocationUri, dest: &Path) -> Result<(), DerivationError>;

    /// Push the local file `src` to `uri`.
    async fn store(&self, uri: &LocationUri, src: &Path) -> Result<(), DerivationError>;

    /// URIs on this backend matching `pattern`, relative to the directory of `uri`.
    async fn list_matching(
        &self,
        uri: &LocationUri,
        pattern: &str,
    ) -> Result<Vec<LocationUri>, DerivationError>;
}

// ── Registry ──────────────────────────────────────────────────────────────

/// Scheme → backend map plus the config the backends were built from.
///
/// Cheap to clone; clones share the same backends.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: StorageConfig,
    backends: RwLock<BTreeMap<String, Arc<dyn StorageBackend>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                backends: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// A registry with the built-in backends: `file`, `s3`, `sqs`, `http`, `https`.
    pub fn with_defaults(config: StorageConfig) -> Result<Self, DerivationError> {
        let registry = Self::new(config);
        let config = registry.config().clone();
        registry.register(Arc::new(FileBackend::new()));
        registry.register(Arc::new(S3Backend::new(config.s3.clone())));
        registry.register(Arc::new(SqsBackend::new(config.sqs.clone())));
        registry.register(Arc::new(HttpBackend::new(config.http_timeout_secs)?));
        Ok(registry)
    }

    /// Register a backend for every scheme it declares, replacing any
    /// backend previously registered for them.
    pub fn register(&self, backend: Arc<dyn StorageBackend>) {
        let mut backends = match self.inner.backends.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for scheme in backend.schemes() {
            debug!(scheme, "Registering storage backend");
            backends.insert((*scheme).to_string(), Arc::clone(&backend));
        }
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        self.read_backends().keys().cloned().collect()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Resolve a URI to a location on its backend.
    pub fn location(&self, uri: impl AsRef<str>) -> Result<Location, DerivationError> {
        let uri = LocationUri::parse(uri.as_ref())?;
        let backend = self.backend(uri.scheme())?;
        Ok(Location {
            uri,
            backend,
            registry: self.clone(),
        })
    }

    /// A location on `scheme` for a bare path, using the backend's URI rules.
    pub fn create(
        &self,
        scheme: &str,
        path: &str,
        parts: Option<PathParts>,
    ) -> Result<Location, DerivationError> {
        let backend = self.backend(scheme)?;
        let parts = parts.unwrap_or_else(|| backend.default_path_parts());
        let uri = backend.create_uri(path, parts)?;
        self.location(uri)
    }

    fn backend(&self, scheme: &str) -> Result<Arc<dyn StorageBackend>, DerivationError> {
        self.read_backends()
            .get(scheme)
            .cloned()
            .ok_or_else(|| DerivationError::UnknownBackend {
                scheme: scheme.to_string(),
            })
    }

    fn read_backends(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<dyn StorageBackend>>> {
        match self.inner.backends.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.schemes())
            .field("config", &self.inner.config)
            .finish()
    }
}

// ── Location ──────────────────────────────────────────────────────────────

/// Whether [`Location::stage_for_write_with`] pushes the staged file itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Commit after the scope succeeds.
    #[default]
    AutoCommit,
    /// The scope calls [`Location::commit`] when it is ready.
    Deferred,
}

/// A URI bound to the backend that stores it.
#[derive(Clone)]
pub struct Location {
    uri: LocationUri,
    backend: Arc<dyn StorageBackend>,
    registry: Registry,
}

impl Location {
    pub fn uri(&self) -> &LocationUri {
        &self.uri
    }

    pub fn as_str(&self) -> &str {
        self.uri.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    pub fn file_name(&self) -> &str {
        self.uri.file_name()
    }

    pub fn key(&self) -> Result<String, DerivationError> {
        self.backend.key(&self.uri)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn exists(&self) -> Result<bool, DerivationError> {
        self.backend.exists(&self.uri).await
    }

    /// Materialise the bytes locally and run `scope` on the staged path.
    ///
    /// The staged copy is deleted when this returns, whatever the outcome.
    pub async fn stage_for_read<F, Fut, T>(&self, scope: F) -> Result<T, DerivationError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = Result<T, DerivationError>> + Send,
        T: Send,
    {
        if !self.exists().await? {
            return Err(DerivationError::MissingSource {
                uri: self.uri.to_string(),
            });
        }
        let staging = Staging::create(self).await?;
        self.backend.fetch(&self.uri, staging.path()).await?;
        debug!(uri = %self.uri, path = %staging.path().display(), "Staged for read");

        scope(staging.path().to_path_buf()).await
    }

    /// Run `scope` on a fresh empty temp file, then commit it.
    pub async fn stage_for_write<F, Fut, T>(&self, scope: F) -> Result<T, DerivationError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = Result<T, DerivationError>> + Send,
        T: Send,
    {
        self.stage_for_write_with(WriteMode::AutoCommit, scope).await
    }

    pub async fn stage_for_write_with<F, Fut, T>(
        &self,
        mode: WriteMode,
        scope: F,
    ) -> Result<T, DerivationError>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = Result<T, DerivationError>> + Send,
        T: Send,
    {
        let staging = Staging::create(self).await?;
        tokio::fs::File::create(staging.path())
            .await
            .map_err(|e| DerivationError::io(staging.path(), e))?;
        debug!(uri = %self.uri, path = %staging.path().display(), ?mode, "Staged for write");

        let value = scope(staging.path().to_path_buf()).await?;
        if mode == WriteMode::AutoCommit {
            self.commit(staging.path()).await?;
        }
        Ok(value)
    }

    /// Push a staged file to the backend.
    pub async fn commit(&self, staged: &Path) -> Result<(), DerivationError> {
        let present = tokio::fs::try_exists(staged)
            .await
            .map_err(|e| DerivationError::io(staged, e))?;
        if !present {
            return Err(DerivationError::StagedFileMissing {
                uri: self.uri.to_string(),
                path: staged.to_path_buf(),
            });
        }
        debug!(uri = %self.uri, path = %staged.display(), "Committing staged file");
        self.backend.store(&self.uri, staged).await
    }

    /// Derive a related location through `template`.
    pub fn derive(&self, template: &str) -> Result<Location, DerivationError> {
        self.derive_with(template, None, None)
    }

    /// Derive a related location, possibly on another backend.
    ///
    /// The target scheme is `target_scheme` when given, else the template's
    /// literal scheme, else this location's scheme.
    pub fn derive_with(
        &self,
        template: &str,
        extension: Option<&OutputExtension>,
        target_scheme: Option<&str>,
    ) -> Result<Location, DerivationError> {
        let scheme = target_scheme
            .or_else(|| literal_scheme(template))
            .unwrap_or_else(|| self.scheme());
        let source = format!("{scheme}://{}", self.key()?);
        let uri = Rewrite::new(&source, template)
            .target_scheme(Some(scheme))
            .extension(extension)
            .separator(&self.registry.config().separator)
            .apply()?;
        debug!(from = %self.uri, to = %uri, "Derived location");
        self.registry.location(uri)
    }

    /// Locations on this backend matching a glob relative to this location's directory.
    pub async fn list_matching(&self, pattern: &str) -> Result<Vec<Location>, DerivationError> {
        let uris = self.backend.list_matching(&self.uri, pattern).await?;
        Ok(uris
            .into_iter()
            .map(|uri| Location {
                uri,
                backend: Arc::clone(&self.backend),
                registry: self.registry.clone(),
            })
            .collect())
    }

    /// A location with another file name in the same directory.
    pub fn sibling(&self, file_name: &str) -> Result<Location, DerivationError> {
        let directory = self.uri.directory();
        let uri = if directory.is_empty() {
            format!("{}://{file_name}", self.scheme())
        } else {
            format!("{}://{directory}/{file_name}", self.scheme())
        };
        self.registry.location(uri)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Location").field(&self.uri.as_str()).finish()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.uri, f)
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Location {}

// ── Staging ───────────────────────────────────────────────────────────────

/// A temp directory holding one staged file at `<tmp>/<key dir>/<file name>`.
struct Staging {
    _dir: TempDir,
    path: PathBuf,
}

impl Staging {
    async fn create(location: &Location) -> Result<Self, DerivationError> {
        let dir = tempfile::Builder::new()
            .prefix("derivatives-")
            .tempdir()
            .map_err(|e| DerivationError::io(std::env::temp_dir(), e))?;

        let key = location.key()?;
        let mut path = dir.path().to_path_buf();
        if let Some(parent) = Path::new(&key).parent() {
            // Only plain segments, so the staged file cannot escape the temp dir.
            path.extend(parent.components().filter_map(|c| match c {
                Component::Normal(segment) => Some(segment),
                _ => None,
            }));
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| DerivationError::io(&path, e))?;

        let file_name = match location.file_name() {
            "" | "." | ".." => "staged",
            name => name,
        };
        path.push(file_name);
        Ok(Self { _dir: dir, path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::with_defaults(StorageConfig::default()).unwrap()
    }

    #[test]
    fn default_schemes() {
        assert_eq!(
            registry().schemes(),
            vec!["file", "http", "https", "s3", "sqs"]
        );
    }

    #[test]
    fn unknown_and_missing_schemes() {
        let r = registry();
        assert!(matches!(
            r.location("ftp://host/a.pdf").unwrap_err(),
            DerivationError::UnknownBackend { scheme } if scheme == "ftp"
        ));
        assert!(matches!(
            r.location("/a.pdf").unwrap_err(),
            DerivationError::MissingScheme { .. }
        ));
    }

    #[test]
    fn path_parts() {
        assert_eq!(PathParts::All.take("/a/b/c.tiff"), "/a/b/c.tiff");
        assert_eq!(PathParts::Last(2).take("/a/b/c.tiff"), "b/c.tiff");
        assert_eq!(PathParts::Last(5).take("a/b"), "a/b");
    }

    #[test]
    fn derive_across_backends() {
        let r = registry();
        let input = r.location("file:///in/box/a.tiff").unwrap();
        let out = input
            .derive_with(
                "s3://scans.s3.us-east-1.amazonaws.com/{{dir_parts[-1..-1]}}/{{basename}}{{extension}}",
                Some(&OutputExtension::literal("hocr")),
                None,
            )
            .unwrap();
        assert_eq!(out.scheme(), "s3");
        assert_eq!(out.as_str(), "s3://scans.s3.us-east-1.amazonaws.com/box/a.hocr");
    }

    #[test]
    fn derive_from_object_key() {
        let r = registry();
        let input = r
            .location("s3://scans.s3.us-east-1.amazonaws.com/box/a.tiff")
            .unwrap();
        let out = input
            .derive("file:///out/{{dir_parts[-1..-1]}}/{{filename}}")
            .unwrap();
        assert_eq!(out.as_str(), "file:///out/box/a.tiff");
    }

    #[test]
    fn scheme_placeholder_keeps_source_backend() {
        let r = registry();
        let input = r.location("file:///in/a.tiff").unwrap();
        let out = input.derive("{{scheme}}:///out/{{filename}}").unwrap();
        assert_eq!(out.as_str(), "file:///out/a.tiff");
    }

    #[test]
    fn sibling_shares_directory() {
        let r = registry();
        let loc = r.location("file:///out/box/a.tiff").unwrap();
        assert_eq!(
            loc.sibling("a--page-1.tiff").unwrap().as_str(),
            "file:///out/box/a--page-1.tiff"
        );
    }

    #[test]
    fn create_uses_backend_rules() {
        let config = StorageConfig::builder().s3_bucket("scans").build().unwrap();
        let r = Registry::with_defaults(config).unwrap();
        let file = r.create("file", "/x/y/a.tiff", None).unwrap();
        assert_eq!(file.as_str(), "file:///x/y/a.tiff");
        let s3 = r.create("s3", "/x/y/a.tiff", None).unwrap();
        assert_eq!(s3.as_str(), "s3://scans.s3.us-east-1.amazonaws.com/y/a.tiff");
    }

    #[tokio::test]
    async fn staged_read_is_removed_on_success_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.tiff");
        std::fs::write(&src, b"bytes").unwrap();
        let loc = registry()
            .location(format!("file://{}", src.display()))
            .unwrap();

        let seen = loc
            .stage_for_read(|path| async move {
                assert_eq!(tokio::fs::read(&path).await.unwrap(), b"bytes");
                Ok(path)
            })
            .await
            .unwrap();
        assert!(!seen.exists());

        let mut staged = None;
        let err = loc
            .stage_for_read(|path| {
                staged = Some(path);
                async { Err::<(), _>(DerivationError::Internal("boom".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DerivationError::Internal(_)));
        assert!(!staged.unwrap().exists());
    }

    #[tokio::test]
    async fn staged_read_of_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let loc = registry()
            .location(format!("file://{}/nope.tiff", dir.path().display()))
            .unwrap();
        let err = loc
            .stage_for_read(|_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DerivationError::MissingSource { .. }));
    }

    #[tokio::test]
    async fn staged_write_commits_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out/a.hocr");
        let loc = registry()
            .location(format!("file://{}", dest.display()))
            .unwrap();

        let staged = loc
            .stage_for_write(|path| async move {
                tokio::fs::write(&path, b"<html/>")
                    .await
                    .map_err(|e| DerivationError::io(&path, e))?;
                Ok(path)
            })
            .await
            .unwrap();
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"<html/>");
    }

    #[tokio::test]
    async fn failed_write_scope_cleans_up_without_commit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out/a.hocr");
        let loc = registry()
            .location(format!("file://{}", dest.display()))
            .unwrap();

        let mut staged = None;
        let err = loc
            .stage_for_write(|path| {
                staged = Some(path.clone());
                async move {
                    tokio::fs::write(&path, b"half written")
                        .await
                        .map_err(|e| DerivationError::io(&path, e))?;
                    Err::<(), _>(DerivationError::Internal("tool crashed".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DerivationError::Internal(_)));
        assert!(!staged.unwrap().exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn deferred_write_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.hocr");
        let loc = registry()
            .location(format!("file://{}", dest.display()))
            .unwrap();

        loc.stage_for_write_with(WriteMode::Deferred, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn commit_without_staged_file() {
        let loc = registry().location("file:///tmp/never/a.hocr").unwrap();
        let err = loc
            .commit(Path::new("/definitely/not/staged.hocr"))
            .await
            .unwrap_err();
        assert!(matches!(err, DerivationError::StagedFileMissing { .. }));
    }
}
