//! Error types for the edgequake-derivatives library.
//!
//! Every failure is fatal to the derivation that raised it: there are no
//! retries and no partial results. Errors are raised as soon as they are
//! detected and carry the offending URI or identifier in their message.
//!
//! Callers that want to distinguish "the thing is not there" from "something
//! broke" can use [`DerivationError::is_missing`].

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the edgequake-derivatives library.
#[derive(Debug, Error)]
pub enum DerivationError {
    // ── Addressing errors ─────────────────────────────────────────────────
    /// The URI has no `scheme://` prefix.
    #[error("URI '{uri}' has no scheme\nExpected the form scheme://path, e.g. file:///data/a.tiff")]
    MissingScheme { uri: String },

    /// No backend is registered for the scheme.
    #[error("No storage backend registered for scheme '{scheme}'")]
    UnknownBackend { scheme: String },

    /// An S3 URI whose host does not name a bucket.
    #[error("Cannot resolve a bucket from '{uri}'\nExpected s3://<bucket>.s3.<region>.amazonaws.com/<key>")]
    BucketUnresolvable { uri: String },

    /// An SQS URI whose path does not name a queue.
    #[error("Cannot resolve a queue from '{uri}'\nExpected sqs://<region>.amazonaws.com/<account>/<queue>/<file>")]
    QueueUnresolvable { uri: String },

    // ── Resource errors ───────────────────────────────────────────────────
    /// A location was staged for reading but does not exist.
    #[error("Source '{uri}' does not exist")]
    MissingSource { uri: String },

    /// A remote read returned a non-success status.
    #[error("Remote resource '{uri}' is unavailable: {reason}")]
    RemoteMissing { uri: String, reason: String },

    /// A commit was requested for a staged file that is not on disk.
    #[error("Staged file '{path}' for '{uri}' is missing")]
    StagedFileMissing { uri: String, path: PathBuf },

    /// The backend cannot be written to.
    #[error("Location '{uri}' is read-only")]
    ReadOnlyLocation { uri: String },

    // ── Generator errors ──────────────────────────────────────────────────
    /// A build step declared no output extension.
    #[error("Generator '{generator}' declares no output extension")]
    MissingOutputExtension { generator: String },

    /// An external tool could not be found on `PATH`.
    #[error("Required tool '{program}' was not found\nInstall it or add it to PATH.")]
    ToolNotFound { program: String },

    /// An external tool exited unsuccessfully.
    #[error("'{program}' failed ({status}): {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Decoding or encoding an image failed.
    #[error("Image processing failed for '{path}': {detail}")]
    Image { path: PathBuf, detail: String },

    /// pdfium could not be bound or could not read the document.
    #[error(
        "PDF processing failed for '{path}': {detail}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use a specific copy of the library."
    )]
    Pdf { path: PathBuf, detail: String },

    // ── Remote service errors ─────────────────────────────────────────────
    /// An object storage request failed.
    #[error("Object storage request for '{uri}' failed: {reason}")]
    ObjectStore { uri: String, reason: String },

    /// A message queue request failed.
    #[error("Queue request for '{queue}' failed: {reason}")]
    Queue { queue: String, reason: String },

    /// The configured batch size exceeds what the queue accepts.
    #[error("Batch size {batch_size} exceeds the queue maximum of {max}")]
    BatchTooLarge { batch_size: usize, max: usize },

    /// An HTTP request could not be completed.
    #[error("HTTP request to '{url}' failed: {reason}")]
    Http { url: String, reason: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Local file system operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DerivationError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the kinds that mean "the resource is absent" rather than
    /// "the operation broke".
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::MissingSource { .. } | Self::RemoteMissing { .. } | Self::StagedFileMissing { .. }
        )
    }
}
