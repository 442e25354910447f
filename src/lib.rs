//! # edgequake-derivatives
//!
//! Find or build file derivatives (monochrome images, thumbnails, hOCR,
//! per-page images) across local disk, S3, SQS and HTTP.
//!
//! ## Why this crate?
//!
//! Digitisation pipelines run the same expensive steps (OCR, rasterising,
//! thumbnailing) over large batches of files, often on many machines. Some of
//! those derivatives already exist, either at the final destination or at a
//! "preprocessed" location filled by an earlier batch job. This crate checks
//! both places before building anything, and hides where the bytes live
//! behind one URI-addressed [`Location`] type.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input URI
//!  │
//!  ├─ 1. Resolve   scheme → storage backend (file, s3, sqs, http, https)
//!  ├─ 2. Derive    output template → destination URI
//!  ├─ 3. Tier 1    destination exists?            → use it
//!  ├─ 4. Tier 2    preprocessed location exists?  → promote or use it
//!  ├─ 5. Stage     fetch input into a temp dir
//!  ├─ 6. Build     copy / monochrome / thumbnail / hOCR / split
//!  └─ 7. Commit    push the staged output to the destination backend
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_derivatives::{Generator, HocrStep, MonochromeStep, Registry, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::with_defaults(StorageConfig::from_env()?)?;
//!     let hocr = Generator::builder(HocrStep::default())
//!         .input("file:///scans/box-1/page.tiff")
//!         .output_template("file:///derived/{{dir_parts[-1..-1]}}/{{basename}}{{extension}}")
//!         .preprocessed_template("s3://preprocessed.s3.us-east-1.amazonaws.com/{{dir_parts[-1..-1]}}/{{basename}}{{extension}}")
//!         .requires(MonochromeStep)
//!         .build(&registry)?;
//!     for uri in hocr.evaluated_uris().await? {
//!         println!("{uri}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Templates
//!
//! | Placeholder | Expands to |
//! |-------------|------------|
//! | `{{ dir_parts[a..b] }}` | source directory segments `a..=b`, negative counts from the end |
//! | `{{ filename }}` | source file name |
//! | `{{ basename }}` | file name without extension (and without `.mono`) |
//! | `{{ extension }}` | the generator's output extension, or the source's |
//! | `{{ scheme }}` | the target scheme |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `derivatives` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-derivatives = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod generator;
pub mod progress;
pub mod storage;
pub mod template;
pub mod uri;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{S3Settings, SqsSettings, StorageConfig, StorageConfigBuilder};
pub use error::DerivationError;
pub use generator::{
    BuildStep, CopyStep, Generator, GeneratorBuilder, HocrStep, MonochromeStep, PageSplitter,
    PdfiumSplitter, Promotion, RenderOptions, SplitFormat, SplitGenerator, ThumbnailStep,
};
pub use progress::{DerivationObserver, NoopObserver, Observer};
pub use storage::{Location, PathParts, Registry, StorageBackend, WriteMode};
pub use template::{rewrite, upstream_template, OutputExtension, Rewrite};
pub use uri::LocationUri;
