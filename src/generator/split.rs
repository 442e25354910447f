//! One PDF in, one image per page out.
//!
//! Pages are named `<base>--page-<n>.<ext>` beside the derived destination,
//! `n` counting from 1. Any file matching `<base>--page-*.<ext>` at the
//! destination means the document was already split; the whole set is
//! returned as-is without checking it is complete.

use super::render::{render_pages, RenderOptions};
use super::{promote, Promotion};
use crate::error::DerivationError;
use crate::progress::{NoopObserver, Observer};
use crate::storage::{glob, Location, Registry};
use crate::template::OutputExtension;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Image format of split pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitFormat {
    #[default]
    Tiff,
    Png,
    Jpeg,
}

impl SplitFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Tiff => "tiff",
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Tiff => ImageFormat::Tiff,
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// `<base>--page-<n>.<ext>`
pub fn page_file_name(base_name: &str, page: usize, extension: &str) -> String {
    format!("{base_name}--page-{page}.{extension}")
}

/// Glob matching every page of `base_name`. Wildcard characters in the base
/// name are escaped.
pub fn page_pattern(base_name: &str, extension: &str) -> String {
    format!(
        "{}--page-*.{}",
        glob::escape(base_name),
        glob::escape(extension)
    )
}

/// Page number of a page file name, if it is one.
fn page_number(file_name: &str) -> Option<usize> {
    let (_, tail) = file_name.rsplit_once("--page-")?;
    let digits = tail.split('.').next()?;
    digits.parse().ok()
}

fn sort_pages(pages: &mut [Location]) {
    pages.sort_by_key(|p| (page_number(p.file_name()), p.as_str().to_string()));
}

/// Turns a PDF into page images.
#[async_trait]
pub trait PageSplitter: Send + Sync {
    /// Write one image per page into `out_dir`, named with
    /// [`page_file_name`], and return their paths in page order.
    async fn split(
        &self,
        pdf: &Path,
        out_dir: &Path,
        base_name: &str,
        format: SplitFormat,
    ) -> Result<Vec<PathBuf>, DerivationError>;
}

/// [`PageSplitter`] rasterising with pdfium.
#[derive(Debug, Clone, Default)]
pub struct PdfiumSplitter {
    options: RenderOptions,
}

impl PdfiumSplitter {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl PageSplitter for PdfiumSplitter {
    async fn split(
        &self,
        pdf: &Path,
        out_dir: &Path,
        base_name: &str,
        format: SplitFormat,
    ) -> Result<Vec<PathBuf>, DerivationError> {
        let images = render_pages(pdf, self.options, None).await?;
        let out_dir = out_dir.to_path_buf();
        let base_name = base_name.to_string();

        tokio::task::spawn_blocking(move || {
            images
                .into_iter()
                .enumerate()
                .map(|(idx, image)| {
                    let path = out_dir.join(page_file_name(&base_name, idx + 1, format.extension()));
                    // JPEG has no alpha channel.
                    let image = match format {
                        SplitFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
                        _ => image,
                    };
                    image
                        .save_with_format(&path, format.image_format())
                        .map_err(|e| DerivationError::Image {
                            path: path.clone(),
                            detail: e.to_string(),
                        })?;
                    Ok(path)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| DerivationError::Internal(format!("Page encode task panicked: {e}")))?
    }
}

/// Splits each input PDF into page images.
pub struct SplitGenerator {
    splitter: Arc<dyn PageSplitter>,
    format: SplitFormat,
    inputs: Vec<Location>,
    output_template: String,
    preprocessed_template: Option<String>,
    promotion: Promotion,
    observer: Observer,
    results: OnceCell<Vec<Location>>,
}

impl SplitGenerator {
    pub fn builder(splitter: impl PageSplitter + 'static) -> SplitGeneratorBuilder {
        SplitGeneratorBuilder {
            splitter: Arc::new(splitter),
            format: SplitFormat::default(),
            inputs: Vec::new(),
            output_template: None,
            preprocessed_template: None,
            promotion: Promotion::default(),
            observer: None,
        }
    }

    pub fn inputs(&self) -> &[Location] {
        &self.inputs
    }

    /// Every page of every input, inputs in order, pages by number.
    pub async fn evaluate(&self) -> Result<Vec<Location>, DerivationError> {
        self.results
            .get_or_try_init(|| async {
                self.observer.on_generator_start("pdf_split", self.inputs.len());
                let mut pages = Vec::new();
                for input in &self.inputs {
                    pages.extend(self.pages_for(input).await?);
                }
                self.observer.on_generator_complete("pdf_split", pages.len());
                Ok::<_, DerivationError>(pages)
            })
            .await
            .cloned()
    }

    pub async fn evaluated_uris(&self) -> Result<Vec<String>, DerivationError> {
        Ok(self
            .evaluate()
            .await?
            .iter()
            .map(|l| l.as_str().to_string())
            .collect())
    }

    async fn pages_for(&self, input: &Location) -> Result<Vec<Location>, DerivationError> {
        let ext = self.format.extension();
        let extension = OutputExtension::literal(ext);
        let destination = input.derive_with(&self.output_template, Some(&extension), None)?;
        let base_name = destination.uri().base_name().to_string();
        let pattern = page_pattern(&base_name, ext);

        let mut existing = destination.list_matching(&pattern).await?;
        if let Some(first) = existing.first() {
            info!(input = %input, pages = existing.len(), "Already split at destination");
            self.observer.on_found_at_destination(input, first);
            sort_pages(&mut existing);
            return Ok(existing);
        }

        if let Some(template) = &self.preprocessed_template {
            let preprocessed = input.derive_with(template, Some(&extension), None)?;
            let pre_pattern = page_pattern(preprocessed.uri().base_name(), ext);
            let mut found = preprocessed.list_matching(&pre_pattern).await?;
            if let Some(first) = found.first() {
                info!(input = %input, pages = found.len(), promotion = ?self.promotion, "Already split at preprocessed");
                self.observer.on_found_preprocessed(input, first);
                sort_pages(&mut found);
                return match self.promotion {
                    Promotion::UsePreprocessed => Ok(found),
                    Promotion::CopyToDestination => {
                        let mut promoted = Vec::with_capacity(found.len());
                        for page in &found {
                            let target = destination.sibling(page.file_name())?;
                            promoted.push(promote(page, &target).await?);
                        }
                        Ok(promoted)
                    }
                };
            }
        }

        info!(input = %input, destination = %destination, "Splitting");
        self.observer.on_build_start(input, &destination);
        let splitter = &self.splitter;
        let format = self.format;
        let destination_ref = &destination;
        let base = base_name.as_str();
        let pages = input
            .stage_for_read(|staged| async move {
                let scratch = tempfile::Builder::new()
                    .prefix("derivatives-split-")
                    .tempdir()
                    .map_err(|e| DerivationError::io(std::env::temp_dir(), e))?;
                let files = splitter.split(&staged, scratch.path(), base, format).await?;
                debug!(pages = files.len(), "Split into scratch directory");

                let mut pages = Vec::with_capacity(files.len());
                for file in files {
                    let name = file
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| {
                            DerivationError::Internal(format!(
                                "splitter produced an unnamed page: {}",
                                file.display()
                            ))
                        })?
                        .to_string();
                    let target = destination_ref.sibling(&name)?;
                    target
                        .stage_for_write(|out| async move {
                            tokio::fs::copy(&file, &out)
                                .await
                                .map_err(|e| DerivationError::io(&out, e))?;
                            Ok(())
                        })
                        .await?;
                    pages.push(target);
                }
                Ok(pages)
            })
            .await?;

        if let Some(first) = pages.first() {
            self.observer.on_build_complete(input, first);
        }
        Ok(pages)
    }
}

/// Builder for [`SplitGenerator`].
pub struct SplitGeneratorBuilder {
    splitter: Arc<dyn PageSplitter>,
    format: SplitFormat,
    inputs: Vec<String>,
    output_template: Option<String>,
    preprocessed_template: Option<String>,
    promotion: Promotion,
    observer: Option<Observer>,
}

impl SplitGeneratorBuilder {
    pub fn format(mut self, format: SplitFormat) -> Self {
        self.format = format;
        self
    }

    pub fn input(mut self, uri: impl Into<String>) -> Self {
        self.inputs.push(uri.into());
        self
    }

    pub fn inputs<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(uris.into_iter().map(Into::into));
        self
    }

    pub fn output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = Some(template.into());
        self
    }

    pub fn preprocessed_template(mut self, template: impl Into<String>) -> Self {
        self.preprocessed_template = Some(template.into());
        self
    }

    pub fn promotion(mut self, promotion: Promotion) -> Self {
        self.promotion = promotion;
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self, registry: &Registry) -> Result<SplitGenerator, DerivationError> {
        let output_template = self.output_template.ok_or_else(|| {
            DerivationError::InvalidConfig("split generator needs an output template".into())
        })?;
        let inputs = self
            .inputs
            .iter()
            .map(|uri| registry.location(uri))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SplitGenerator {
            splitter: self.splitter,
            format: self.format,
            inputs,
            output_template,
            preprocessed_template: self.preprocessed_template,
            promotion: self.promotion,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            results: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names() {
        assert_eq!(page_file_name("a", 3, "tiff"), "a--page-3.tiff");
        assert_eq!(page_pattern("a", "png"), "a--page-*.png");
        assert_eq!(page_pattern("a*b?", "png"), "a\\*b\\?--page-*.png");
        assert_eq!(page_number("a--page-12.tiff"), Some(12));
        assert_eq!(page_number("a.tiff"), None);
    }

    #[test]
    fn formats() {
        assert_eq!(SplitFormat::default().extension(), "tiff");
        assert_eq!(SplitFormat::Jpeg.image_format(), ImageFormat::Jpeg);
    }
}
