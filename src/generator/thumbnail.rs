use super::render::{render_pages, RenderOptions};
use super::BuildStep;
use crate::error::DerivationError;
use crate::storage::Location;
use crate::template::OutputExtension;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::path::Path;
use tracing::debug;

/// Bounding box for a thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
    /// Only shrink; smaller images keep their size.
    pub shrink_only: bool,
}

impl ThumbnailSize {
    /// PDFs get a portrait page-sized box, everything else a small landscape one.
    pub fn for_extension(extension: &str) -> Self {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Self {
                width: 338,
                height: 493,
                shrink_only: false,
            },
            _ => Self {
                width: 200,
                height: 150,
                shrink_only: true,
            },
        }
    }

    fn apply(self, image: DynamicImage) -> DynamicImage {
        let fits = image.width() <= self.width && image.height() <= self.height;
        if self.shrink_only && fits {
            return image;
        }
        image.resize(self.width, self.height, FilterType::Triangle)
    }
}

/// JPEG thumbnail. PDFs are thumbnailed from their first page.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailStep {
    render: RenderOptions,
}

impl ThumbnailStep {
    pub fn new(render: RenderOptions) -> Self {
        Self { render }
    }
}

#[async_trait]
impl BuildStep for ThumbnailStep {
    fn name(&self) -> &'static str {
        "thumbnail"
    }

    fn output_extension(&self) -> Option<OutputExtension> {
        Some(OutputExtension::literal("thumbnail.jpeg"))
    }

    async fn build(
        &self,
        input: &Location,
        destination: &Location,
        staged_input: &Path,
    ) -> Result<Location, DerivationError> {
        let extension = input.uri().extension();
        let size = ThumbnailSize::for_extension(extension);
        let image = if extension.eq_ignore_ascii_case(".pdf") {
            // Low resolution is plenty for a 493 px tall thumbnail.
            let options = RenderOptions {
                dpi: 72,
                ..self.render
            };
            render_pages(staged_input, options, Some(1))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DerivationError::Pdf {
                    path: staged_input.to_path_buf(),
                    detail: "document has no pages".into(),
                })?
        } else {
            let source = staged_input.to_path_buf();
            tokio::task::spawn_blocking(move || {
                image::open(&source).map_err(|e| DerivationError::Image {
                    path: source.clone(),
                    detail: e.to_string(),
                })
            })
            .await
            .map_err(|e| DerivationError::Internal(format!("Decode task panicked: {e}")))??
        };

        destination
            .stage_for_write(|out| async move {
                tokio::task::spawn_blocking(move || write_thumbnail(image, size, &out))
                    .await
                    .map_err(|e| DerivationError::Internal(format!("Encode task panicked: {e}")))?
            })
            .await?;
        debug!(input = %input, destination = %destination, ?size, "Wrote thumbnail");
        Ok(destination.clone())
    }
}

/// Composite transparent pixels onto white; JPEG has no alpha.
fn flatten(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let [r, g, b, a] = px.0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

fn write_thumbnail(image: DynamicImage, size: ThumbnailSize, out: &Path) -> Result<(), DerivationError> {
    let thumb = size.apply(image);
    DynamicImage::ImageRgb8(flatten(&thumb))
        .save_with_format(out, ImageFormat::Jpeg)
        .map_err(|e| DerivationError::Image {
            path: out.to_path_buf(),
            detail: e.to_string(),
        })
}
