//! PDF rasterisation through pdfium.
//!
//! pdfium is a blocking C++ library, so every call here runs inside
//! `tokio::task::spawn_blocking`.
//!
//! The library is located in this order: `PDFIUM_LIB_PATH` (a file or a
//! directory), the current directory, then the system library path.

use crate::error::DerivationError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Page rendering resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Dots per inch. Default: 400.
    pub dpi: u32,
    /// Cap on either edge in pixels. Default: 6000.
    pub max_pixels: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 400,
            max_pixels: 6000,
        }
    }
}

/// Render pages of a PDF, first to last, or only the first `limit`.
pub async fn render_pages(
    pdf_path: &Path,
    options: RenderOptions,
    limit: Option<usize>,
) -> Result<Vec<DynamicImage>, DerivationError> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_pages_blocking(&path, options, limit))
        .await
        .map_err(|e| DerivationError::Internal(format!("Render task panicked: {e}")))?
}

fn render_pages_blocking(
    pdf_path: &Path,
    options: RenderOptions,
    limit: Option<usize>,
) -> Result<Vec<DynamicImage>, DerivationError> {
    let pdf_error = |detail: String| DerivationError::Pdf {
        path: pdf_path.to_path_buf(),
        detail,
    };

    let pdfium = bind_pdfium().map_err(|e| pdf_error(format!("cannot bind pdfium: {e:?}")))?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| pdf_error(format!("{e:?}")))?;

    let pages = document.pages();
    let total = pages.len() as usize;
    let wanted = limit.map_or(total, |n| n.min(total));
    info!(path = %pdf_path.display(), pages = total, rendering = wanted, dpi = options.dpi, "PDF loaded");

    let max = options.max_pixels as i32;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(options.dpi as f32 / 72.0)
        .set_maximum_width(max)
        .set_maximum_height(max);

    let mut images = Vec::with_capacity(wanted);
    for (idx, page) in pages.iter().take(wanted).enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| pdf_error(format!("page {}: {e:?}", idx + 1)))?;
        let image = bitmap.as_image();
        debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
        images.push(image);
    }
    Ok(images)
}

fn bind_pdfium() -> Result<Pdfium, PdfiumError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from) {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }?;
    Ok(Pdfium::new(bindings))
}

/// True when a pdfium library can be bound in this process.
pub fn pdfium_available() -> bool {
    bind_pdfium().is_ok()
}
