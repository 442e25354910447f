//! Bilevel (black and white) TIFF for OCR.
//!
//! Grayscale conversion followed by a fixed threshold at mid-gray. Inputs
//! that are already bilevel grayscale are returned as-is, without writing an
//! intermediate.

use super::BuildStep;
use crate::error::DerivationError;
use crate::storage::Location;
use crate::template::OutputExtension;
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::path::Path;
use tracing::{debug, info};

/// Luma at or above this is white.
const THRESHOLD: u8 = 128;

#[derive(Debug, Default, Clone, Copy)]
pub struct MonochromeStep;

#[async_trait]
impl BuildStep for MonochromeStep {
    fn name(&self) -> &'static str {
        "monochrome"
    }

    fn output_extension(&self) -> Option<OutputExtension> {
        Some(OutputExtension::literal("mono.tiff"))
    }

    async fn build(
        &self,
        input: &Location,
        destination: &Location,
        staged_input: &Path,
    ) -> Result<Location, DerivationError> {
        let source = staged_input.to_path_buf();
        let image = tokio::task::spawn_blocking(move || open_image(&source))
            .await
            .map_err(|e| DerivationError::Internal(format!("Decode task panicked: {e}")))??;

        if is_bilevel(&image) {
            info!(input = %input, "Already monochrome, using input");
            return Ok(input.clone());
        }

        destination
            .stage_for_write(|out| async move {
                tokio::task::spawn_blocking(move || write_monochrome(&image, &out))
                    .await
                    .map_err(|e| DerivationError::Internal(format!("Encode task panicked: {e}")))?
            })
            .await?;
        debug!(input = %input, destination = %destination, "Wrote monochrome image");
        Ok(destination.clone())
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, DerivationError> {
    image::open(path).map_err(|e| DerivationError::Image {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Single-channel 8-bit image whose pixels are all pure black or pure white.
fn is_bilevel(image: &DynamicImage) -> bool {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.pixels().all(|Luma([v])| *v == 0 || *v == u8::MAX),
        _ => false,
    }
}

fn threshold(image: &DynamicImage) -> GrayImage {
    let mut gray = image.to_luma8();
    for Luma([v]) in gray.pixels_mut() {
        *v = if *v >= THRESHOLD { u8::MAX } else { 0 };
    }
    gray
}

fn write_monochrome(image: &DynamicImage, out: &Path) -> Result<(), DerivationError> {
    threshold(image)
        .save_with_format(out, ImageFormat::Tiff)
        .map_err(|e| DerivationError::Image {
            path: out.to_path_buf(),
            detail: e.to_string(),
        })
}
