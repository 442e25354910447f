//! OCR to hOCR through the `tesseract` command.
//!
//! Runs `tesseract <image> <output base> [extra args…] hocr`. tesseract
//! appends `.hocr` to the output base itself, so the base is the staged
//! output path with that suffix removed. Usually chained after
//! [`MonochromeStep`](super::MonochromeStep) with
//! [`GeneratorBuilder::requires`](super::GeneratorBuilder::requires).

use super::BuildStep;
use crate::error::DerivationError;
use crate::storage::Location;
use crate::template::OutputExtension;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const TESSERACT: &str = "tesseract";
const HOCR_EXTENSION: &str = "hocr";

#[derive(Debug, Clone)]
pub struct HocrStep {
    program: String,
    env: Vec<(String, String)>,
    extra_args: Vec<String>,
}

impl Default for HocrStep {
    fn default() -> Self {
        Self {
            program: TESSERACT.to_string(),
            // One OpenMP thread per tesseract process.
            env: vec![("OMP_THREAD_LIMIT".to_string(), "1".to_string())],
            extra_args: Vec::new(),
        }
    }
}

impl HocrStep {
    /// Use another executable, e.g. an absolute path to tesseract.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Replace the environment variables set on the command.
    pub fn env(mut self, vars: Vec<(String, String)>) -> Self {
        self.env = vars;
        self
    }

    /// Replace the environment from a space separated `KEY=value` list,
    /// e.g. `"OMP_THREAD_LIMIT=1 TESSDATA_PREFIX=/opt/share/tessdata"`.
    pub fn env_string(self, vars: &str) -> Result<Self, DerivationError> {
        Ok(self.env(parse_env(vars)?))
    }

    /// Options placed between the output base and the `hocr` config, e.g. `-l deu`.
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn run_tesseract(&self, image: &Path, out: &Path) -> Result<(), DerivationError> {
        let base = output_base(out);
        let mut command = Command::new(&self.program);
        command
            .arg(image)
            .arg(&base)
            .args(&self.extra_args)
            .arg(HOCR_EXTENSION)
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        debug!(program = %self.program, image = %image.display(), base = %base.display(), "Running OCR");

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DerivationError::ToolNotFound {
                    program: self.program.clone(),
                }
            } else {
                DerivationError::io(image, e)
            }
        })?;

        if !output.status.success() {
            return Err(DerivationError::ToolFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BuildStep for HocrStep {
    fn name(&self) -> &'static str {
        "hocr"
    }

    fn output_extension(&self) -> Option<OutputExtension> {
        Some(OutputExtension::literal(HOCR_EXTENSION))
    }

    async fn build(
        &self,
        input: &Location,
        destination: &Location,
        staged_input: &Path,
    ) -> Result<Location, DerivationError> {
        destination
            .stage_for_write(|out| async move { self.run_tesseract(staged_input, &out).await })
            .await?;
        info!(input = %input, destination = %destination, "OCR complete");
        Ok(destination.clone())
    }
}

/// `out` without its trailing `.hocr`.
fn output_base(out: &Path) -> PathBuf {
    let is_hocr = out
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(HOCR_EXTENSION));
    if is_hocr {
        out.with_extension("")
    } else {
        out.to_path_buf()
    }
}

fn parse_env(vars: &str) -> Result<Vec<(String, String)>, DerivationError> {
    vars.split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(DerivationError::InvalidConfig(format!(
                "expected KEY=value in OCR environment, got '{pair}'"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_base_drops_hocr_suffix() {
        assert_eq!(output_base(Path::new("/tmp/x/a.hocr")), PathBuf::from("/tmp/x/a"));
        assert_eq!(output_base(Path::new("/tmp/x/a.mono.hocr")), PathBuf::from("/tmp/x/a.mono"));
        assert_eq!(output_base(Path::new("/tmp/x/a.txt")), PathBuf::from("/tmp/x/a.txt"));
    }

    #[test]
    fn env_string_parsing() {
        let step = HocrStep::default()
            .env_string("OMP_THREAD_LIMIT=2  TESSDATA_PREFIX=/opt/share/tessdata EMPTY=")
            .unwrap();
        assert_eq!(
            step.env,
            vec![
                ("OMP_THREAD_LIMIT".to_string(), "2".to_string()),
                ("TESSDATA_PREFIX".to_string(), "/opt/share/tessdata".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
        assert!(HocrStep::default().env_string("novalue").is_err());
        assert!(HocrStep::default().env_string("=x").is_err());
    }

    #[test]
    fn default_limits_threads() {
        let step = HocrStep::default();
        assert_eq!(step.env, vec![("OMP_THREAD_LIMIT".to_string(), "1".to_string())]);
        assert_eq!(step.output_extension(), Some(OutputExtension::literal("hocr")));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let step = HocrStep::default().program("definitely-not-tesseract-xyz");
        let err = step
            .run_tesseract(&dir.path().join("a.tiff"), &dir.path().join("a.hocr"))
            .await
            .unwrap_err();
        assert!(matches!(err, DerivationError::ToolNotFound { program } if program == "definitely-not-tesseract-xyz"));
    }
}
