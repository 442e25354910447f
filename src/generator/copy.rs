use super::BuildStep;
use crate::error::DerivationError;
use crate::storage::Location;
use crate::template::OutputExtension;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Byte-for-byte copy. Keeps the source's extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyStep;

#[async_trait]
impl BuildStep for CopyStep {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn output_extension(&self) -> Option<OutputExtension> {
        Some(OutputExtension::InheritSource)
    }

    async fn build(
        &self,
        input: &Location,
        destination: &Location,
        staged_input: &Path,
    ) -> Result<Location, DerivationError> {
        destination
            .stage_for_write(|out| async move {
                let bytes = tokio::fs::copy(staged_input, &out)
                    .await
                    .map_err(|e| DerivationError::io(&out, e))?;
                debug!(from = %input, to = %destination, bytes, "Copied");
                Ok(())
            })
            .await?;
        Ok(destination.clone())
    }
}
