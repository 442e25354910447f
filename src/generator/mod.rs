//! Derivation pipeline.
//!
//! A [`Generator`] turns input locations into derived locations with one
//! [`BuildStep`]. For each input it looks in two places before building:
//!
//! ```text
//!  input ──derive(output template)──▶ destination exists? ── yes ──▶ destination
//!                                          │ no
//!         ──derive(preprocessed)─────▶ preprocessed exists? ── yes ──▶ promote / use as-is
//!                                          │ no
//!                                     stage input, build into destination
//! ```
//!
//! A generator may depend on an upstream generator. The upstream runs over
//! the same inputs first and its outputs become this generator's inputs; the
//! OCR step, for example, reads the monochrome images produced upstream.
//!
//! Evaluation is sequential and memoised: the first call to
//! [`Generator::evaluate`] does the work, later calls return the same
//! locations.

pub mod copy;
pub mod hocr;
pub mod monochrome;
pub mod render;
pub mod split;
pub mod thumbnail;

pub use copy::CopyStep;
pub use hocr::HocrStep;
pub use monochrome::MonochromeStep;
pub use render::RenderOptions;
pub use split::{PageSplitter, PdfiumSplitter, SplitFormat, SplitGenerator, SplitGeneratorBuilder};
pub use thumbnail::{ThumbnailSize, ThumbnailStep};

use crate::error::DerivationError;
use crate::progress::{NoopObserver, Observer};
use crate::storage::{Location, Registry};
use crate::template::{upstream_template, OutputExtension};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// One kind of derivative.
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Short name used in logs and errors, e.g. `"hocr"`.
    fn name(&self) -> &'static str;

    /// Extension of the derived file. `None` is rejected when a generator is built.
    fn output_extension(&self) -> Option<OutputExtension>;

    /// Produce the derivative of `input` at `destination`.
    ///
    /// `staged_input` is a local copy of `input`, valid for the duration of
    /// the call. Implementations normally open a write scope on
    /// `destination` and return it.
    async fn build(
        &self,
        input: &Location,
        destination: &Location,
        staged_input: &Path,
    ) -> Result<Location, DerivationError>;
}

/// What to do with a derivative found at the preprocessed location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Promotion {
    /// Copy it into the destination and return the destination.
    #[default]
    CopyToDestination,
    /// Return the preprocessed location itself.
    UsePreprocessed,
}

/// Which tier answered for an input.
enum Resolution {
    AtDestination(Location),
    Preprocessed { found: Location, result: Location },
    Build(Location),
}

/// A derivation request over an ordered list of inputs.
pub struct Generator {
    step: Arc<dyn BuildStep>,
    extension: OutputExtension,
    inputs: Vec<Location>,
    output_template: String,
    preprocessed_template: Option<String>,
    upstream: Option<Box<Generator>>,
    promotion: Promotion,
    observer: Observer,
    results: OnceCell<Vec<Location>>,
}

impl Generator {
    pub fn builder(step: impl BuildStep + 'static) -> GeneratorBuilder {
        Self::builder_shared(Arc::new(step))
    }

    pub fn builder_shared(step: Arc<dyn BuildStep>) -> GeneratorBuilder {
        GeneratorBuilder {
            step,
            inputs: Vec::new(),
            output_template: None,
            preprocessed_template: None,
            upstream: None,
            promotion: Promotion::default(),
            observer: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.step.name()
    }

    pub fn inputs(&self) -> &[Location] {
        &self.inputs
    }

    pub fn output_template(&self) -> &str {
        &self.output_template
    }

    pub fn upstream(&self) -> Option<&Generator> {
        self.upstream.as_deref()
    }

    /// Evaluate every input, building what is missing.
    pub async fn evaluate(&self) -> Result<Vec<Location>, DerivationError> {
        self.results
            .get_or_try_init(|| self.run())
            .await
            .cloned()
    }

    /// [`evaluate`](Self::evaluate), as URI strings.
    pub async fn evaluated_uris(&self) -> Result<Vec<String>, DerivationError> {
        Ok(self
            .evaluate()
            .await?
            .iter()
            .map(|l| l.as_str().to_string())
            .collect())
    }

    /// Synchronous wrapper around [`evaluate`](Self::evaluate).
    ///
    /// Creates a temporary tokio runtime internally; do not call from async code.
    pub fn evaluate_blocking(&self) -> Result<Vec<Location>, DerivationError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| DerivationError::Internal(format!("Failed to create tokio runtime: {e}")))?
            .block_on(self.evaluate())
    }

    /// Where the derivative of `input` is, or will be once built.
    ///
    /// Promotes a preprocessed hit into the destination when the promotion
    /// policy says so.
    pub async fn resolve_destination(&self, input: &Location) -> Result<Location, DerivationError> {
        Ok(match self.resolve(input).await? {
            Resolution::AtDestination(loc) | Resolution::Build(loc) => loc,
            Resolution::Preprocessed { result, .. } => result,
        })
    }

    // Boxed so the recursive call into an upstream generator has a sized future.
    fn run(&self) -> BoxFuture<'_, Result<Vec<Location>, DerivationError>> {
        async move {
            let requisites = match &self.upstream {
                Some(upstream) => {
                    debug!(generator = self.name(), upstream = upstream.name(), "Evaluating upstream");
                    upstream.evaluate().await?
                }
                None => self.inputs.clone(),
            };

            info!(
                generator = self.name(),
                inputs = requisites.len(),
                template = %self.output_template,
                "Evaluating generator"
            );
            self.observer.on_generator_start(self.name(), requisites.len());

            let mut outputs = Vec::with_capacity(requisites.len());
            for input in &requisites {
                let output = match self.resolve(input).await? {
                    Resolution::AtDestination(destination) => {
                        self.observer.on_found_at_destination(input, &destination);
                        destination
                    }
                    Resolution::Preprocessed { found, result } => {
                        self.observer.on_found_preprocessed(input, &found);
                        result
                    }
                    Resolution::Build(destination) => self.build_one(input, &destination).await?,
                };
                outputs.push(output);
            }

            self.observer.on_generator_complete(self.name(), outputs.len());
            Ok(outputs)
        }
        .boxed()
    }

    async fn resolve(&self, input: &Location) -> Result<Resolution, DerivationError> {
        let destination = input.derive_with(&self.output_template, Some(&self.extension), None)?;
        if destination.exists().await? {
            info!(generator = self.name(), input = %input, destination = %destination, "Found at destination");
            return Ok(Resolution::AtDestination(destination));
        }

        if let Some(template) = &self.preprocessed_template {
            let preprocessed = input.derive_with(template, Some(&self.extension), None)?;
            if preprocessed.exists().await? {
                info!(
                    generator = self.name(),
                    input = %input,
                    preprocessed = %preprocessed,
                    promotion = ?self.promotion,
                    "Found preprocessed"
                );
                let result = match self.promotion {
                    Promotion::CopyToDestination => promote(&preprocessed, &destination).await?,
                    Promotion::UsePreprocessed => preprocessed.clone(),
                };
                return Ok(Resolution::Preprocessed {
                    found: preprocessed,
                    result,
                });
            }
        }

        debug!(generator = self.name(), input = %input, destination = %destination, "Not found, will build");
        Ok(Resolution::Build(destination))
    }

    async fn build_one(
        &self,
        input: &Location,
        destination: &Location,
    ) -> Result<Location, DerivationError> {
        info!(generator = self.name(), input = %input, destination = %destination, "Building");
        self.observer.on_build_start(input, destination);

        let step = &self.step;
        let output = input
            .stage_for_read(|staged| async move { step.build(input, destination, &staged).await })
            .await?;

        self.observer.on_build_complete(input, &output);
        Ok(output)
    }
}

/// Copy a preprocessed derivative into its destination.
pub(crate) async fn promote(
    preprocessed: &Location,
    destination: &Location,
) -> Result<Location, DerivationError> {
    info!(from = %preprocessed, to = %destination, "Promoting preprocessed derivative");
    preprocessed
        .stage_for_read(|staged| async move {
            CopyStep.build(preprocessed, destination, &staged).await
        })
        .await
}

enum Upstream {
    Generator(Box<Generator>),
    Step(Arc<dyn BuildStep>),
}

/// Builder for [`Generator`].
pub struct GeneratorBuilder {
    step: Arc<dyn BuildStep>,
    inputs: Vec<String>,
    output_template: Option<String>,
    preprocessed_template: Option<String>,
    upstream: Option<Upstream>,
    promotion: Promotion,
    observer: Option<Observer>,
}

impl GeneratorBuilder {
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

    /// Depend on an already-built generator; its outputs become this
    /// generator's inputs and the inputs given here are ignored.
    pub fn upstream(mut self, generator: Generator) -> Self {
        self.upstream = Some(Upstream::Generator(Box::new(generator)));
        self
    }

    /// Depend on `step` run over the same inputs, writing beside this
    /// generator's outputs.
    pub fn requires(self, step: impl BuildStep + 'static) -> Self {
        self.requires_shared(Arc::new(step))
    }

    pub fn requires_shared(mut self, step: Arc<dyn BuildStep>) -> Self {
        self.upstream = Some(Upstream::Step(step));
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

    /// Resolve the inputs and validate the request.
    pub fn build(self, registry: &Registry) -> Result<Generator, DerivationError> {
        let extension = self
            .step
            .output_extension()
            .ok_or_else(|| DerivationError::MissingOutputExtension {
                generator: self.step.name().to_string(),
            })?;
        let output_template = self.output_template.ok_or_else(|| {
            DerivationError::InvalidConfig(format!(
                "generator '{}' needs an output template",
                self.step.name()
            ))
        })?;
        let observer = self.observer.unwrap_or_else(|| Arc::new(NoopObserver));

        let upstream = match self.upstream {
            None => None,
            Some(Upstream::Generator(g)) => Some(g),
            Some(Upstream::Step(step)) => {
                let mut builder = Generator::builder_shared(step)
                    .inputs(self.inputs.iter().cloned())
                    .output_template(upstream_template(&output_template))
                    .promotion(self.promotion)
                    .observer(Arc::clone(&observer));
                if let Some(pre) = &self.preprocessed_template {
                    builder = builder.preprocessed_template(upstream_template(pre));
                }
                Some(Box::new(builder.build(registry)?))
            }
        };

        let inputs = self
            .inputs
            .iter()
            .map(|uri| registry.location(uri))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Generator {
            step: self.step,
            extension,
            inputs,
            output_template,
            preprocessed_template: self.preprocessed_template,
            upstream,
            promotion: self.promotion,
            observer,
            results: OnceCell::new(),
        })
    }
}
