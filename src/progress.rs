//! Observer hooks for derivation events.
//!
//! Attach an [`Arc<dyn DerivationObserver>`] with
//! [`crate::generator::GeneratorBuilder::observer`] to hear which cache tier
//! answered each input and when a build runs. Chained upstream generators
//! report to the same observer.
//!
//! # Example
//!
//! ```rust
//! use edgequake_derivatives::{DerivationObserver, Location};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct BuildCounter {
//!     builds: AtomicUsize,
//! }
//!
//! impl DerivationObserver for BuildCounter {
//!     fn on_build_complete(&self, _input: &Location, _output: &Location) {
//!         self.builds.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::storage::Location;
use std::sync::Arc;

/// Called by a generator as it evaluates its inputs.
///
/// Every method has a no-op default. Generators evaluate inputs one at a
/// time, so calls for one generator never overlap.
pub trait DerivationObserver: Send + Sync {
    /// Called once before the first input is resolved.
    ///
    /// # Arguments
    /// * `generator`: build step name, e.g. `"hocr"`
    /// * `inputs`: number of inputs that will be evaluated
    fn on_generator_start(&self, generator: &str, inputs: usize) {
        let _ = (generator, inputs);
    }

    /// The derivative was already at its destination.
    fn on_found_at_destination(&self, input: &Location, destination: &Location) {
        let _ = (input, destination);
    }

    /// The derivative was found at the preprocessed location.
    fn on_found_preprocessed(&self, input: &Location, preprocessed: &Location) {
        let _ = (input, preprocessed);
    }

    /// Neither tier had it; a build is starting.
    fn on_build_start(&self, input: &Location, destination: &Location) {
        let _ = (input, destination);
    }

    fn on_build_complete(&self, input: &Location, output: &Location) {
        let _ = (input, output);
    }

    /// Called once after every input has a result.
    fn on_generator_complete(&self, generator: &str, outputs: usize) {
        let _ = (generator, outputs);
    }
}

/// An observer that ignores everything. Used when none is configured.
pub struct NoopObserver;

impl DerivationObserver for NoopObserver {}

/// The shared observer type held by generators.
pub type Observer = Arc<dyn DerivationObserver>;
