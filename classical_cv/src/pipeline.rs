// THEORY:
// The `pipeline` module is the top-level API of the crate. A `Dispatcher` owns the
// registry and an Image Library, and turns a (category, name, image, parameters)
// request into a processed image plus a status line.
//
// Capabilities are queried exactly once, when the dispatcher is built, and frozen
// into a routing table. Requests never re-query, so the same request always runs the
// same algorithm for the lifetime of the dispatcher.
//
// Nothing a caller sends can take the process down: selection and parameter
// problems are typed errors, library errors are mapped, and a panic inside the
// library is caught at this boundary and reported as a processing failure.

use crate::core_modules::descriptor::Algorithm;
use crate::core_modules::frame::{self, ImageShape};
use crate::core_modules::library::{Capability, ImageLibrary, ModelPaths};
use crate::core_modules::params::ParameterSet;
use crate::core_modules::registry::{Entry, Registry};
use crate::error::{DispatchError, DispatchResult};
use image::{DynamicImage, RgbImage};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for the Dispatcher and the worker pool built on top of it.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Directory holding the stock `haarcascade_*.xml` files.
    pub cascade_dir: Option<PathBuf>,
    /// Worker tasks in a `DispatchPool`.
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { cascade_dir: None, workers: num_cpus::get() }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `CV_CASCADE_DIR` and `CV_WORKERS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("CV_CASCADE_DIR") {
            config.cascade_dir = Some(PathBuf::from(dir));
        }
        if let Some(workers) = std::env::var("CV_WORKERS").ok().and_then(|v| v.parse::<usize>().ok()) {
            if workers > 0 {
                config.workers = workers;
            }
        }
        config
    }

    pub fn models(&self) -> ModelPaths {
        ModelPaths { cascade_dir: self.cascade_dir.clone() }
    }
}

/// Why a different algorithm ran than the one requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fallback {
    /// The capability the requested algorithm needs.
    pub missing: Capability,
    /// Name of the library that lacks it.
    pub library: &'static str,
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub image: RgbImage,
    pub requested: Algorithm,
    pub executed: Algorithm,
    pub fallback: Option<Fallback>,
    pub status: String,
}

/// Routes processing requests to registered operations.
pub struct Dispatcher {
    registry: Registry,
    library: Arc<dyn ImageLibrary>,
    /// Requested algorithm → (algorithm run instead, missing capability).
    routes: HashMap<Algorithm, (Algorithm, Capability)>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Builds a dispatcher over the default library for this build: OpenCV when the
    /// `opencv` feature is on, the pure-Rust backend otherwise.
    pub fn new(config: DispatcherConfig) -> DispatchResult<Self> {
        #[cfg(feature = "opencv")]
        let library: Arc<dyn ImageLibrary> =
            Arc::new(crate::core_modules::library::OpencvLibrary::new(config.models()));
        #[cfg(not(feature = "opencv"))]
        let library: Arc<dyn ImageLibrary> = Arc::new(crate::core_modules::library::ImageprocLibrary::new());
        Self::with_library(library, config)
    }

    pub fn with_library(library: Arc<dyn ImageLibrary>, config: DispatcherConfig) -> DispatchResult<Self> {
        let registry = Registry::standard()?;
        let available: Vec<Capability> =
            Capability::ALL.into_iter().filter(|capability| library.supports(*capability)).collect();
        tracing::debug!(library = library.name(), ?available, "queried image library capabilities");

        let mut routes = HashMap::new();
        for entry in registry.iter() {
            let descriptor = &entry.descriptor;
            if let (Some(missing), Some(fallback)) = (descriptor.requires, descriptor.fallback) {
                if !available.contains(&missing) {
                    tracing::info!(
                        requested = descriptor.name(),
                        fallback = fallback.name(),
                        %missing,
                        "routing to fallback"
                    );
                    routes.insert(descriptor.algorithm, (fallback, missing));
                }
            }
        }
        Ok(Self { registry, library, routes, config })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn library_name(&self) -> &'static str {
        self.library.name()
    }

    /// The algorithm that actually runs when `algorithm` is requested.
    pub fn route(&self, algorithm: Algorithm) -> Algorithm {
        self.routes.get(&algorithm).map_or(algorithm, |(fallback, _)| *fallback)
    }

    /// Runs one request. The caller's image is never modified.
    pub fn process(
        &self,
        category: &str,
        name: &str,
        image: Option<&DynamicImage>,
        params: &ParameterSet,
    ) -> DispatchResult<Processed> {
        let (image, shape) = match image.map(|image| (image, ImageShape::of(image))) {
            Some((image, shape)) if !shape.is_empty() => (image, shape),
            _ => return Err(DispatchError::MissingInput),
        };
        let span = tracing::info_span!(
            "process",
            category,
            algorithm = name,
            width = shape.width,
            height = shape.height,
            channels = shape.channels
        );
        let _guard = span.enter();

        let result = self.run(category, name, image, params);
        if let Err(error) = &result {
            tracing::warn!(%error, "request failed");
        }
        result
    }

    fn run(&self, category: &str, name: &str, image: &DynamicImage, params: &ParameterSet) -> DispatchResult<Processed> {
        let requested = self.registry.lookup(category, name)?;
        let merged = params.merged_with(requested.descriptor.params)?;
        let input = frame::normalize(image);

        let requested_algorithm = requested.descriptor.algorithm;
        let (entry, params, fallback): (&Entry, ParameterSet, Option<Fallback>) =
            match self.routes.get(&requested_algorithm) {
                Some((executed, missing)) => {
                    let entry = self.registry.get(*executed).ok_or_else(|| DispatchError::UnknownAlgorithm {
                        category: executed.category().name().to_string(),
                        name: executed.name().to_string(),
                    })?;
                    tracing::info!(ran = executed.name(), %missing, "fallback");
                    let projected = merged.projected_onto(entry.descriptor.params);
                    (entry, projected, Some(Fallback { missing: *missing, library: self.library.name() }))
                }
                None => (requested, merged, None),
            };
        tracing::debug!(executed = entry.descriptor.name(), params = %params, "invoking operation");

        let operation = entry.operation;
        let library = self.library.as_ref();
        let output = panic::catch_unwind(AssertUnwindSafe(|| operation(library, &input, &params)))
            .map_err(|payload| DispatchError::ProcessingFailure(panic_message(payload.as_ref())))??;

        if output.dimensions() != input.dimensions() {
            return Err(DispatchError::ProcessingFailure(format!(
                "{} produced a {}x{} image from a {}x{} input",
                entry.descriptor.name(),
                output.width(),
                output.height(),
                input.width(),
                input.height()
            )));
        }

        let executed = entry.descriptor.algorithm;
        let mut status = format!("Successfully applied {} algorithm.", requested_algorithm.name());
        if let Some(fallback) = &fallback {
            status.push_str(&format!(
                " ({} unavailable in {}; ran {} instead)",
                requested_algorithm.name(),
                fallback.library,
                executed.name()
            ));
        }
        Ok(Processed { image: output, requested: requested_algorithm, executed, fallback, status })
    }

    /// Presentation form of `process`: an image on success, `None` plus a
    /// user-facing message otherwise.
    pub fn respond(
        &self,
        category: &str,
        name: &str,
        image: Option<&DynamicImage>,
        params: &ParameterSet,
    ) -> (Option<RgbImage>, String) {
        match self.process(category, name, image, params) {
            Ok(processed) => (Some(processed.image), processed.status),
            Err(error) => (None, status_for(&error)),
        }
    }
}

/// User-facing status line for a failed request.
pub fn status_for(error: &DispatchError) -> String {
    match error {
        DispatchError::MissingInput => "Please upload an image first.".to_string(),
        DispatchError::UnknownCategory(_) | DispatchError::UnknownAlgorithm { .. } => {
            "Invalid algorithm type selected.".to_string()
        }
        other => format!("Error processing image: {other}"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("image library panicked: {detail}")
}
