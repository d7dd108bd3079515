// THEORY:
// This file is the main entry point for the `classical_cv` library crate.
//
// The public surface is the `Dispatcher` (one synchronous call per request), the
// `DispatchPool` (the same calls fanned out over worker tasks) and the catalog
// types callers need to build requests: categories, algorithms, descriptors and
// parameter sets. The per-category operations and the Image Library backends live
// under `core_modules` and are reachable for callers who want to plug in their own
// library, but a shell never needs to touch them.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
pub use core_modules::library::{Capability, ImageLibrary, ImageprocLibrary, LibraryError};
#[cfg(feature = "opencv")]
pub use core_modules::library::OpencvLibrary;
pub use core_modules::params::{ParamKind, ParamSpec, ParamValue, ParameterSet};
pub use core_modules::registry::Registry;
pub use error::{DispatchError, DispatchResult};
pub use parallel_pipeline::DispatchPool;
pub use pipeline::{status_for, Dispatcher, DispatcherConfig, Fallback, Processed};
