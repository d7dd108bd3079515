// THEORY:
// Operations are the thin adapters between a merged `ParameterSet` and the Image
// Library. Each one reads its typed parameters, makes one or a few library calls,
// and converts or annotates the result into a fresh RGB image the same size as the
// input. They hold no state, so the same function pointer can serve any number of
// concurrent requests.
//
// One submodule per category; each exposes `register`, which adds that category's
// entries to a registry in catalog order.

pub mod edge_detection;
pub mod feature_detection;
pub mod image_processing;
pub mod object_detection;
pub mod segmentation;

use crate::core_modules::library::{LibraryError, LibraryResult};
use crate::core_modules::params::ParameterSet;
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;

/// Registers the whole catalog, category by category.
pub fn register_all(registry: &mut Registry) -> DispatchResult<()> {
    image_processing::register(registry)?;
    edge_detection::register(registry)?;
    feature_detection::register(registry)?;
    segmentation::register(registry)?;
    object_detection::register(registry)?;
    Ok(())
}

/// Reads an integer parameter that the library expects as an unsigned count or size.
pub(crate) fn unsigned(params: &ParameterSet, name: &str) -> LibraryResult<u32> {
    let value = params.int(name)?;
    u32::try_from(value)
        .map_err(|_| LibraryError::InvalidParameter(format!("`{name}` must be a non-negative integer, got {value}")))
}
