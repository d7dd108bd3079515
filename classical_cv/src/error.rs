// THEORY:
// Every way a processing request can go wrong is named here. The taxonomy splits
// into selection problems (nothing was run), input problems (nothing was run) and
// library problems (the Image Library was called and refused or failed). Shells map
// these onto user-facing status strings; nothing in this crate panics on a bad request.

use crate::core_modules::library::LibraryError;
use thiserror::Error;

/// Failure of a registry or dispatch operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// No image was supplied, or the image has a zero dimension.
    #[error("no input image supplied")]
    MissingInput,
    /// The category string is not one of the five catalog categories.
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    /// The (category, name) pair is not registered.
    #[error("unknown algorithm `{name}` in category `{category}`")]
    UnknownAlgorithm { category: String, name: String },
    /// A second registration for an existing (category, name) pair.
    #[error("algorithm `{name}` is already registered in category `{category}`")]
    DuplicateKey { category: String, name: String },
    /// A parameter is unknown, mistyped, or outside its accepted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The Image Library raised an error while running the operation.
    #[error("{0}")]
    ProcessingFailure(String),
    /// The worker pool is shut down or a worker dropped the request.
    #[error("worker pool is not accepting requests")]
    WorkerUnavailable,
}

impl From<LibraryError> for DispatchError {
    fn from(error: LibraryError) -> Self {
        match error {
            LibraryError::InvalidParameter(message) => DispatchError::InvalidParameter(message),
            other => DispatchError::ProcessingFailure(other.to_string()),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
