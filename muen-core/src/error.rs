//! Error handling for this crate
use thiserror::Error;

/// A Result containing a MuenError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// A low-level error raised while resolving or operating on Muen SK
/// resources.
#[derive(Error, Debug, Clone, Copy)]
pub enum MuenError {
    #[error("subject information directory has an invalid magic")]
    SinfoBadMagic,
    #[error("requested resource was not found in the subject information directory")]
    ResourceNotFound,
    #[error("resource exists but is of the wrong kind")]
    ResourceKindMismatch,
    #[error("resource affinity predicate matched more than one entry")]
    AmbiguousAffinity,
    #[error("channel region is smaller than one header plus one element")]
    RegionTooSmall,
    #[error("memory region is not writable")]
    RegionNotWritable,
    #[error("channel protocol or transport does not match the reader")]
    IncompatibleInterface,
}

/// Combination of a MuenError with an anyhow error
#[derive(Error, Debug)]
#[error("{err:?}: {source:?}")]
pub struct TypedError {
    err: MuenError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: MuenError, source: anyhow::Error) -> Self {
        Self { err, source }
    }

    /// Returns the MuenError of this TypedError
    pub fn err(&self) -> MuenError {
        self.err
    }

    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: MuenError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: MuenError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}
