//! Error types for s-zip-bundle

use std::io;
use thiserror::Error;

/// Result type for bundling operations
pub type Result<T> = std::result::Result<T, BundleError>;

/// Error types that can occur while bundling entries into a ZIP archive
#[derive(Debug, Error)]
pub enum BundleError {
    /// I/O error from an input stream, the archive engine or the output drain
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The output filename was missing or empty
    #[error("`filename` required")]
    MissingFilename,

    /// The finished archive does not fit in a single in-memory buffer
    #[error(
        "archive too large for buffered output (limit {limit} bytes); \
         use streaming output (stream_output) instead"
    )]
    OutputTooLarge {
        /// Largest buffer the drain was allowed to build
        limit: usize,
    },

    /// The archive engine was used out of order (add after end, output taken twice)
    #[error("Invalid archive engine state: {0}")]
    InvalidState(&'static str),

    /// A record could not be encoded as ZIP
    #[error("Invalid ZIP format: {0}")]
    InvalidFormat(String),
}

impl From<BundleError> for io::Error {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

impl BundleError {
    /// Recover a `BundleError` that travelled through an `io::Error`
    ///
    /// Errors raised inside the archive engine reach readers wrapped in
    /// `io::Error`; this restores the original variant. Plain I/O errors
    /// become [`BundleError::Io`].
    pub(crate) fn from_io(err: io::Error) -> Self {
        let wraps_bundle_error = err
            .get_ref()
            .map_or(false, |inner| inner.is::<BundleError>());
        if !wraps_bundle_error {
            return BundleError::Io(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<BundleError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => BundleError::Io(io::Error::new(kind, other)),
            None => BundleError::Io(io::Error::from(kind)),
        }
    }
}
