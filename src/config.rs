//! Bundle configuration

use crate::error::{BundleError, Result};
use std::time::SystemTime;

/// Default DEFLATE compression level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Largest buffer a `Vec<u8>` can represent
pub const MAX_BUFFER_SIZE: usize = isize::MAX as usize;

/// Configuration for a single bundle run
///
/// Fixed at construction; every entry of the run sees the same options.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    filename: String,
    /// Compress file records with DEFLATE (default: true)
    pub compress: bool,
    /// Hand the archive downstream as a live stream instead of a buffer (default: false)
    pub stream_output: bool,
    /// Timestamp applied to every record, overriding per-entry modification times
    pub modified_time: Option<SystemTime>,
    /// DEFLATE level 0-9 (default: 6)
    pub compression_level: u32,
    /// Upper bound for the buffered archive (default: `isize::MAX`)
    pub max_buffer_size: usize,
}

impl BundleOptions {
    /// Create options for an archive named `filename`
    ///
    /// Fails with [`BundleError::MissingFilename`] when the name is empty or
    /// consists only of path separators.
    pub fn new(filename: impl Into<String>) -> Result<Self> {
        let filename = filename.into();
        if filename.trim_start_matches(['/', '\\']).is_empty() {
            return Err(BundleError::MissingFilename);
        }

        Ok(Self {
            filename,
            compress: true,
            stream_output: false,
            modified_time: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_buffer_size: MAX_BUFFER_SIZE,
        })
    }

    /// File name of the produced archive, joined onto the first entry's base
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Enable or disable compression of file records
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Select streamed (`true`) or buffered (`false`) output
    pub fn with_stream_output(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }

    /// Stamp every record with `time`
    pub fn with_modified_time(mut self, time: SystemTime) -> Self {
        self.modified_time = Some(time);
        self
    }

    /// Set the DEFLATE level
    pub fn with_compression_level(mut self, level: u32) -> Self {
        assert!(level <= 9, "compression level must be between 0 and 9");
        self.compression_level = level;
        self
    }

    /// Cap the size of the buffered archive
    ///
    /// Only consulted when `stream_output` is false.
    pub fn with_max_buffer_size(mut self, limit: usize) -> Self {
        self.max_buffer_size = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = BundleOptions::new("out.zip").unwrap();
        assert_eq!(options.filename(), "out.zip");
        assert!(options.compress);
        assert!(!options.stream_output);
        assert!(options.modified_time.is_none());
        assert_eq!(options.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(options.max_buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn empty_filename_is_rejected() {
        assert!(matches!(
            BundleOptions::new(""),
            Err(BundleError::MissingFilename)
        ));
        assert!(matches!(
            BundleOptions::new("/"),
            Err(BundleError::MissingFilename)
        ));
    }

    #[test]
    #[should_panic(expected = "compression level")]
    fn compression_level_out_of_range() {
        let _ = BundleOptions::new("out.zip")
            .unwrap()
            .with_compression_level(10);
    }
}
