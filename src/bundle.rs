//! Bundling a sequence of entries into one archive entry
//!
//! [`ZipBundler`] is fed entries one at a time with [`push`](ZipBundler::push)
//! and produces the archive with [`finish`](ZipBundler::finish):
//!
//! ```no_run
//! use s_zip_bundle::{BundleOptions, IncomingEntry, ZipBundler};
//!
//! # async fn example() -> s_zip_bundle::Result<()> {
//! let mut bundler = ZipBundler::new(BundleOptions::new("site.zip")?);
//! bundler.push(IncomingEntry::new("/work", "/work/dist", "index.html", b"<html>".to_vec()))?;
//!
//! if let Some(archive) = bundler.finish().await? {
//!     archive.write_to("/work/out").await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::BundleOptions;
use crate::engine::{ArchiveEngine, DirectoryOptions, FileOptions, ZipEngine};
use crate::entry::{Contents, EntryStat, IncomingEntry, OutputEntry};
use crate::error::Result;
use crate::output::buffer_output;
use futures_util::{Stream, StreamExt, TryStream, TryStreamExt};
use log::debug;
use std::path::PathBuf;
use std::time::SystemTime;

/// Directory context of the first archived entry
#[derive(Debug, Clone)]
struct Origin {
    cwd: PathBuf,
    base: PathBuf,
}

/// Collects entries into an archive engine and emits the finished archive
pub struct ZipBundler<E: ArchiveEngine = ZipEngine> {
    options: BundleOptions,
    engine: E,
    origin: Option<Origin>,
}

impl ZipBundler<ZipEngine> {
    /// Create a bundler writing ZIP archives
    pub fn new(options: BundleOptions) -> Self {
        let engine = ZipEngine::with_compression(options.compression_level);
        Self::with_engine(options, engine)
    }
}

impl<E: ArchiveEngine> ZipBundler<E> {
    /// Create a bundler on top of a custom engine
    pub fn with_engine(options: BundleOptions, engine: E) -> Self {
        Self {
            options,
            engine,
            origin: None,
        }
    }

    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Whether no output origin has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.origin.is_none()
    }

    fn timestamp(&self, entry_mtime: Option<SystemTime>) -> SystemTime {
        self.options
            .modified_time
            .or(entry_mtime)
            .unwrap_or_else(SystemTime::now)
    }

    fn file_options(&self, stat: &EntryStat) -> FileOptions {
        FileOptions {
            compress: self.options.compress,
            mtime: self.timestamp(stat.mtime),
            mode: stat.mode,
        }
    }

    /// Map one entry onto an archive record
    ///
    /// Entries whose relative path is empty are skipped, as are entries with no
    /// contents that are not directories. Archive names always use `/`.
    pub fn push(&mut self, entry: IncomingEntry) -> Result<()> {
        let name = entry.relative().replace('\\', "/");
        if name.is_empty() {
            debug!("skipping entry with empty relative path: {:?}", entry.path);
            return Ok(());
        }

        if self.origin.is_none() {
            self.origin = Some(Origin {
                cwd: entry.cwd.clone(),
                base: entry.base.clone(),
            });
        }

        let stat = entry.stat.unwrap_or_default();
        match entry.contents {
            Contents::Null if stat.is_dir => {
                let options = DirectoryOptions {
                    mtime: self.timestamp(stat.mtime),
                };
                self.engine.add_empty_directory(&name, options)
            }
            Contents::Null => {
                debug!("skipping {:?}: no contents and not a directory", name);
                Ok(())
            }
            Contents::Stream(stream) => {
                let options = self.file_options(&stat);
                self.engine.add_read_stream(stream, &name, options)
            }
            Contents::Buffer(data) => {
                let options = self.file_options(&stat);
                self.engine.add_buffer(data, &name, options)
            }
        }
    }

    /// Finish the archive and produce the output entry
    ///
    /// Returns `None` when no entry was archived. The engine is ended in the same
    /// step its output is requested, so the archive is written while it is drained.
    pub async fn finish(mut self) -> Result<Option<OutputEntry>> {
        let Some(origin) = self.origin.take() else {
            debug!("no entries; {} not produced", self.options.filename());
            return Ok(None);
        };

        let output = self.engine.output_stream()?;
        self.engine.end()?;

        let contents = if self.options.stream_output {
            debug!("streaming {}", self.options.filename());
            Contents::Stream(output)
        } else {
            debug!("buffering {}", self.options.filename());
            Contents::Buffer(buffer_output(output, self.options.max_buffer_size).await?)
        };

        Ok(Some(OutputEntry {
            path: origin
                .base
                .join(self.options.filename().trim_start_matches(['/', '\\'])),
            cwd: origin.cwd,
            base: origin.base,
            contents,
        }))
    }
}

/// Bundle every entry of `entries` into one ZIP archive
pub async fn bundle_stream<S>(entries: S, options: BundleOptions) -> Result<Option<OutputEntry>>
where
    S: Stream<Item = IncomingEntry>,
{
    let mut bundler = ZipBundler::new(options);
    let mut entries = std::pin::pin!(entries);
    while let Some(entry) = entries.next().await {
        bundler.push(entry)?;
    }
    bundler.finish().await
}

/// Bundle a fallible stream of entries, stopping at the first error
pub async fn bundle_try_stream<S>(entries: S, options: BundleOptions) -> Result<Option<OutputEntry>>
where
    S: TryStream<Ok = IncomingEntry, Error = crate::error::BundleError>,
{
    let mut bundler = ZipBundler::new(options);
    let mut entries = std::pin::pin!(entries.into_stream());
    while let Some(entry) = entries.try_next().await? {
        bundler.push(entry)?;
    }
    bundler.finish().await
}
