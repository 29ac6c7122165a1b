//! # s-zip-bundle: Stream Entries Into One ZIP Archive
//!
//! `s-zip-bundle` takes a sequence of file-like entries (directories, in-memory
//! buffers or readable streams) and packs them into a single ZIP archive, which
//! comes out as one entry: either fully buffered or as a live stream.
//!
//! ## Features
//!
//! - **Streaming Write**: entries are compressed on-the-fly, no temp files
//! - **Buffered or Streamed Output**: collect the archive in memory, or hand
//!   the byte stream downstream as it is produced
//! - **Portable Names**: `\` separators are rewritten to `/`
//! - **Pluggable Engine**: the [`ArchiveEngine`] trait separates entry mapping
//!   from the archive format
//!
//! ## Quick Start
//!
//! ```no_run
//! use s_zip_bundle::{BundleOptions, Contents, EntryStat, IncomingEntry, ZipBundler};
//! use std::time::SystemTime;
//!
//! # async fn example() -> s_zip_bundle::Result<()> {
//! let mut bundler = ZipBundler::new(BundleOptions::new("archive.zip")?);
//!
//! bundler.push(
//!     IncomingEntry::new("/work", "/work/src", "docs", Contents::Null)
//!         .with_stat(EntryStat::directory(SystemTime::now(), 0o40755)),
//! )?;
//! bundler.push(IncomingEntry::new(
//!     "/work",
//!     "/work/src",
//!     "docs/readme.txt",
//!     b"Hello, World!".to_vec(),
//! ))?;
//!
//! let archive = bundler.finish().await?.expect("one entry was archived");
//! assert_eq!(archive.path, std::path::Path::new("/work/src/archive.zip"));
//! # Ok(())
//! # }
//! ```
//!
//! ### Streaming large archives
//!
//! ```no_run
//! use s_zip_bundle::{BundleOptions, Contents, IncomingEntry, ZipBundler};
//!
//! # async fn example() -> s_zip_bundle::Result<()> {
//! let options = BundleOptions::new("big.zip")?.with_stream_output(true);
//! let mut bundler = ZipBundler::new(options);
//! bundler.push(IncomingEntry::from_path("/data", "/data", "/data/huge.bin").await?)?;
//!
//! if let Some(archive) = bundler.finish().await? {
//!     // The archive is written while it is copied to disk
//!     archive.write_to("/tmp/out").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod output;
pub mod writer;

pub use bundle::{bundle_stream, bundle_try_stream, ZipBundler};
pub use config::BundleOptions;
pub use engine::{ArchiveEngine, ArchiveOutput, DirectoryOptions, FileOptions, ZipEngine};
pub use entry::{ByteStream, Contents, EntryStat, IncomingEntry, OutputEntry};
pub use error::{BundleError, Result};
pub use writer::{CompressionMethod, ZipStreamWriter};
