//! Async ZIP record writer that compresses data on-the-fly
//!
//! Writes local headers, entry data, data descriptors and the central directory
//! to any `AsyncWrite`. The output never needs to seek: offsets are tracked by
//! counting the bytes written, so pipes and sockets work as well as files.
//!
//! Every file record uses a data descriptor (general purpose bit 3), which lets
//! entries of unknown length be streamed straight through the encoder.

use crate::error::{BundleError, Result};
use async_compression::tokio::write::DeflateEncoder;
use chrono::{DateTime, Datelike, Local, Timelike};
use crc32fast::Hasher as Crc32;
use log::trace;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the chunks read from entry sources
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Data descriptor present, names are UTF-8
const FILE_FLAGS: u16 = 0x0008 | 0x0800;
/// Names are UTF-8
const DIRECTORY_FLAGS: u16 = 0x0800;

const VERSION_NEEDED: u16 = 20;
/// Version made by: MS-DOS host, spec 2.0
const VERSION_MADE_BY_DOS: u16 = 20;
/// Version made by: Unix host, spec 2.0
const VERSION_MADE_BY_UNIX: u16 = (3 << 8) | 20;

/// MS-DOS directory attribute
const DOS_DIRECTORY_ATTR: u32 = 0x10;

/// Compression method to use for a ZIP entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression (stored)
    Stored,
    /// DEFLATE compression
    Deflate,
}

impl CompressionMethod {
    pub(crate) fn to_zip_method(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

/// Per-record metadata for a file entry
#[derive(Debug, Clone, Copy)]
pub struct RecordOptions {
    pub method: CompressionMethod,
    pub mtime: SystemTime,
    /// POSIX mode stored in the external attributes
    pub mode: Option<u32>,
}

/// Entry already written, kept for the central directory
struct ZipEntry {
    name: String,
    local_header_offset: u64,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    compression_method: u16,
    flags: u16,
    dos_time: u16,
    dos_date: u16,
    version_made_by: u16,
    external_attrs: u32,
}

/// Trait for async compression encoders
trait AsyncCompressorWrite: AsyncWrite + Unpin + Send {
    fn finish_compression(
        self: Box<Self>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<CompressedBuffer>> + Send>>;
    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer;
}

struct DeflateCompressor {
    encoder: DeflateEncoder<CompressedBuffer>,
}

impl AsyncWrite for DeflateCompressor {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.encoder).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.encoder).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.encoder).poll_shutdown(cx)
    }
}

impl AsyncCompressorWrite for DeflateCompressor {
    fn finish_compression(
        mut self: Box<Self>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<CompressedBuffer>> + Send>> {
        Box::pin(async move {
            self.encoder.shutdown().await?;
            Ok(self.encoder.into_inner())
        })
    }

    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer {
        self.encoder.get_mut()
    }
}

/// Pass-through "encoder" for stored entries
struct StoredCompressor {
    buffer: CompressedBuffer,
}

impl AsyncWrite for StoredCompressor {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.buffer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncCompressorWrite for StoredCompressor {
    fn finish_compression(
        self: Box<Self>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<CompressedBuffer>> + Send>> {
        Box::pin(async move { Ok(self.buffer) })
    }

    fn get_buffer_mut(&mut self) -> &mut CompressedBuffer {
        &mut self.buffer
    }
}

/// Metadata tracker for CRC and byte counts
struct CrcCounter {
    crc: Crc32,
    uncompressed_count: u64,
    compressed_count: u64,
}

impl CrcCounter {
    fn new() -> Self {
        Self {
            crc: Crc32::new(),
            uncompressed_count: 0,
            compressed_count: 0,
        }
    }

    fn update_uncompressed(&mut self, data: &[u8]) {
        self.crc.update(data);
        self.uncompressed_count += data.len() as u64;
    }

    fn add_compressed(&mut self, count: u64) {
        self.compressed_count += count;
    }

    fn finalize(&self) -> u32 {
        self.crc.clone().finalize()
    }
}

/// Buffered sink for compressed data with a flush threshold
struct CompressedBuffer {
    buffer: Vec<u8>,
    flush_threshold: usize,
}

impl CompressedBuffer {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024), // 64KB initial capacity
            flush_threshold: 1024 * 1024,          // 1MB threshold
        }
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn should_flush(&self) -> bool {
        self.buffer.len() >= self.flush_threshold
    }
}

impl AsyncWrite for CompressedBuffer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Convert a timestamp to MS-DOS `(time, date)` in local time
///
/// MS-DOS dates cover 1980-01-01 through 2107-12-31 with 2-second precision;
/// earlier and later times are clamped to the ends of that range.
pub(crate) fn dos_date_time(time: SystemTime) -> (u16, u16) {
    const EARLIEST: (u16, u16) = (0, (1 << 5) | 1);
    const LATEST: (u16, u16) = ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);

    let Ok(elapsed) = time.duration_since(UNIX_EPOCH) else {
        return EARLIEST;
    };
    // Out-of-range times never reach the local time zone conversion
    let utc = i64::try_from(elapsed.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    let local = match utc {
        Some(utc) if utc.year() <= 2108 => utc.with_timezone(&Local),
        _ => return LATEST,
    };

    let year = local.year();
    if year < 1980 {
        return EARLIEST;
    }
    if year > 2107 {
        return LATEST;
    }

    let dos_time = (local.hour() << 11) | (local.minute() << 5) | (local.second() / 2);
    let dos_date = (((year - 1980) as u32) << 9) | (local.month() << 5) | local.day();
    (dos_time as u16, dos_date as u16)
}

/// Streaming ZIP writer over an arbitrary async output
pub struct ZipStreamWriter<W: AsyncWrite + Unpin> {
    output: W,
    position: u64,
    entries: Vec<ZipEntry>,
    compression_level: u32,
}

impl<W: AsyncWrite + Unpin> ZipStreamWriter<W> {
    /// Create a writer with default compression level (6)
    pub fn new(output: W) -> Self {
        Self::with_compression(output, 6)
    }

    /// Create a writer with custom DEFLATE level (0-9)
    pub fn with_compression(output: W, compression_level: u32) -> Self {
        Self {
            output,
            position: 0,
            entries: Vec::new(),
            compression_level,
        }
    }

    /// Bytes written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of records written so far
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.output.write_all(data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn check_name(name: &str) -> Result<()> {
        if name.len() > u16::MAX as usize {
            return Err(BundleError::InvalidFormat(format!(
                "entry name is {} bytes long, the limit is {}",
                name.len(),
                u16::MAX
            )));
        }
        Ok(())
    }

    async fn write_local_header(
        &mut self,
        name: &str,
        flags: u16,
        compression_method: u16,
        dos_time: u16,
        dos_date: u16,
    ) -> Result<()> {
        let mut header = Vec::with_capacity(30 + name.len());
        header.extend_from_slice(&[0x50, 0x4b, 0x03, 0x04]); // signature
        header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        header.extend_from_slice(&flags.to_le_bytes());
        header.extend_from_slice(&compression_method.to_le_bytes());
        header.extend_from_slice(&dos_time.to_le_bytes());
        header.extend_from_slice(&dos_date.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // crc32 (in descriptor / zero)
        header.extend_from_slice(&0u32.to_le_bytes()); // compressed size
        header.extend_from_slice(&0u32.to_le_bytes()); // uncompressed size
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // extra len
        header.extend_from_slice(name.as_bytes());
        self.write_raw(&header).await
    }

    /// Write an empty directory record
    ///
    /// A trailing `/` is appended to `name` when missing. Directory records
    /// never carry a POSIX mode.
    pub async fn add_directory(&mut self, name: &str, mtime: SystemTime) -> Result<()> {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{}/", name)
        };
        Self::check_name(&name)?;

        let local_header_offset = self.position;
        let (dos_time, dos_date) = dos_date_time(mtime);
        self.write_local_header(&name, DIRECTORY_FLAGS, 0, dos_time, dos_date)
            .await?;

        trace!("directory record {:?} at offset {}", name, local_header_offset);

        self.entries.push(ZipEntry {
            name,
            local_header_offset,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            compression_method: 0,
            flags: DIRECTORY_FLAGS,
            dos_time,
            dos_date,
            version_made_by: VERSION_MADE_BY_DOS,
            external_attrs: DOS_DIRECTORY_ATTR,
        });
        Ok(())
    }

    /// Write a file record, reading its data from `source` until EOF
    pub async fn add_file<R: AsyncRead + Unpin>(
        &mut self,
        name: &str,
        source: &mut R,
        options: RecordOptions,
    ) -> Result<()> {
        Self::check_name(name)?;

        let local_header_offset = self.position;
        let compression_method = options.method.to_zip_method();
        let (dos_time, dos_date) = dos_date_time(options.mtime);
        self.write_local_header(name, FILE_FLAGS, compression_method, dos_time, dos_date)
            .await?;

        let mut encoder: Box<dyn AsyncCompressorWrite> = match options.method {
            CompressionMethod::Deflate => {
                let level = match self.compression_level {
                    0 => async_compression::Level::Fastest,
                    1..=3 => async_compression::Level::Precise(self.compression_level as i32),
                    4..=6 => async_compression::Level::Default,
                    7..=9 => async_compression::Level::Best,
                    _ => async_compression::Level::Default,
                };
                Box::new(DeflateCompressor {
                    encoder: DeflateEncoder::with_quality(CompressedBuffer::new(), level),
                })
            }
            CompressionMethod::Stored => Box::new(StoredCompressor {
                buffer: CompressedBuffer::new(),
            }),
        };
        let mut counter = CrcCounter::new();

        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            counter.update_uncompressed(&chunk[..n]);
            encoder.write_all(&chunk[..n]).await?;

            // Keep memory bounded on large entries
            let buffer = encoder.get_buffer_mut();
            if buffer.should_flush() {
                let compressed_data = buffer.take();
                self.write_raw(&compressed_data).await?;
                counter.add_compressed(compressed_data.len() as u64);
            }
        }

        let mut buffer = encoder.finish_compression().await?;
        let remaining_data = buffer.take();
        if !remaining_data.is_empty() {
            self.write_raw(&remaining_data).await?;
            counter.add_compressed(remaining_data.len() as u64);
        }

        let crc = counter.finalize();
        let compressed_size = counter.compressed_count;
        let uncompressed_size = counter.uncompressed_count;

        // Data descriptor, 64-bit sizes when they overflow 32 bits
        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&[0x50, 0x4b, 0x07, 0x08]);
        descriptor.extend_from_slice(&crc.to_le_bytes());
        if compressed_size > u32::MAX as u64 || uncompressed_size > u32::MAX as u64 {
            descriptor.extend_from_slice(&compressed_size.to_le_bytes());
            descriptor.extend_from_slice(&uncompressed_size.to_le_bytes());
        } else {
            descriptor.extend_from_slice(&(compressed_size as u32).to_le_bytes());
            descriptor.extend_from_slice(&(uncompressed_size as u32).to_le_bytes());
        }
        self.write_raw(&descriptor).await?;

        trace!(
            "file record {:?} at offset {}: {} -> {} bytes",
            name,
            local_header_offset,
            uncompressed_size,
            compressed_size
        );

        let (version_made_by, external_attrs) = match options.mode {
            Some(mode) => (VERSION_MADE_BY_UNIX, (mode & 0xFFFF) << 16),
            None => (VERSION_MADE_BY_DOS, 0),
        };

        self.entries.push(ZipEntry {
            name: name.to_string(),
            local_header_offset,
            crc32: crc,
            compressed_size,
            uncompressed_size,
            compression_method,
            flags: FILE_FLAGS,
            dos_time,
            dos_date,
            version_made_by,
            external_attrs,
        });
        Ok(())
    }

    /// Finish the archive (central directory and end records) and return the output
    ///
    /// The output is flushed and shut down, which signals EOF to pipe readers.
    pub async fn finish(mut self) -> Result<W> {
        let central_dir_offset = self.position;

        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let mut record = Vec::with_capacity(46 + entry.name.len());
            record.extend_from_slice(&[0x50, 0x4b, 0x01, 0x02]); // central dir sig
            record.extend_from_slice(&entry.version_made_by.to_le_bytes());
            record.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            record.extend_from_slice(&entry.flags.to_le_bytes());
            record.extend_from_slice(&entry.compression_method.to_le_bytes());
            record.extend_from_slice(&entry.dos_time.to_le_bytes());
            record.extend_from_slice(&entry.dos_date.to_le_bytes());
            record.extend_from_slice(&entry.crc32.to_le_bytes());

            // Sizes (32-bit or 0xFFFFFFFF with the real value in the ZIP64 extra)
            if entry.compressed_size > u32::MAX as u64 {
                record.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes());
            } else {
                record.extend_from_slice(&(entry.compressed_size as u32).to_le_bytes());
            }
            if entry.uncompressed_size > u32::MAX as u64 {
                record.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes());
            } else {
                record.extend_from_slice(&(entry.uncompressed_size as u32).to_le_bytes());
            }

            record.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());

            let mut extra_field: Vec<u8> = Vec::new();
            if entry.uncompressed_size > u32::MAX as u64
                || entry.compressed_size > u32::MAX as u64
                || entry.local_header_offset > u32::MAX as u64
            {
                // ZIP64 extra header ID 0x0001
                extra_field.extend_from_slice(&0x0001u16.to_le_bytes());
                let mut data: Vec<u8> = Vec::new();
                if entry.uncompressed_size > u32::MAX as u64 {
                    data.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
                }
                if entry.compressed_size > u32::MAX as u64 {
                    data.extend_from_slice(&entry.compressed_size.to_le_bytes());
                }
                if entry.local_header_offset > u32::MAX as u64 {
                    data.extend_from_slice(&entry.local_header_offset.to_le_bytes());
                }
                extra_field.extend_from_slice(&(data.len() as u16).to_le_bytes());
                extra_field.extend_from_slice(&data);
            }

            record.extend_from_slice(&(extra_field.len() as u16).to_le_bytes());
            record.extend_from_slice(&0u16.to_le_bytes()); // file comment len
            record.extend_from_slice(&0u16.to_le_bytes()); // disk number start
            record.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            record.extend_from_slice(&entry.external_attrs.to_le_bytes());

            if entry.local_header_offset > u32::MAX as u64 {
                record.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes());
            } else {
                record.extend_from_slice(&(entry.local_header_offset as u32).to_le_bytes());
            }

            record.extend_from_slice(entry.name.as_bytes());
            record.extend_from_slice(&extra_field);
            self.write_raw(&record).await?;
        }

        let central_dir_size = self.position - central_dir_offset;

        let need_zip64 = entries.len() >= u16::MAX as usize
            || central_dir_size >= u32::MAX as u64
            || central_dir_offset >= u32::MAX as u64;

        let mut end = Vec::with_capacity(98);
        if need_zip64 {
            let zip64_eocd_pos = self.position;

            // ZIP64 end of central directory record
            end.extend_from_slice(&[0x50, 0x4b, 0x06, 0x06]);
            end.extend_from_slice(&44u64.to_le_bytes()); // size of the remaining record
            end.extend_from_slice(&VERSION_MADE_BY_DOS.to_le_bytes());
            end.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            end.extend_from_slice(&0u32.to_le_bytes()); // disk number
            end.extend_from_slice(&0u32.to_le_bytes()); // disk with central dir
            end.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            end.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            end.extend_from_slice(&central_dir_size.to_le_bytes());
            end.extend_from_slice(&central_dir_offset.to_le_bytes());

            // ZIP64 end of central directory locator
            end.extend_from_slice(&[0x50, 0x4b, 0x06, 0x07]);
            end.extend_from_slice(&0u32.to_le_bytes());
            end.extend_from_slice(&zip64_eocd_pos.to_le_bytes());
            end.extend_from_slice(&1u32.to_le_bytes()); // total number of disks
        }

        // End of central directory (classic)
        let entry_count = entries.len().min(u16::MAX as usize) as u16;
        end.extend_from_slice(&[0x50, 0x4b, 0x05, 0x06]);
        end.extend_from_slice(&0u16.to_le_bytes()); // disk number
        end.extend_from_slice(&0u16.to_le_bytes()); // disk with central dir
        end.extend_from_slice(&entry_count.to_le_bytes());
        end.extend_from_slice(&entry_count.to_le_bytes());
        end.extend_from_slice(&(central_dir_size.min(u32::MAX as u64) as u32).to_le_bytes());
        end.extend_from_slice(&(central_dir_offset.min(u32::MAX as u64) as u32).to_le_bytes());
        end.extend_from_slice(&0u16.to_le_bytes()); // comment len
        self.write_raw(&end).await?;

        self.output.flush().await?;
        self.output.shutdown().await?;

        Ok(self.output)
    }
}
