//! Archive engines
//!
//! An [`ArchiveEngine`] accumulates directory and file records and, once ended,
//! produces the encoded archive as a byte stream. [`ZipEngine`] is the ZIP
//! implementation: records are queued in arrival order and pumped through a
//! [`ZipStreamWriter`] by a Tokio task into an in-process pipe.

use crate::entry::ByteStream;
use crate::error::{BundleError, Result};
use crate::writer::{CompressionMethod, RecordOptions, ZipStreamWriter};
use log::{debug, trace};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::SystemTime;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default capacity of the pipe between the pump task and the output reader (64KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Options for a file record
#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    /// Compress with DEFLATE, otherwise store
    pub compress: bool,
    pub mtime: SystemTime,
    /// POSIX mode, if known
    pub mode: Option<u32>,
}

/// Options for an empty directory record
///
/// Directory records carry no mode: POSIX modes on directory entries produce
/// archives that some platforms refuse to open.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryOptions {
    pub mtime: SystemTime,
}

/// Engine that turns a sequence of records into an archive byte stream
pub trait ArchiveEngine: Send {
    /// Queue an empty directory at `path`
    fn add_empty_directory(&mut self, path: &str, options: DirectoryOptions) -> Result<()>;

    /// Queue a file whose contents are already in memory
    fn add_buffer(&mut self, data: Vec<u8>, path: &str, options: FileOptions) -> Result<()>;

    /// Queue a file whose contents are read from `stream` when the record is written
    fn add_read_stream(&mut self, stream: ByteStream, path: &str, options: FileOptions)
        -> Result<()>;

    /// Close the record queue; no further adds are accepted
    fn end(&mut self) -> Result<()>;

    /// Take the stream producing the encoded archive
    ///
    /// May be requested before or after [`end`](ArchiveEngine::end); the stream
    /// completes only once the engine has been ended.
    fn output_stream(&mut self) -> Result<ByteStream>;
}

/// Queued record
enum Record {
    Directory {
        name: String,
        options: DirectoryOptions,
    },
    Buffer {
        name: String,
        data: Vec<u8>,
        options: FileOptions,
    },
    Stream {
        name: String,
        stream: ByteStream,
        options: FileOptions,
    },
}

/// ZIP archive engine
pub struct ZipEngine {
    queue: Option<mpsc::UnboundedSender<Record>>,
    pending: Option<mpsc::UnboundedReceiver<Record>>,
    compression_level: u32,
    pipe_capacity: usize,
}

impl Default for ZipEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipEngine {
    /// Create an engine with default compression level (6)
    pub fn new() -> Self {
        Self::with_compression(6)
    }

    /// Create an engine with custom DEFLATE level (0-9)
    pub fn with_compression(compression_level: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queue: Some(tx),
            pending: Some(rx),
            compression_level,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Set the capacity of the output pipe
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be at least 1 byte");
        self.pipe_capacity = capacity;
        self
    }

    fn enqueue(&mut self, record: Record) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or(BundleError::InvalidState("record added after end"))?;
        queue
            .send(record)
            .map_err(|_| BundleError::InvalidState("archive output was dropped"))
    }
}

impl ArchiveEngine for ZipEngine {
    fn add_empty_directory(&mut self, path: &str, options: DirectoryOptions) -> Result<()> {
        self.enqueue(Record::Directory {
            name: path.to_string(),
            options,
        })
    }

    fn add_buffer(&mut self, data: Vec<u8>, path: &str, options: FileOptions) -> Result<()> {
        self.enqueue(Record::Buffer {
            name: path.to_string(),
            data,
            options,
        })
    }

    fn add_read_stream(
        &mut self,
        stream: ByteStream,
        path: &str,
        options: FileOptions,
    ) -> Result<()> {
        self.enqueue(Record::Stream {
            name: path.to_string(),
            stream,
            options,
        })
    }

    fn end(&mut self) -> Result<()> {
        // Dropping the sender lets the pump drain what is queued, then finish
        self.queue
            .take()
            .map(drop)
            .ok_or(BundleError::InvalidState("engine already ended"))
    }

    fn output_stream(&mut self) -> Result<ByteStream> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BundleError::InvalidState("archive output requires a Tokio runtime"))?;
        let records = self
            .pending
            .take()
            .ok_or(BundleError::InvalidState("archive output already taken"))?;

        let (reader, writer) = tokio::io::duplex(self.pipe_capacity);
        let task = runtime.spawn(pump(records, writer, self.compression_level));

        Ok(Box::new(ArchiveOutput {
            reader,
            task: Some(task),
        }))
    }
}

fn record_options(options: &FileOptions) -> RecordOptions {
    RecordOptions {
        method: if options.compress {
            CompressionMethod::Deflate
        } else {
            CompressionMethod::Stored
        },
        mtime: options.mtime,
        mode: options.mode,
    }
}

/// Write queued records into `output` until the queue is closed, then finish the archive
async fn pump(
    mut records: mpsc::UnboundedReceiver<Record>,
    output: DuplexStream,
    compression_level: u32,
) -> Result<()> {
    let mut writer = ZipStreamWriter::with_compression(output, compression_level);

    while let Some(record) = records.recv().await {
        match record {
            Record::Directory { name, options } => {
                writer.add_directory(&name, options.mtime).await?;
            }
            Record::Buffer {
                name,
                data,
                options,
            } => {
                writer
                    .add_file(&name, &mut data.as_slice(), record_options(&options))
                    .await?;
            }
            Record::Stream {
                name,
                mut stream,
                options,
            } => {
                writer
                    .add_file(&name, &mut stream, record_options(&options))
                    .await?;
            }
        }
    }

    let records_written = writer.entry_count();
    let bytes_written = writer.position();
    writer.finish().await?;
    debug!(
        "archive complete: {} records, {} bytes before central directory",
        records_written, bytes_written
    );
    Ok(())
}

/// Readable end of a [`ZipEngine`]'s output
///
/// Yields the archive bytes as the pump task writes them. When the pipe reaches
/// EOF the task's result is checked, so a failed archive surfaces as a read
/// error rather than a truncated stream. Dropping the output aborts the task.
pub struct ArchiveOutput {
    reader: DuplexStream,
    task: Option<JoinHandle<Result<()>>>,
}

impl AsyncRead for ArchiveOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // EOF on the pipe: report how the pump ended
        if let Some(task) = this.task.as_mut() {
            let joined = ready!(Pin::new(task).poll(cx));
            this.task = None;
            match joined {
                Ok(Ok(())) => trace!("archive output drained"),
                Ok(Err(e)) => return Poll::Ready(Err(e.into())),
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for ArchiveOutput {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn file_options(compress: bool) -> FileOptions {
        FileOptions {
            compress,
            mtime: SystemTime::now(),
            mode: Some(0o100644),
        }
    }

    #[tokio::test]
    async fn produces_archive_after_end() -> Result<()> {
        // A tiny pipe forces the pump to wait on the reader repeatedly
        let mut engine = ZipEngine::new().with_pipe_capacity(16);
        engine.add_empty_directory(
            "docs",
            DirectoryOptions {
                mtime: SystemTime::now(),
            },
        )?;
        engine.add_buffer(b"hello".to_vec(), "docs/hello.txt", file_options(true))?;
        let mut output = engine.output_stream()?;
        engine.end()?;

        let mut bytes = Vec::new();
        output.read_to_end(&mut bytes).await?;
        assert_eq!(&bytes[..4], &[0x50, 0x4b, 0x03, 0x04]);
        assert_eq!(&bytes[bytes.len() - 22..bytes.len() - 18], &[0x50, 0x4b, 0x05, 0x06]);
        Ok(())
    }

    #[tokio::test]
    async fn add_after_end_is_rejected() {
        let mut engine = ZipEngine::new();
        engine.end().unwrap();
        let err = engine
            .add_buffer(Vec::new(), "late.txt", file_options(false))
            .unwrap_err();
        assert!(matches!(err, BundleError::InvalidState(_)));
        assert!(matches!(engine.end(), Err(BundleError::InvalidState(_))));
    }

    #[tokio::test]
    async fn output_can_only_be_taken_once() {
        let mut engine = ZipEngine::new();
        let _output = engine.output_stream().unwrap();
        assert!(matches!(
            engine.output_stream(),
            Err(BundleError::InvalidState(_))
        ));
    }

    #[test]
    fn output_requires_runtime() {
        let mut engine = ZipEngine::new();
        assert!(matches!(
            engine.output_stream(),
            Err(BundleError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn failing_source_surfaces_as_read_error() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "source gone")))
            }
        }

        let mut engine = ZipEngine::new();
        engine
            .add_read_stream(Box::new(Broken), "broken.bin", file_options(true))
            .unwrap();
        let mut output = engine.output_stream().unwrap();
        engine.end().unwrap();

        let mut bytes = Vec::new();
        let err = output.read_to_end(&mut bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
