//! File-like entries flowing into and out of a bundle

use crate::error::Result;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncRead;

/// Readable byte stream carried as entry contents
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Contents of an entry
pub enum Contents {
    /// No contents (directories, or entries whose data was never loaded)
    Null,
    /// Fully loaded bytes
    Buffer(Vec<u8>),
    /// Bytes still to be read
    Stream(ByteStream),
}

impl Contents {
    pub fn is_null(&self) -> bool {
        matches!(self, Contents::Null)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Contents::Buffer(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Contents::Stream(_))
    }
}

impl fmt::Debug for Contents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contents::Null => f.write_str("Null"),
            Contents::Buffer(data) => write!(f, "Buffer({} bytes)", data.len()),
            Contents::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Vec<u8>> for Contents {
    fn from(data: Vec<u8>) -> Self {
        Contents::Buffer(data)
    }
}

impl From<ByteStream> for Contents {
    fn from(stream: ByteStream) -> Self {
        Contents::Stream(stream)
    }
}

/// File system metadata attached to an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStat {
    /// Last modification time
    pub mtime: Option<SystemTime>,
    /// POSIX mode (file type and permission bits)
    pub mode: Option<u32>,
    /// Whether the entry describes a directory
    pub is_dir: bool,
}

impl EntryStat {
    /// Metadata for a regular file
    pub fn file(mtime: SystemTime, mode: u32) -> Self {
        Self {
            mtime: Some(mtime),
            mode: Some(mode),
            is_dir: false,
        }
    }

    /// Metadata for a directory
    pub fn directory(mtime: SystemTime, mode: u32) -> Self {
        Self {
            mtime: Some(mtime),
            mode: Some(mode),
            is_dir: true,
        }
    }
}

impl From<&std::fs::Metadata> for EntryStat {
    fn from(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode())
        };
        #[cfg(not(unix))]
        let mode = None;

        Self {
            mtime: meta.modified().ok(),
            mode,
            is_dir: meta.is_dir(),
        }
    }
}

/// One file-like item handed to the bundler
#[derive(Debug)]
pub struct IncomingEntry {
    /// Working directory the entry was produced from
    pub cwd: PathBuf,
    /// Base directory; archive names are relative to it
    pub base: PathBuf,
    /// Full path of the entry
    pub path: PathBuf,
    pub contents: Contents,
    pub stat: Option<EntryStat>,
}

impl IncomingEntry {
    /// Create an entry at `base/relative`
    pub fn new(
        cwd: impl Into<PathBuf>,
        base: impl Into<PathBuf>,
        relative: impl AsRef<Path>,
        contents: impl Into<Contents>,
    ) -> Self {
        let base = base.into();
        let path = base.join(relative);
        Self {
            cwd: cwd.into(),
            base,
            path,
            contents: contents.into(),
            stat: None,
        }
    }

    /// Attach metadata
    pub fn with_stat(mut self, stat: EntryStat) -> Self {
        self.stat = Some(stat);
        self
    }

    /// Path relative to `base`, as the platform spells it
    ///
    /// Relative `base` and `path` are resolved against `cwd`. Paths outside of
    /// `base` step out of it with `..`, so the result is never absolute.
    pub fn relative(&self) -> String {
        let base = self.cwd.join(&self.base);
        let path = self.cwd.join(&self.path);
        relative_path(&base, &path)
            .to_string_lossy()
            .into_owned()
    }

    /// Build an entry from a file or directory on disk
    ///
    /// Files are opened and carried as a stream; directories carry no contents.
    pub async fn from_path(
        cwd: impl Into<PathBuf>,
        base: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let stat = EntryStat::from(&meta);

        let contents = if meta.is_dir() {
            Contents::Null
        } else {
            let file = tokio::fs::File::open(&path).await?;
            Contents::Stream(Box::new(file))
        };

        Ok(Self {
            cwd: cwd.into(),
            base: base.into(),
            path,
            contents,
            stat: Some(stat),
        })
    }
}

/// Lexical path leading from `base` to `path`
fn relative_path(base: &Path, path: &Path) -> PathBuf {
    let base = normalize(base);
    let path = normalize(path);
    let common = base
        .iter()
        .zip(&path)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &path[common..] {
        match component {
            // Roots of a path on another drive or share
            Component::Prefix(_) | Component::RootDir => {}
            other => relative.push(other.as_os_str()),
        }
    }
    relative
}

/// Resolve `.` and `..` components without touching the file system
fn normalize(path: &Path) -> Vec<Component<'_>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts
}

/// The finished archive
#[derive(Debug)]
pub struct OutputEntry {
    pub cwd: PathBuf,
    pub base: PathBuf,
    /// `base` joined with the configured filename
    pub path: PathBuf,
    /// Either the whole archive or a stream producing it
    pub contents: Contents,
}

impl OutputEntry {
    /// Path relative to `base`
    pub fn relative(&self) -> PathBuf {
        self.path
            .strip_prefix(&self.base)
            .unwrap_or(&self.path)
            .to_path_buf()
    }

    /// Write the archive below `dir`, returning the written file's path
    pub async fn write_to(self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let target = dir.as_ref().join(self.relative());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.contents {
            Contents::Buffer(data) => tokio::fs::write(&target, data).await?,
            Contents::Stream(mut stream) => {
                let mut file = tokio::fs::File::create(&target).await?;
                tokio::io::copy(&mut stream, &mut file).await?;
                tokio::io::AsyncWriteExt::flush(&mut file).await?;
            }
            Contents::Null => tokio::fs::write(&target, b"").await?,
        }

        Ok(target)
    }
}
