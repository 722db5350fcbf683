use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid file pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
    #[error("filesystem task failed: {0}")]
    Task(String),
}

impl FsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => FsError::FileNotFound(path),
            _ => FsError::Io { path, source },
        }
    }

    pub fn is_directory_not_found(&self) -> bool {
        matches!(self, FsError::DirectoryNotFound(_))
    }

    pub fn is_file_not_found(&self) -> bool {
        matches!(self, FsError::FileNotFound(_))
    }
}

/// Result of a directory scan. Keys are `/`-separated paths; a `None` value
/// marks a matching entry that could not be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub files: BTreeMap<String, Option<String>>,
    /// Directories that directly contain at least one matching file.
    pub dirs: Vec<String>,
}

pub trait DirectoryScanPort: Send + Sync {
    /// Reads every file under `base` whose name matches one of `patterns`
    /// (exact names or `*suffix` globs). Without `recursive` only `base` and
    /// its immediate subdirectories are visited. `path_filter` keeps only
    /// paths containing that substring.
    fn scan_and_read<'a>(
        &'a self,
        base: &'a Path,
        patterns: &'a [&'a str],
        recursive: bool,
        path_filter: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ScanResult, FsError>>;
}

pub trait FileIoPort: Send + Sync {
    fn read_text_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String, FsError>>;
    fn write_json_batch(&self, items: Vec<(Value, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>>;
    /// Writes each `(content, path)` verbatim, creating parent directories.
    fn write_text_batch(&self, items: Vec<(String, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>>;
    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>>;
    fn remove_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>>;
}

pub trait FsPort: DirectoryScanPort + FileIoPort {}

impl<T: DirectoryScanPort + FileIoPort> FsPort for T {}
