use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::paths::normalize_path;
use crate::core::ports::fs::{DirectoryScanPort, FileIoPort, FsError, ScanResult};

const TEMP_SUFFIX: &str = "tmp";

/// Filesystem access backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn build_globset(patterns: &[String]) -> Result<GlobSet, FsError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|error| FsError::Pattern {
            pattern: pattern.clone(),
            message: error.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|error| FsError::Pattern {
        pattern: patterns.join(","),
        message: error.to_string(),
    })
}

/// Walks `base`, reading every file whose name matches one of `patterns`.
/// Without `recursive` only `base` and its immediate subdirectories are
/// visited. Hidden entries are skipped.
///
/// A directory that cannot be listed fails the whole scan; a matching file
/// that cannot be read is reported with `None` content.
pub fn scan_and_read_blocking(
    base: &Path,
    patterns: &[String],
    recursive: bool,
    path_filter: Option<&str>,
) -> Result<ScanResult, FsError> {
    if !base.is_dir() {
        return Err(FsError::DirectoryNotFound(base.to_path_buf()));
    }

    let matcher = build_globset(patterns)?;
    let mut walker = WalkDir::new(base).follow_links(true);
    if !recursive {
        walker = walker.max_depth(2);
    }

    let mut result = ScanResult::default();
    for entry in walker.into_iter().filter_entry(|entry| {
        entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
    }) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => match walk_error(base, error) {
                Some(error) => return Err(error),
                None => continue,
            },
        };
        if !entry.file_type().is_file() || !matcher.is_match(entry.file_name()) {
            continue;
        }

        let key = normalize_path(entry.path());
        if path_filter.is_some_and(|filter| !key.contains(filter)) {
            continue;
        }

        if let Some(parent) = entry.path().parent() {
            let parent = normalize_path(parent);
            if !result.dirs.contains(&parent) {
                result.dirs.push(parent);
            }
        }

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => Some(content),
            Err(error) => {
                log::warn!("[fs] failed to read {}: {}", key, error);
                None
            }
        };
        result.files.insert(key, content);
    }

    Ok(result)
}

/// `None` for entries that vanished mid-scan or loop back on themselves.
fn walk_error(base: &Path, error: walkdir::Error) -> Option<FsError> {
    let depth = error.depth();
    let path = error
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base.to_path_buf());

    match error.io_error().map(std::io::Error::kind) {
        Some(std::io::ErrorKind::NotFound) if depth > 0 => {
            log::debug!("[fs] {} disappeared during scan", path.display());
            None
        }
        Some(kind) => Some(FsError::Io {
            path,
            source: std::io::Error::new(kind, error.to_string()),
        }),
        None if depth == 0 => Some(FsError::Io {
            path,
            source: std::io::Error::other(error.to_string()),
        }),
        None => {
            log::warn!("[fs] scan skipped {}: {}", path.display(), error);
            None
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

async fn write_json(value: &Value, path: &Path) -> Result<(), FsError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| FsError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_text(&content, path).await
}

async fn write_text(content: &str, path: &Path) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FsError::io(parent, source))?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, content)
        .await
        .map_err(|source| FsError::io(&temp, source))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|source| FsError::io(path, source))
}

fn ignore_not_found(result: std::io::Result<()>, path: &Path) -> Result<(), FsError> {
    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(FsError::io(path, error)),
    }
}

impl DirectoryScanPort for LocalFs {
    fn scan_and_read<'a>(
        &'a self,
        base: &'a Path,
        patterns: &'a [&'a str],
        recursive: bool,
        path_filter: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ScanResult, FsError>> {
        let base = base.to_path_buf();
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let path_filter = path_filter.map(ToOwned::to_owned);

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                scan_and_read_blocking(&base, &patterns, recursive, path_filter.as_deref())
            })
            .await
            .map_err(|error| FsError::Task(error.to_string()))?
        })
    }
}

impl FileIoPort for LocalFs {
    fn read_text_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String, FsError>> {
        Box::pin(async move {
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| FsError::io(path, source))
        })
    }

    fn write_json_batch(&self, items: Vec<(Value, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>> {
        Box::pin(async move {
            for (value, path) in &items {
                write_json(value, path).await?;
            }
            Ok(())
        })
    }

    fn write_text_batch(&self, items: Vec<(String, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>> {
        Box::pin(async move {
            for (content, path) in &items {
                write_text(content, path).await?;
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>> {
        Box::pin(async move { ignore_not_found(tokio::fs::remove_file(path).await, path) })
    }

    fn remove_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>> {
        Box::pin(async move { ignore_not_found(tokio::fs::remove_dir_all(path).await, path) })
    }
}
