use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use super::paths::normalize_path;
use super::ports::fs::{DirectoryScanPort, FileIoPort, FsError, ScanResult};
use super::ports::settings::{SettingsError, SettingsPort};

/// In-memory filesystem that counts writes and removals.
#[derive(Default)]
pub struct MemoryFs {
    files: Mutex<BTreeMap<PathBuf, String>>,
    writes: AtomicUsize,
    removals: AtomicUsize,
    scan_failure: Mutex<Option<std::io::ErrorKind>>,
}

impl MemoryFs {
    pub fn put(&self, path: impl Into<PathBuf>, content: &str) {
        self.files
            .lock()
            .expect("memory fs lock")
            .insert(path.into(), content.to_string());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .lock()
            .expect("memory fs lock")
            .get(path.as_ref())
            .cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Every following scan fails with an I/O error of `kind`.
    pub fn fail_scans(&self, kind: std::io::ErrorKind) {
        *self.scan_failure.lock().expect("memory fs lock") = Some(kind);
    }

    pub fn clear_failures(&self) {
        *self.scan_failure.lock().expect("memory fs lock") = None;
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

impl DirectoryScanPort for MemoryFs {
    fn scan_and_read<'a>(
        &'a self,
        base: &'a Path,
        patterns: &'a [&'a str],
        recursive: bool,
        path_filter: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ScanResult, FsError>> {
        Box::pin(async move {
            if let Some(kind) = *self.scan_failure.lock().expect("memory fs lock") {
                return Err(FsError::Io {
                    path: base.to_path_buf(),
                    source: std::io::Error::from(kind),
                });
            }
            let files = self.files.lock().expect("memory fs lock");
            let mut result = ScanResult::default();
            let mut found_base = false;

            for (path, content) in files.iter() {
                let Ok(relative) = path.strip_prefix(base) else {
                    continue;
                };
                found_base = true;
                let depth = relative.components().count();
                if !recursive && depth > 2 {
                    continue;
                }
                let name = relative
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !patterns.iter().any(|pattern| pattern_matches(pattern, &name)) {
                    continue;
                }
                let key = normalize_path(path);
                if path_filter.is_some_and(|filter| !key.contains(filter)) {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    let parent = normalize_path(parent);
                    if !result.dirs.contains(&parent) {
                        result.dirs.push(parent);
                    }
                }
                result.files.insert(key, Some(content.clone()));
            }

            if !found_base {
                return Err(FsError::DirectoryNotFound(base.to_path_buf()));
            }
            Ok(result)
        })
    }
}

impl FileIoPort for MemoryFs {
    fn read_text_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String, FsError>> {
        Box::pin(async move {
            self.get(path)
                .ok_or_else(|| FsError::FileNotFound(path.to_path_buf()))
        })
    }

    fn write_json_batch(&self, items: Vec<(Value, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>> {
        Box::pin(async move {
            for (value, path) in items {
                self.writes.fetch_add(1, Ordering::SeqCst);
                let content = serde_json::to_string_pretty(&value)
                    .map_err(|source| FsError::Encode {
                        path: path.clone(),
                        source,
                    })?;
                self.put(path, &content);
            }
            Ok(())
        })
    }

    fn write_text_batch(&self, items: Vec<(String, PathBuf)>) -> BoxFuture<'_, Result<(), FsError>> {
        Box::pin(async move {
            for (content, path) in items {
                self.writes.fetch_add(1, Ordering::SeqCst);
                self.put(path, &content);
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>> {
        Box::pin(async move {
            if self.files.lock().expect("memory fs lock").remove(path).is_some() {
                self.removals.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn remove_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), FsError>> {
        Box::pin(async move {
            self.files
                .lock()
                .expect("memory fs lock")
                .retain(|file, _| !file.starts_with(path));
            Ok(())
        })
    }
}

pub struct FailingSettings;

impl SettingsPort for FailingSettings {
    fn settings_base(&self) -> BoxFuture<'_, Result<PathBuf, SettingsError>> {
        Box::pin(async { Err(SettingsError::NoDataDir) })
    }
}
