use std::path::PathBuf;

use futures::future::BoxFuture;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no data directory available on this platform")]
    NoDataDir,
    #[error("failed to prepare settings base {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the directory every persisted file lives under.
pub trait SettingsPort: Send + Sync {
    fn settings_base(&self) -> BoxFuture<'_, Result<PathBuf, SettingsError>>;
}
