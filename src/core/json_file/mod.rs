use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::persister::{ListenerHandle, PersistError, Persister, PersisterAdapter, ReloadListener};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::{FileChangeEvent, FileChangePort, NotifyError};
use crate::core::ports::settings::SettingsPort;
use crate::core::store::TableStore;
use crate::core::table::{ChangedTables, Table, TableChanges};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// How a json-file persister notices external edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Notify,
    #[default]
    Poll,
    Both,
}

impl ListenMode {
    pub fn uses_notify(self) -> bool {
        matches!(self, ListenMode::Notify | ListenMode::Both)
    }

    pub fn uses_poll(self) -> bool {
        matches!(self, ListenMode::Poll | ListenMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ListenMode::Notify => "notify",
            ListenMode::Poll => "poll",
            ListenMode::Both => "both",
        }
    }
}

impl fmt::Display for ListenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListenMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "notify" => Ok(ListenMode::Notify),
            "poll" => Ok(ListenMode::Poll),
            "both" => Ok(ListenMode::Both),
            other => Err(format!(
                "Invalid listen mode '{}'. Use 'notify', 'poll' or 'both'.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileOptions {
    pub table_name: String,
    pub filename: String,
    pub label: String,
    pub listen_mode: ListenMode,
    pub poll_interval: Duration,
}

impl JsonFileOptions {
    pub fn new(table_name: &str, filename: &str, label: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            filename: filename.to_string(),
            label: label.to_string(),
            listen_mode: ListenMode::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn listen_mode(mut self, listen_mode: ListenMode) -> Self {
        self.listen_mode = listen_mode;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Persists one table as a flat JSON object at `{settings_base}/{filename}`.
pub struct JsonFilePersister {
    options: JsonFileOptions,
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
}

pub fn create_json_file_persister(
    store: Arc<TableStore>,
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
    options: JsonFileOptions,
) -> Persister<JsonFilePersister> {
    Persister::new(
        store,
        JsonFilePersister::new(options, settings, fs, notify),
    )
}

impl JsonFilePersister {
    pub fn new(
        options: JsonFileOptions,
        settings: Arc<dyn SettingsPort>,
        fs: Arc<dyn FsPort>,
        notify: Option<Arc<dyn FileChangePort>>,
    ) -> Self {
        Self {
            options,
            settings,
            fs,
            notify,
        }
    }

    pub fn options(&self) -> &JsonFileOptions {
        &self.options
    }

    async fn file_path(&self) -> Option<PathBuf> {
        match self.settings.settings_base().await {
            Ok(base) => Some(base.join(&self.options.filename)),
            Err(error) => {
                log::error!("[{}] base error: {}", self.options.label, error);
                None
            }
        }
    }

    async fn load_table_data(&self) -> Option<Table> {
        let label = &self.options.label;
        let path = self.file_path().await?;

        let content = match self.fs.read_text_file(&path).await {
            Ok(content) => content,
            Err(error) => {
                if !error.is_file_not_found() {
                    log::error!("[{}] load error: {}", label, error);
                }
                return None;
            }
        };

        let entries = match serde_json::from_str::<Map<String, Value>>(&content) {
            Ok(entries) => entries,
            Err(error) => {
                log::error!("[{}] JSON parse error: {}", label, error);
                return None;
            }
        };

        let mut table = Table::new();
        for (row_id, value) in entries {
            match value {
                Value::Object(row) => {
                    table.insert(row_id, row);
                }
                other => log::warn!(
                    "[{}] skipping row {}: expected an object, found {}",
                    label,
                    row_id,
                    other
                ),
            }
        }
        Some(table)
    }

    pub async fn load_content(&self) -> Option<TableChanges> {
        let table = self.load_table_data().await?;
        Some(TableChanges::delta_for(&self.options.table_name, table))
    }

    pub async fn save_content(&self, store: &TableStore, changed: Option<&ChangedTables>) {
        let JsonFileOptions {
            table_name, label, ..
        } = &self.options;

        if let Some(changed) = changed {
            if !changed.contains_key(table_name) {
                return;
            }
        }

        let Some(path) = self.file_path().await else {
            return;
        };

        let data = match serde_json::to_value(store.get_table(table_name)) {
            Ok(data) => data,
            Err(error) => {
                log::error!("[{}] save error: {}", label, error);
                return;
            }
        };

        if let Err(error) = self.fs.write_json_batch(vec![(data, path)]).await {
            log::error!("[{}] save error: {}", label, error);
        }
    }

    async fn on_file_change(&self, listener: &ReloadListener, closed: &AtomicBool) {
        let Some(changes) = self.load_content().await else {
            return;
        };
        if closed.load(Ordering::SeqCst) {
            return;
        }
        listener(changes);
    }

    async fn listen(self: Arc<Self>, listener: ReloadListener) -> Result<ListenerHandle, PersistError> {
        let JsonFileOptions {
            label,
            listen_mode,
            poll_interval,
            ..
        } = self.options.clone();
        let mut handle = ListenerHandle::new();

        if listen_mode.uses_notify() {
            let channel = self.notify.clone().ok_or_else(|| PersistError::ListenerSetup {
                label: label.clone(),
                source: NotifyError::Unavailable("no file change channel configured".to_string()),
            })?;
            let mut stream = channel
                .subscribe()
                .await
                .map_err(|source| PersistError::ListenerSetup {
                    label: label.clone(),
                    source,
                })?;

            let persister = Arc::clone(&self);
            let listener = Arc::clone(&listener);
            let closed = handle.closed_flag();
            handle.set_unlisten(tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    let matches = match &event {
                        FileChangeEvent::Changed(changed) => {
                            changed.path.ends_with(&persister.options.filename)
                        }
                        FileChangeEvent::Lagged(_) => true,
                    };
                    if matches {
                        persister.on_file_change(&listener, &closed).await;
                    }
                }
            }));
        }

        if listen_mode.uses_poll() {
            let period = if poll_interval.is_zero() {
                log::warn!(
                    "[{}] poll interval is zero, using {}ms",
                    label,
                    DEFAULT_POLL_INTERVAL.as_millis()
                );
                DEFAULT_POLL_INTERVAL
            } else {
                poll_interval
            };

            let persister = Arc::clone(&self);
            let closed = handle.closed_flag();
            handle.set_interval(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    ticker.tick().await;
                    persister.on_file_change(&listener, &closed).await;
                }
            }));
        }

        Ok(handle)
    }
}

impl PersisterAdapter for JsonFilePersister {
    fn label(&self) -> &str {
        &self.options.label
    }

    fn load(&self) -> BoxFuture<'_, Option<TableChanges>> {
        Box::pin(self.load_content())
    }

    fn save<'a>(
        &'a self,
        store: &'a TableStore,
        changed: Option<&'a ChangedTables>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.save_content(store, changed))
    }

    fn add_listener(
        self: Arc<Self>,
        listener: ReloadListener,
    ) -> BoxFuture<'static, Result<ListenerHandle, PersistError>> {
        Box::pin(self.listen(listener))
    }
}

#[cfg(test)]
mod tests;
