use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{
    chat_data_to_json, chat_json_value, load_all_chat_groups, load_single_chat_group,
    CHAT_GROUPS_TABLE, CHAT_MESSAGES_TABLE, LABEL,
};
use crate::core::paths::{
    build_chat_file_path, build_chat_path, folder_entity_id, CHATS_DIR, CHAT_MESSAGES_FILE,
};
use crate::core::persister::{
    ListenerHandle, PersistError, Persister, PersisterAdapter, ReloadListener,
};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::{FileChangeEvent, FileChangePort};
use crate::core::ports::settings::SettingsPort;
use crate::core::store::TableStore;
use crate::core::table::{changed_rows, ChangedTables, Row, Table, TableChanges};

pub const CLEANUP_SAFEGUARD_MIN_DISK_COUNT: usize = 5;
pub const CLEANUP_SAFEGUARD_MIN_KEEP_RATIO: f64 = 0.5;

/// Full reload period when no file change channel is available.
pub const DEFAULT_CHAT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub(super) const CHAT_GROUP_ID_FIELD: &str = "chat_group_id";

/// Mirrors `chat_groups` and `chat_messages` to one
/// `chats/{group_id}/messages.json` per group.
pub struct ChatDirPersister {
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
    poll_interval: Duration,
}

pub fn create_chat_persister(
    store: Arc<TableStore>,
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
) -> Persister<ChatDirPersister> {
    Persister::new(store, ChatDirPersister::new(settings, fs, notify))
}

fn message_group_id(message: &Row) -> Option<&str> {
    message.get(CHAT_GROUP_ID_FIELD).and_then(Value::as_str)
}

/// Groups whose file must be rewritten (or removed) for `changed`. `None`
/// means every group.
fn affected_groups(changed: Option<&ChangedTables>, messages: &Table) -> Option<BTreeSet<String>> {
    let changed = changed?;
    let mut groups: BTreeSet<String> = changed_rows(changed, CHAT_GROUPS_TABLE)
        .cloned()
        .unwrap_or_default();

    for message_id in changed_rows(changed, CHAT_MESSAGES_TABLE).into_iter().flatten() {
        match messages.get(message_id).and_then(message_group_id) {
            Some(group_id) => {
                groups.insert(group_id.to_string());
            }
            // A deleted message no longer says which group it belonged to.
            None => return None,
        }
    }

    Some(groups)
}

/// Whether removing everything not in `keep_count` of `disk_count` groups
/// looks like the aftermath of a failed load.
pub fn cleanup_safeguard_trips(keep_count: usize, disk_count: usize) -> bool {
    let keep_ratio = keep_count as f64 / disk_count.max(1) as f64;
    disk_count > CLEANUP_SAFEGUARD_MIN_DISK_COUNT && keep_ratio < CLEANUP_SAFEGUARD_MIN_KEEP_RATIO
}

impl ChatDirPersister {
    pub fn new(
        settings: Arc<dyn SettingsPort>,
        fs: Arc<dyn FsPort>,
        notify: Option<Arc<dyn FileChangePort>>,
    ) -> Self {
        Self {
            settings,
            fs,
            notify,
            poll_interval: DEFAULT_CHAT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn data_dir(&self) -> Option<PathBuf> {
        match self.settings.settings_base().await {
            Ok(base) => Some(base),
            Err(error) => {
                log::error!("[{}] base error: {}", LABEL, error);
                None
            }
        }
    }

    pub async fn load_content(&self) -> Option<TableChanges> {
        let data_dir = self.data_dir().await?;
        match load_all_chat_groups(self.fs.as_ref(), &data_dir).await {
            Ok(data) => Some(TableChanges::Snapshot(data.into_tables())),
            Err(error) => {
                log::error!("[{}] load error: {}", LABEL, error);
                None
            }
        }
    }

    async fn load_group(&self, group_id: &str) -> Option<TableChanges> {
        let data_dir = self.data_dir().await?;
        match load_single_chat_group(self.fs.as_ref(), &data_dir, group_id).await {
            Ok(data) if !data.is_empty() => Some(TableChanges::Delta(data.into_tables())),
            // Removed on disk; only a snapshot can drop the group's rows.
            Ok(_) => self.load_content().await,
            Err(error) => {
                log::error!("[{}] loadSingle error for {}: {}", LABEL, group_id, error);
                self.load_content().await
            }
        }
    }

    pub async fn save_content(&self, store: &TableStore, changed: Option<&ChangedTables>) {
        if let Some(changed) = changed {
            if !changed.contains_key(CHAT_GROUPS_TABLE) && !changed.contains_key(CHAT_MESSAGES_TABLE) {
                return;
            }
        }

        let Some(data_dir) = self.data_dir().await else {
            return;
        };

        let groups = store.get_table(CHAT_GROUPS_TABLE);
        let messages = store.get_table(CHAT_MESSAGES_TABLE);
        let targets = affected_groups(changed, &messages)
            .unwrap_or_else(|| groups.keys().cloned().collect());

        let mut by_group: BTreeMap<&str, Vec<(&String, &Row)>> = BTreeMap::new();
        for (message_id, message) in &messages {
            if let Some(group_id) = message_group_id(message) {
                by_group.entry(group_id).or_default().push((message_id, message));
            }
        }

        let mut writes = Vec::new();
        for group_id in &targets {
            match groups.get(group_id) {
                Some(group) => {
                    let group_messages = by_group.remove(group_id.as_str()).unwrap_or_default();
                    let json = chat_data_to_json(group_id, group, group_messages);
                    writes.push((chat_json_value(&json), build_chat_file_path(&data_dir, group_id)));
                }
                None => {
                    let dir = build_chat_path(&data_dir, group_id);
                    if let Err(error) = self.fs.remove_dir(&dir).await {
                        log::error!("[{}] Failed to delete {}: {}", LABEL, dir.display(), error);
                    }
                }
            }
        }

        if !writes.is_empty() {
            if let Err(error) = self.fs.write_json_batch(writes).await {
                log::error!("[{}] Failed to export json batch: {}", LABEL, error);
            }
        }

        let keep_ids: BTreeSet<&str> = groups.keys().map(String::as_str).collect();
        self.cleanup_orphans(&data_dir, &keep_ids).await;
    }

    /// Removes group directories that have no row in the store.
    async fn cleanup_orphans(&self, data_dir: &Path, keep_ids: &BTreeSet<&str>) {
        if keep_ids.is_empty() {
            return;
        }

        let chats_dir = data_dir.join(CHATS_DIR);
        let scan = match self
            .fs
            .scan_and_read(&chats_dir, &[CHAT_MESSAGES_FILE], false, None)
            .await
        {
            Ok(scan) => scan,
            Err(error) if error.is_directory_not_found() => return,
            Err(error) => {
                log::warn!("[{}] cleanup scan error: {}", LABEL, error);
                return;
            }
        };

        let disk_ids: Vec<String> = scan
            .dirs
            .iter()
            .filter_map(|dir| {
                let relative = Path::new(dir).strip_prefix(&chats_dir).ok()?;
                let relative = format!("{}/{}", CHATS_DIR, relative.to_string_lossy());
                folder_entity_id(&relative, CHATS_DIR)
            })
            .collect();

        if cleanup_safeguard_trips(keep_ids.len(), disk_ids.len()) {
            log::warn!(
                "[{}] Skipping dirs cleanup: keeping {}/{} - possible load failure",
                LABEL,
                keep_ids.len(),
                disk_ids.len()
            );
            return;
        }

        for orphan in disk_ids.iter().filter(|id| !keep_ids.contains(id.as_str())) {
            let dir = build_chat_path(data_dir, orphan);
            log::info!("[{}] removing orphaned chat group {}", LABEL, orphan);
            if let Err(error) = self.fs.remove_dir(&dir).await {
                log::error!("[{}] Failed to delete {}: {}", LABEL, dir.display(), error);
            }
        }
    }

    fn deliver(changes: Option<TableChanges>, listener: &ReloadListener, closed: &AtomicBool) {
        if let Some(changes) = changes {
            if !closed.load(Ordering::SeqCst) {
                listener(changes);
            }
        }
    }

    async fn listen(self: Arc<Self>, listener: ReloadListener) -> Result<ListenerHandle, PersistError> {
        let mut handle = ListenerHandle::new();
        let closed = handle.closed_flag();

        let Some(channel) = self.notify.clone() else {
            let period = self.poll_interval;
            let persister = Arc::clone(&self);
            handle.set_interval(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    ticker.tick().await;
                    let changes = persister.load_content().await;
                    Self::deliver(changes, &listener, &closed);
                }
            }));
            return Ok(handle);
        };

        let mut stream = channel
            .subscribe()
            .await
            .map_err(|source| PersistError::ListenerSetup {
                label: LABEL.to_string(),
                source,
            })?;

        let prefix = format!("{}/", CHATS_DIR);
        let persister = Arc::clone(&self);
        handle.set_unlisten(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let changes = match event {
                    FileChangeEvent::Changed(changed) => {
                        if !changed.path.starts_with(&prefix) {
                            continue;
                        }
                        let Some(group_id) = folder_entity_id(&changed.path, CHATS_DIR) else {
                            continue;
                        };
                        persister.load_group(&group_id).await
                    }
                    FileChangeEvent::Lagged(_) => persister.load_content().await,
                };
                Self::deliver(changes, &listener, &closed);
            }
        }));

        Ok(handle)
    }
}

impl PersisterAdapter for ChatDirPersister {
    fn label(&self) -> &str {
        LABEL
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
