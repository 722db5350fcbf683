use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use super::meta::meta_file_value;
use super::note::{declared_note_id, memo_document, note_document, note_filename};
use super::transcript::transcript_file_value;
use super::{
    extract_session_id_and_folder, load_all_session_data, load_single_session,
    ENHANCED_NOTES_TABLE, LABEL, SCAN_PATTERNS, SESSIONS_TABLE, SESSION_PARTICIPANTS_TABLE,
    TRANSCRIPTS_TABLE,
};
use crate::core::paths::{
    build_session_path, normalize_path, SESSIONS_DIR, SESSION_MEMO_FILE, SESSION_META_FILE,
    SESSION_NOTE_EXTENSION, SESSION_TRANSCRIPT_FILE,
};
use crate::core::persister::{
    ListenerHandle, PersistError, Persister, PersisterAdapter, ReloadListener,
};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::{FileChangeEvent, FileChangePort};
use crate::core::ports::settings::SettingsPort;
use crate::core::store::TableStore;
use crate::core::table::{changed_rows, ChangedTables, Row, Table, TableChanges};

/// Full reload period when no file change channel is available.
pub const DEFAULT_SESSION_POLL_INTERVAL: Duration = Duration::from_secs(30);

const SESSION_ID_FIELD: &str = "session_id";
const FOLDER_ID_FIELD: &str = "folder_id";
const TEMPLATES_TABLE: &str = "templates";

/// Tables whose rows are written under a session folder.
const SESSION_ROW_TABLES: [&str; 3] = [
    ENHANCED_NOTES_TABLE,
    TRANSCRIPTS_TABLE,
    SESSION_PARTICIPANTS_TABLE,
];

/// Mirrors the session tables to `sessions/[{folder}/]{session_id}/`:
/// `_meta.json`, `transcript.json`, `_memo.md` and one Markdown file per
/// enhanced note.
pub struct SessionDirPersister {
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
    poll_interval: Duration,
}

pub fn create_session_persister(
    store: Arc<TableStore>,
    settings: Arc<dyn SettingsPort>,
    fs: Arc<dyn FsPort>,
    notify: Option<Arc<dyn FileChangePort>>,
) -> Persister<SessionDirPersister> {
    Persister::new(store, SessionDirPersister::new(settings, fs, notify))
}

fn row_session_id(row: &Row) -> Option<&str> {
    row.get(SESSION_ID_FIELD).and_then(Value::as_str)
}

/// Sessions whose folder must be rewritten (or removed) for `changed`.
/// `None` means every session.
fn affected_sessions(
    changed: Option<&ChangedTables>,
    rows: &BTreeMap<&str, Table>,
) -> Option<BTreeSet<String>> {
    let changed = changed?;
    let mut sessions: BTreeSet<String> = changed_rows(changed, SESSIONS_TABLE)
        .cloned()
        .unwrap_or_default();

    for table_name in SESSION_ROW_TABLES {
        let table = rows.get(table_name);
        for row_id in changed_rows(changed, table_name).into_iter().flatten() {
            match table
                .and_then(|table| table.get(row_id))
                .and_then(row_session_id)
            {
                Some(session_id) => {
                    sessions.insert(session_id.to_string());
                }
                // A deleted row no longer says which session it belonged to.
                None => return None,
            }
        }
    }

    Some(sessions)
}

/// Rows of `table_name` that belong to `session_id`.
fn session_rows<'a>(
    rows: &'a BTreeMap<&str, Table>,
    table_name: &str,
    session_id: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Row)> + 'a {
    rows.get(table_name).into_iter().flat_map(move |table| {
        table
            .iter()
            .filter(move |(_, row)| row_session_id(row) == Some(session_id))
    })
}

fn session_dir(data_dir: &Path, session_id: &str, session: &Row) -> PathBuf {
    let folder = session
        .get(FOLDER_ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default();
    build_session_path(data_dir, session_id, folder)
}

/// Everything one save pass writes or removes for a single session.
#[derive(Debug, Default)]
struct SessionWrites {
    json: Vec<(Value, PathBuf)>,
    documents: Vec<(String, PathBuf)>,
    removals: Vec<PathBuf>,
}

impl SessionDirPersister {
    pub fn new(
        settings: Arc<dyn SettingsPort>,
        fs: Arc<dyn FsPort>,
        notify: Option<Arc<dyn FileChangePort>>,
    ) -> Self {
        Self {
            settings,
            fs,
            notify,
            poll_interval: DEFAULT_SESSION_POLL_INTERVAL,
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
        match load_all_session_data(self.fs.as_ref(), &data_dir).await {
            Ok(data) => Some(TableChanges::Snapshot(data.into_tables())),
            Err(error) => {
                log::error!("[{}] load error: {}", LABEL, error);
                None
            }
        }
    }

    async fn load_session(&self, session_id: &str) -> Option<TableChanges> {
        let data_dir = self.data_dir().await?;
        match load_single_session(self.fs.as_ref(), &data_dir, session_id).await {
            Ok(data) if !data.is_empty() => Some(TableChanges::Delta(data.into_tables())),
            // Removed on disk; only a snapshot can drop the session's rows.
            Ok(_) => self.load_content().await,
            Err(error) => {
                log::error!("[{}] loadSingle error for {}: {}", LABEL, session_id, error);
                self.load_content().await
            }
        }
    }

    pub async fn save_content(&self, store: &TableStore, changed: Option<&ChangedTables>) {
        if let Some(changed) = changed {
            let relevant = changed.contains_key(SESSIONS_TABLE)
                || SESSION_ROW_TABLES
                    .iter()
                    .any(|table_name| changed.contains_key(*table_name));
            if !relevant {
                return;
            }
        }

        let Some(data_dir) = self.data_dir().await else {
            return;
        };

        let sessions = store.get_table(SESSIONS_TABLE);
        let templates = store.get_table(TEMPLATES_TABLE);
        let rows: BTreeMap<&str, Table> = SESSION_ROW_TABLES
            .iter()
            .map(|table_name| (*table_name, store.get_table(table_name)))
            .collect();
        let targets = affected_sessions(changed, &rows)
            .unwrap_or_else(|| sessions.keys().cloned().collect());

        let mut writes = SessionWrites::default();
        for session_id in &targets {
            match sessions.get(session_id) {
                Some(session) => {
                    let dir = session_dir(&data_dir, session_id, session);
                    self.collect_session(&dir, session_id, session, &rows, &templates, &mut writes)
                        .await;
                }
                None => self.remove_session_dirs(&data_dir, session_id).await,
            }
        }

        if !writes.json.is_empty() {
            if let Err(error) = self.fs.write_json_batch(writes.json).await {
                log::error!("[{}] Failed to export json batch: {}", LABEL, error);
            }
        }
        if !writes.documents.is_empty() {
            if let Err(error) = self.fs.write_text_batch(writes.documents).await {
                log::error!("[{}] Failed to write notes: {}", LABEL, error);
            }
        }
        for path in writes.removals {
            if let Err(error) = self.fs.remove(&path).await {
                log::error!("[{}] Failed to delete {}: {}", LABEL, path.display(), error);
            }
        }
    }

    async fn collect_session(
        &self,
        dir: &Path,
        session_id: &str,
        session: &Row,
        rows: &BTreeMap<&str, Table>,
        templates: &Table,
        writes: &mut SessionWrites,
    ) {
        let participants = session_rows(rows, SESSION_PARTICIPANTS_TABLE, session_id);
        writes.json.push((
            meta_file_value(session_id, session, participants),
            dir.join(SESSION_META_FILE),
        ));

        let mut transcripts = session_rows(rows, TRANSCRIPTS_TABLE, session_id).peekable();
        if transcripts.peek().is_some() {
            writes.json.push((
                transcript_file_value(transcripts),
                dir.join(SESSION_TRANSCRIPT_FILE),
            ));
        }

        let memo_path = dir.join(SESSION_MEMO_FILE);
        match memo_document(session_id, session) {
            Some(document) => writes.documents.push((document, memo_path)),
            None => writes.removals.push(memo_path),
        }

        let mut written = BTreeSet::new();
        for (note_id, note) in session_rows(rows, ENHANCED_NOTES_TABLE, session_id) {
            let Some(document) = note_document(note_id, session_id, note) else {
                continue;
            };
            let path = dir.join(note_filename(note, templates));
            written.insert(normalize_path(&path));
            writes.documents.push((document, path));
        }

        writes
            .removals
            .extend(self.stale_notes(dir, &written).await);
    }

    /// Notes in `dir` that carry an id but were not written this pass: the
    /// note was deleted or renamed in the store.
    async fn stale_notes(&self, dir: &Path, written: &BTreeSet<String>) -> Vec<PathBuf> {
        let note_pattern = format!("*{}", SESSION_NOTE_EXTENSION);
        let scan = match self
            .fs
            .scan_and_read(dir, &[note_pattern.as_str()], false, None)
            .await
        {
            Ok(scan) => scan,
            Err(error) if error.is_directory_not_found() => return Vec::new(),
            Err(error) => {
                log::warn!("[{}] note scan error in {}: {}", LABEL, dir.display(), error);
                return Vec::new();
            }
        };

        let dir_key = normalize_path(dir);
        scan.files
            .iter()
            .filter(|(path, _)| {
                Path::new(path.as_str())
                    .parent()
                    .is_some_and(|parent| normalize_path(parent) == dir_key)
            })
            .filter(|(path, _)| !path.ends_with(&format!("/{}", SESSION_MEMO_FILE)))
            .filter(|(path, _)| !written.contains(path.as_str()))
            .filter(|(_, content)| content.as_deref().and_then(declared_note_id).is_some())
            .map(|(path, _)| PathBuf::from(path))
            .collect()
    }

    /// Removes every folder named `session_id` under `sessions/`.
    async fn remove_session_dirs(&self, data_dir: &Path, session_id: &str) {
        let sessions_dir = data_dir.join(SESSIONS_DIR);
        let filter = format!("/{}/", session_id);
        let scan = match self
            .fs
            .scan_and_read(&sessions_dir, &SCAN_PATTERNS, true, Some(&filter))
            .await
        {
            Ok(scan) => scan,
            Err(error) if error.is_directory_not_found() => return,
            Err(error) => {
                log::warn!("[{}] scan error removing {}: {}", LABEL, session_id, error);
                return;
            }
        };

        let dirs: BTreeSet<&String> = scan
            .dirs
            .iter()
            .filter(|dir| dir.rsplit('/').next() == Some(session_id))
            .collect();
        for dir in dirs {
            log::info!("[{}] removing deleted session {}", LABEL, session_id);
            if let Err(error) = self.fs.remove_dir(Path::new(dir.as_str())).await {
                log::error!("[{}] Failed to delete {}: {}", LABEL, dir, error);
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

        let persister = Arc::clone(&self);
        handle.set_unlisten(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let changes = match event {
                    FileChangeEvent::Changed(changed) => {
                        let Some(session_id) = changed_session_id(&changed.path) else {
                            continue;
                        };
                        persister.load_session(&session_id).await
                    }
                    FileChangeEvent::Lagged(_) => persister.load_content().await,
                };
                Self::deliver(changes, &listener, &closed);
            }
        }));

        Ok(handle)
    }
}

/// Session owning a changed file, e.g. `sessions/work/s1/_memo.md` -> `s1`.
/// Directory events and unrelated files are ignored.
pub fn changed_session_id(path: &str) -> Option<String> {
    let prefix = format!("{}/", SESSIONS_DIR);
    if !path.starts_with(&prefix) {
        return None;
    }
    let is_session_file = path.ends_with(SESSION_META_FILE)
        || path.ends_with(SESSION_TRANSCRIPT_FILE)
        || path.ends_with(SESSION_NOTE_EXTENSION);
    if !is_session_file {
        return None;
    }
    let (session_id, _) = extract_session_id_and_folder(path)?;
    (session_id != SESSIONS_DIR).then_some(session_id)
}

impl PersisterAdapter for SessionDirPersister {
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
