use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapters::config::{ConfiguredBase, FixedBase, Settings};
use crate::adapters::fs::LocalFs;
use crate::adapters::watcher::{FileChangeBus, FsWatcher};
use crate::core::chat::{create_chat_persister, ChatDirPersister};
use crate::core::json_file::{create_json_file_persister, JsonFileOptions, JsonFilePersister};
use crate::core::persister::{PersistError, Persister};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::{FileChangePort, NotifyError};
use crate::core::ports::settings::{SettingsError, SettingsPort};
use crate::core::session::{create_session_persister, SessionDirPersister};
use crate::core::store::TableStore;

/// `(table, filename, label)` for every table kept in its own JSON file.
pub const JSON_FILE_TABLES: [(&str, &str, &str); 2] = [
    ("templates", "templates.json", "TemplatePersister"),
    ("chat_shortcuts", "chat_shortcuts.json", "ChatShortcutPersister"),
];

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Only the main window writes; other windows follow the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRole {
    Main,
    Secondary,
}

impl WindowRole {
    pub fn from_label(label: &str) -> Self {
        if label == "main" {
            WindowRole::Main
        } else {
            WindowRole::Secondary
        }
    }
}

pub fn settings_port(settings: &Settings, base_override: Option<&Path>) -> Arc<dyn SettingsPort> {
    match base_override {
        Some(base) => Arc::new(FixedBase::new(base)),
        None => Arc::new(ConfiguredBase::new(settings.clone())),
    }
}

/// The store together with every persister bound to it.
pub struct StoreApp {
    base: PathBuf,
    store: Arc<TableStore>,
    bus: FileChangeBus,
    chat: Persister<ChatDirPersister>,
    sessions: Persister<SessionDirPersister>,
    json_files: Vec<Persister<JsonFilePersister>>,
    watcher: Option<FsWatcher>,
}

impl StoreApp {
    pub async fn start(
        settings: &Settings,
        base_override: Option<&Path>,
        role: WindowRole,
    ) -> Result<Self, AppError> {
        let settings_port = settings_port(settings, base_override);
        let base = settings_port.settings_base().await?;
        let fs: Arc<dyn FsPort> = Arc::new(LocalFs);
        let store = Arc::new(TableStore::new());
        let bus = FileChangeBus::default();

        let listen_mode = settings.listen_mode;
        let (watcher, notify) = if listen_mode.uses_notify() {
            std::fs::create_dir_all(&base).map_err(|source| SettingsError::Io {
                path: base.clone(),
                source,
            })?;
            let watcher = FsWatcher::start(&base, bus.clone(), settings.watch_debounce())?;
            let port: Arc<dyn FileChangePort> = Arc::new(bus.clone());
            (Some(watcher), Some(port))
        } else {
            (None, None)
        };

        let chat = create_chat_persister(
            Arc::clone(&store),
            Arc::clone(&settings_port),
            Arc::clone(&fs),
            notify.clone(),
        );

        let sessions = create_session_persister(
            Arc::clone(&store),
            Arc::clone(&settings_port),
            Arc::clone(&fs),
            notify.clone(),
        );

        let json_files: Vec<_> = JSON_FILE_TABLES
            .iter()
            .map(|(table, filename, label)| {
                create_json_file_persister(
                    Arc::clone(&store),
                    Arc::clone(&settings_port),
                    Arc::clone(&fs),
                    notify.clone(),
                    JsonFileOptions::new(table, filename, label)
                        .listen_mode(listen_mode)
                        .poll_interval(settings.poll_interval()),
                )
            })
            .collect();

        let app = Self {
            base,
            store,
            bus,
            chat,
            sessions,
            json_files,
            watcher,
        };

        match role {
            WindowRole::Main => {
                app.chat.start_auto_persisting().await?;
                app.sessions.start_auto_persisting().await?;
                for persister in &app.json_files {
                    persister.start_auto_persisting().await?;
                }
            }
            WindowRole::Secondary => {
                app.chat.start_auto_load().await?;
                app.sessions.start_auto_load().await?;
                for persister in &app.json_files {
                    persister.start_auto_load().await?;
                }
            }
        }

        log::info!(
            "[app] persisting under {} ({} mode)",
            app.base.display(),
            listen_mode
        );
        Ok(app)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    /// Channel for change notifications that arrive from outside the process
    /// watcher, e.g. the desktop shell.
    pub fn bus(&self) -> &FileChangeBus {
        &self.bus
    }

    pub async fn save_all(&self) {
        self.chat.save().await;
        self.sessions.save().await;
        for persister in &self.json_files {
            persister.save().await;
        }
    }

    pub fn stop(&mut self) {
        self.chat.stop();
        self.sessions.stop();
        for persister in &self.json_files {
            persister.stop();
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl Drop for StoreApp {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{StoreApp, WindowRole};
    use crate::adapters::config::Settings;
    use crate::core::json_file::ListenMode;
    use crate::core::persister::PersisterState;
    use serde_json::json;
    use std::time::Duration;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("echonote-app-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn window_role_from_label() {
        assert_eq!(WindowRole::from_label("main"), WindowRole::Main);
        assert_eq!(WindowRole::from_label("settings"), WindowRole::Secondary);
    }

    #[tokio::test]
    async fn main_window_loads_and_writes_back() {
        let base = temp_dir();
        std::fs::create_dir_all(base.join("chats").join("g1")).expect("create dirs");
        std::fs::write(
            base.join("chats").join("g1").join("messages.json"),
            r#"{"chat_group":{"id":"g1","title":"Standup"},"messages":[]}"#,
        )
        .expect("write chat");
        std::fs::write(base.join("templates.json"), r#"{"t1":{"title":"Weekly"}}"#)
            .expect("write templates");
        std::fs::create_dir_all(base.join("sessions").join("s1")).expect("create session dir");
        std::fs::write(
            base.join("sessions").join("s1").join("_memo.md"),
            "---\nid: s1\n---\n\nRaw thoughts\n",
        )
        .expect("write memo");

        let settings = Settings {
            listen_mode: ListenMode::Poll,
            ..Settings::default()
        };
        let mut app = StoreApp::start(&settings, Some(&base), WindowRole::Main)
            .await
            .expect("start");
        assert_eq!(app.chat.state(), PersisterState::Listening);

        let store = app.store();
        assert_eq!(
            store.get_cell("chat_groups", "g1", "title"),
            Some(json!("Standup"))
        );
        assert!(store.get_row("templates", "t1").is_some());
        assert_eq!(
            store.get_cell("sessions", "s1", "raw_md"),
            Some(json!("Raw thoughts"))
        );

        store.set_row(
            "templates",
            "t2",
            json!({"title": "1:1"}).as_object().cloned().expect("object"),
        );
        let templates = base.join("templates.json");
        let mut written = String::new();
        for _ in 0..100 {
            written = std::fs::read_to_string(&templates).unwrap_or_default();
            if written.contains("t2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(written.contains("t2"));

        store.set_cell("sessions", "s1", "raw_md", json!("Edited"));
        let memo = base.join("sessions").join("s1").join("_memo.md");
        let mut memo_text = String::new();
        for _ in 0..100 {
            memo_text = std::fs::read_to_string(&memo).unwrap_or_default();
            if memo_text.contains("Edited") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(memo_text.contains("Edited"));
        assert!(base.join("sessions").join("s1").join("_meta.json").exists());

        app.stop();
        let _ = std::fs::remove_dir_all(base);
    }
}
