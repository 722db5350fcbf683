mod commands;

use std::sync::{Arc, Mutex};

use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Emitter, Manager, Runtime};

use crate::adapters::fs::LocalFs;
use crate::adapters::watcher::{FileChangeBus, FsWatcher};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::FileChangeEvent;

pub const PLUGIN_NAME: &str = "echonote-store";
pub const FILE_CHANGED_EVENT: &str = "echonote-store:file-changed";

/// Shared by every command of the plugin. Every bus event is forwarded to
/// the frontend as [`FILE_CHANGED_EVENT`].
pub struct DesktopState {
    pub(crate) bus: FileChangeBus,
    pub(crate) fs: Arc<dyn FsPort>,
    pub(crate) watcher: Mutex<Option<FsWatcher>>,
}

impl Default for DesktopState {
    fn default() -> Self {
        Self {
            bus: FileChangeBus::default(),
            fs: Arc::new(LocalFs),
            watcher: Mutex::new(None),
        }
    }
}

impl DesktopState {
    pub fn bus(&self) -> &FileChangeBus {
        &self.bus
    }
}

/// Registers the loader, settings and file change commands with a Tauri app.
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new(PLUGIN_NAME)
        .invoke_handler(tauri::generate_handler![
            commands::settings::get_config,
            commands::settings::set_content_base_path,
            commands::settings::set_listen_mode,
            commands::settings::settings_base,
            commands::loaders::load_chat_groups,
            commands::loaders::load_chat_group,
            commands::loaders::load_sessions,
            commands::loaders::load_session,
            commands::watcher::notify_file_changed,
            commands::watcher::ensure_watcher,
            commands::watcher::stop_watcher,
        ])
        .setup(|app, _api| {
            let state = DesktopState::default();
            let mut stream = state.bus.stream();
            let app_handle = app.clone();
            tauri::async_runtime::spawn(async move {
                while let Some(event) = stream.next().await {
                    if let FileChangeEvent::Changed(changed) = event {
                        if let Err(error) = app_handle.emit(FILE_CHANGED_EVENT, &changed) {
                            log::warn!("[watcher] failed to emit change: {}", error);
                        }
                    }
                }
            });
            app.manage(state);
            Ok(())
        })
        .build()
}
