use std::sync::PoisonError;

use tauri::State;

use crate::adapters::config::Settings;
use crate::adapters::watcher::FsWatcher;

use super::super::DesktopState;
use super::shared::current_base;

/// Publishes a change reported by the webview onto the bus. `path` is
/// relative to the data directory.
#[tauri::command]
pub async fn notify_file_changed(
    state: State<'_, DesktopState>,
    path: String,
) -> Result<usize, String> {
    let path = path.trim().replace('\\', "/");
    if path.is_empty() {
        return Err("path is required".to_string());
    }
    Ok(state.bus.publish(path))
}

pub(crate) fn stop_watcher_internal(state: &DesktopState) {
    let existing = state
        .watcher
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(mut watcher) = existing {
        watcher.stop();
    }
}

/// Starts the data directory watcher when the listen mode asks for it.
/// Returns whether a watcher is running afterwards.
#[tauri::command]
pub async fn ensure_watcher(state: State<'_, DesktopState>) -> Result<bool, String> {
    let settings = Settings::load_global();
    if !settings.listen_mode.uses_notify() {
        stop_watcher_internal(&state);
        return Ok(false);
    }

    let base = current_base(&settings)?;
    {
        let guard = state.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|watcher| watcher.root() == base) {
            return Ok(true);
        }
    }

    stop_watcher_internal(&state);
    let watcher = FsWatcher::start(&base, state.bus.clone(), settings.watch_debounce())
        .map_err(|e| e.to_string())?;
    *state.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
    Ok(true)
}

#[tauri::command]
pub async fn stop_watcher(state: State<'_, DesktopState>) -> Result<(), String> {
    stop_watcher_internal(&state);
    Ok(())
}
