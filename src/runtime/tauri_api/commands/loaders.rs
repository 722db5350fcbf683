use tauri::State;

use crate::adapters::config::Settings;
use crate::core::chat::{load_all_chat_groups, load_single_chat_group};
use crate::core::session::{load_all_session_data, load_single_session};
use crate::core::table::Tables;

use super::super::DesktopState;
use super::shared::current_base;

#[tauri::command]
pub async fn load_chat_groups(state: State<'_, DesktopState>) -> Result<Tables, String> {
    let base = current_base(&Settings::load_global())?;
    let data = load_all_chat_groups(state.fs.as_ref(), &base)
        .await
        .map_err(|e| e.to_string())?;
    Ok(data.into_tables())
}

#[tauri::command]
pub async fn load_chat_group(
    state: State<'_, DesktopState>,
    group_id: String,
) -> Result<Tables, String> {
    let base = current_base(&Settings::load_global())?;
    let data = load_single_chat_group(state.fs.as_ref(), &base, group_id.trim())
        .await
        .map_err(|e| e.to_string())?;
    Ok(data.into_tables())
}

#[tauri::command]
pub async fn load_sessions(state: State<'_, DesktopState>) -> Result<Tables, String> {
    let base = current_base(&Settings::load_global())?;
    let data = load_all_session_data(state.fs.as_ref(), &base)
        .await
        .map_err(|e| e.to_string())?;
    Ok(data.into_tables())
}

#[tauri::command]
pub async fn load_session(
    state: State<'_, DesktopState>,
    session_id: String,
) -> Result<Tables, String> {
    let base = current_base(&Settings::load_global())?;
    let data = load_single_session(state.fs.as_ref(), &base, session_id.trim())
        .await
        .map_err(|e| e.to_string())?;
    Ok(data.into_tables())
}
