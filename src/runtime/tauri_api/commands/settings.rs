use crate::adapters::config::Settings;
use crate::core::json_file::ListenMode;

use super::shared::current_base;

#[tauri::command]
pub async fn get_config() -> Result<Settings, String> {
    Ok(Settings::load_global())
}

#[tauri::command]
pub async fn set_content_base_path(path: Option<String>) -> Result<String, String> {
    let mut settings = Settings::load_global();
    settings.set_content_base_path(path.as_deref());
    settings.save().map_err(|e| e.to_string())?;
    let base = current_base(&settings)?;
    Ok(base.to_string_lossy().to_string())
}

#[tauri::command]
pub async fn set_listen_mode(mode: String) -> Result<(), String> {
    let mut settings = Settings::load_global();
    settings.listen_mode = mode.parse::<ListenMode>()?;
    settings.save().map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn settings_base() -> Result<String, String> {
    let base = current_base(&Settings::load_global())?;
    Ok(base.to_string_lossy().to_string())
}
