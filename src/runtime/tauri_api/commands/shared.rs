use std::path::PathBuf;

use crate::adapters::config::Settings;

pub(crate) fn current_base(settings: &Settings) -> Result<PathBuf, String> {
    settings.settings_base().map_err(|e| e.to_string())
}
