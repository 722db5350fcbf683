pub mod app;
pub mod cli;
#[cfg(feature = "desktop")]
pub mod tauri_api;
