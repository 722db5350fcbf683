pub mod config;
pub mod fs;
pub mod markdown;
pub mod watcher;
