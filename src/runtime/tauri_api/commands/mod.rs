pub(super) mod loaders;
pub(super) mod settings;
pub(super) mod shared;
pub(super) mod watcher;
