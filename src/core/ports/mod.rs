pub mod fs;
pub mod notify;
pub mod settings;
