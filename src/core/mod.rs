pub mod chat;
pub mod json_file;
pub mod paths;
pub mod persister;
pub mod ports;
pub mod session;
pub mod store;
pub mod table;

#[cfg(test)]
pub mod testing;
