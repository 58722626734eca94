pub mod cache;
pub mod models;
pub mod preferences;
pub mod server;
