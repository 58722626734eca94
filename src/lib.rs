pub mod backend;
pub mod config;
pub mod error;
pub mod reader;

pub use error::{Error, Result};
