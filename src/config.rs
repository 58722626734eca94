use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const APP_DIR: &str = "tachi-reader";
pub const SERVER_ENV: &str = "TACHI_READER_SERVER";

const MAX_MEMORY_PAGES: usize = 50;
const MAX_MEMORY_MB: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub reader: ReaderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4567".to_string(),
            timeout_secs: 30,
            user_agent: format!("tachi-reader/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_pages: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_pages: MAX_MEMORY_PAGES,
            max_bytes: MAX_MEMORY_MB * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Pages past the current one that are fetched eagerly.
    pub look_ahead: usize,
    pub max_concurrent_pages: usize,
    pub animation_frames: u32,
    pub frame_millis: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            look_ahead: 1,
            max_concurrent_pages: 3,
            animation_frames: 6,
            frame_millis: 16,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    pub fn default_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// Reads the config file if it exists, then applies the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let mut config = Self::load_file(&path)?;
        config.apply_env(std::env::var(SERVER_ENV).ok());
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn apply_env(&mut self, server: Option<String>) {
        if let Some(url) = server.filter(|url| !url.trim().is_empty()) {
            self.server.url = url;
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
