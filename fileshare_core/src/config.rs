use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::transfer::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_READ_TIMEOUT_SECS, DEFAULT_STORAGE_DIR, TRANSFER_PORT,
};
use crate::transfer::session::SessionLimits;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "fileshare";
const APP_NAME: &str = "fileshare";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (tests, portable installs)
pub const CONFIG_DIR_ENV: &str = "FILESHARE_CONFIG_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: TRANSFER_PORT,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_frame_size: self.max_frame_size,
        }
    }

    /// How long a connection may sit between requests
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from a specific file. A missing file yields the defaults; an
    /// unreadable one is logged and also yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Could not read config {}: {}", path.display(), e);
                return Self::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring invalid config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Save config to disk
    pub fn save(&self) -> io::Result<PathBuf> {
        let path = Self::config_path()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no config directory available"))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }
}

/// The user's download folder, falling back to ~/Downloads and then ./downloads
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| {
            dirs.download_dir()
                .map(Path::to_path_buf)
                .or_else(|| Some(dirs.home_dir().join("Downloads")))
        })
        .unwrap_or_else(|| PathBuf::from("downloads"))
}
