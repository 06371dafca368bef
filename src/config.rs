//! Server configuration.
//!
//! Loaded from a TOML file at startup. Field names match the keys listed in
//! the protocol's configuration surface (`address`, `port`, `files`,
//! `index time`, `total downloads`, ...); the on-disk format is TOML rather
//! than the original plist-like file, which the specification treats as an
//! external, unspecified structured key-value format.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiredConfig {
    /// Addresses to listen on. Empty means "all interfaces".
    #[serde(default)]
    pub address: Vec<String>,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name advertised in `server_info`.
    #[serde(default = "default_name")]
    pub name: String,

    /// Server description advertised in `server_info`.
    #[serde(default)]
    pub description: String,

    /// Path to a banner image, if any.
    #[serde(default)]
    pub banner: Option<PathBuf>,

    /// Root of the shared file hierarchy (4.G).
    pub files: PathBuf,

    /// Root of the account store (4.B).
    #[serde(default = "default_accounts_dir")]
    pub accounts_dir: PathBuf,

    /// Root of the board hierarchy (4.F).
    #[serde(default = "default_boards_dir")]
    pub boards_dir: PathBuf,

    /// Path to the banlist file (4.C).
    #[serde(default = "default_banlist_path")]
    pub banlist_path: PathBuf,

    /// Directory for event log files (4.I).
    #[serde(default = "default_events_dir")]
    pub events_dir: PathBuf,

    /// Path to the protocol schema XML (4.A).
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,

    /// TLS certificate and key (delegated to `tokio-rustls`).
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Seconds between search-index rebuilds; 0 disables rebuilding.
    #[serde(default = "default_index_time")]
    pub index_time: u64,

    #[serde(default)]
    pub transfers: TransferConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub news_limit: u32,
}

fn default_port() -> u16 {
    4871
}
fn default_name() -> String {
    "Wired Server".to_string()
}
fn default_accounts_dir() -> PathBuf {
    PathBuf::from("accounts")
}
fn default_boards_dir() -> PathBuf {
    PathBuf::from("boards")
}
fn default_banlist_path() -> PathBuf {
    PathBuf::from("banlist")
}
fn default_events_dir() -> PathBuf {
    PathBuf::from("events")
}
fn default_schema_path() -> PathBuf {
    PathBuf::from("assets/schema.xml")
}
fn default_index_time() -> u64 {
    3600
}

/// Transfer engine caps and speed limits (4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 0 = unlimited.
    #[serde(default)]
    pub total_downloads: u32,
    #[serde(default)]
    pub total_uploads: u32,
    /// Bytes/sec, 0 = unlimited.
    #[serde(default)]
    pub total_download_speed: u64,
    #[serde(default)]
    pub total_upload_speed: u64,
    /// Seconds a Waiting transfer may sit before being dropped and rescheduled.
    #[serde(default = "default_waiting_timeout")]
    pub waiting_timeout_secs: u64,
}

fn default_waiting_timeout() -> u64 {
    20
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            total_downloads: 0,
            total_uploads: 0,
            total_download_speed: 0,
            total_upload_speed: 0,
            waiting_timeout_secs: default_waiting_timeout(),
        }
    }
}

/// Tracker-registration configuration. The tracker protocol itself is out of
/// scope (spec.md §1); only the on/off switch and category list are kept so
/// `WiredConfig` round-trips the full configuration surface of §6.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerConfig {
    #[serde(default)]
    pub enable_tracker: bool,
    #[serde(default)]
    pub category: Vec<String>,
}

impl WiredConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let config: WiredConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn builder(files: impl Into<PathBuf>) -> ConfigBuilder {
        ConfigBuilder::new(files)
    }
}

/// Builder for tests and the CLI's `--files` convenience flag, mirroring the
/// teacher's `ConfigBuilder` pattern for `CommyConfig`.
pub struct ConfigBuilder {
    config: WiredConfig,
}

impl ConfigBuilder {
    pub fn new(files: impl Into<PathBuf>) -> Self {
        Self {
            config: WiredConfig {
                address: Vec::new(),
                port: default_port(),
                name: default_name(),
                description: String::new(),
                banner: None,
                files: files.into(),
                accounts_dir: default_accounts_dir(),
                boards_dir: default_boards_dir(),
                banlist_path: default_banlist_path(),
                events_dir: default_events_dir(),
                schema_path: default_schema_path(),
                tls_cert: None,
                tls_key: None,
                index_time: default_index_time(),
                transfers: TransferConfig::default(),
                tracker: TrackerConfig::default(),
                news_limit: 0,
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn accounts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.accounts_dir = dir.into();
        self
    }

    pub fn boards_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.boards_dir = dir.into();
        self
    }

    pub fn banlist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.banlist_path = path.into();
        self
    }

    pub fn events_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.events_dir = dir.into();
        self
    }

    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schema_path = path.into();
        self
    }

    pub fn transfers(mut self, transfers: TransferConfig) -> Self {
        self.config.transfers = transfers;
        self
    }

    pub fn build(self) -> WiredConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = WiredConfig::builder("/tmp/wired-files").build();
        assert_eq!(config.port, 4871);
        assert_eq!(config.transfers.total_downloads, 0);
    }

    #[test]
    fn load_parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wired.toml");
        std::fs::write(&path, "files = \"/srv/wired\"\n\n[transfers]\n").unwrap();
        let config = WiredConfig::load(&path).unwrap();
        assert_eq!(config.files, PathBuf::from("/srv/wired"));
        assert_eq!(config.port, 4871);
    }
}
