//! Configuration management for memstream
//!
//! Handles config file loading/saving and player binary selection.
//! Config is stored at ~/.config/memstream/config.toml

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::MIB;
use crate::player::{locate_player, LaunchOptions, PlayerError};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit mpv binary
    pub mpv_path: Option<PathBuf>,
    /// Smallest read-ahead window in bytes
    pub readahead_min_bytes: u64,
    /// Wait after asking the player to quit before killing it
    pub quit_grace_ms: u64,
    /// Control endpoint connect attempts
    pub connect_attempts: u32,
    /// Delay between connect attempts
    pub connect_interval_ms: u64,
    /// Piece size used for local transfers
    pub piece_length: u64,
    /// Queue every media file after the selected one
    pub stream_all: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mpv_path: None,
            readahead_min_bytes: 8 * MIB,
            quit_grace_ms: 500,
            connect_attempts: 50,
            connect_interval_ms: 100,
            piece_length: MIB,
            stream_all: false,
        }
    }
}

impl Config {
    /// Get config file path (~/.config/memstream/config.toml)
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("memstream").join("config.toml"))
    }

    /// Load config from the default path, or return default if not found
    pub fn load() -> Self {
        Self::path()
            .map(|p| Self::load_from(&p))
            .unwrap_or_default()
    }

    /// Load config from `path`; a missing or invalid file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    /// Player launch settings with the binary resolved from, in order: the
    /// command line, `MPV_PATH`, this config, then the usual install locations.
    pub fn launch_options(&self, explicit: Option<&Path>) -> Result<LaunchOptions, PlayerError> {
        let program = locate_player(explicit, self.mpv_path.as_deref())?;
        Ok(LaunchOptions::new(program)
            .with_connect(self.connect_attempts, self.connect_interval())
            .with_quit_grace(self.quit_grace()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.mpv_path.is_none());
        assert_eq!(config.readahead_min_bytes, 8 * MIB);
        assert_eq!(config.quit_grace(), Duration::from_millis(500));
        assert_eq!(config.connect_attempts, 50);
        assert!(!config.stream_all);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str("quit_grace_ms = 1500\nstream_all = true\n").unwrap();
        assert_eq!(config.quit_grace_ms, 1500);
        assert!(config.stream_all);
        assert_eq!(config.piece_length, MIB);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            mpv_path: Some(PathBuf::from("/opt/mpv/bin/mpv")),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_invalid_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "quit_grace_ms = \"soon\"").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn test_launch_options_use_explicit_binary() {
        let config = Config {
            quit_grace_ms: 250,
            ..Config::default()
        };
        let options = config
            .launch_options(Some(Path::new("/usr/local/bin/mpv")))
            .unwrap();
        assert_eq!(options.program, PathBuf::from("/usr/local/bin/mpv"));
        assert_eq!(options.quit_grace, Duration::from_millis(250));
    }
}
