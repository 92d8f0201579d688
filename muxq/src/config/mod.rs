//! Application configuration.
//!
//! Loaded from a TOML file (`--config`, else `<config dir>/muxq/config.toml`)
//! and then overridden by `MUXQ_*` environment variables. A missing file
//! means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{DEFAULT_MP4BOX_PROGRAM, Mp4BoxConfig};
use crate::queue::{DEFAULT_EVENT_BUFFER, QueueConfig};
use crate::{Error, Result};

/// Bump when the file layout changes incompatibly.
pub const CONFIG_VERSION: u32 = 1;

pub const ENV_MP4BOX_PATH: &str = "MUXQ_MP4BOX_PATH";
pub const ENV_STORE_PATH: &str = "MUXQ_STORE_PATH";
pub const ENV_LOG_FILTER: &str = "MUXQ_LOG_FILTER";
pub const ENV_LOG_DIR: &str = "MUXQ_LOG_DIR";

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub config_version: u32,
    /// MP4Box binary; a bare name is looked up on `PATH`.
    pub mp4box_path: PathBuf,
    /// Queue file.
    pub store_path: PathBuf,
    /// Tracing filter directive, e.g. `muxq=debug`.
    pub log_filter: Option<String>,
    /// Directory for daily log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Events buffered per subscriber before it is cut off.
    pub event_buffer: usize,
    /// Time MP4Box gets to exit after SIGTERM before it is killed.
    pub cancel_grace_ms: u64,
    /// Output lines kept in a failed job's error.
    pub output_tail_lines: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            mp4box_path: PathBuf::from(DEFAULT_MP4BOX_PROGRAM),
            store_path: default_store_path(),
            log_filter: None,
            log_dir: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            cancel_grace_ms: 3000,
            output_tail_lines: 40,
        }
    }
}

/// `<config dir>/muxq/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("muxq").join("config.toml"))
}

/// `<data dir>/muxq/queue.json`, falling back to the working directory.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("muxq")
        .join("queue.json")
}

impl AppConfig {
    /// Load the configuration and apply environment overrides.
    ///
    /// An explicit `path` must exist; the default location may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                Self::from_file(path)?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file.
    ///
    /// A file written for another config version is moved to
    /// `<name>.v<N>.bak` and defaults are returned.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;

        let table: toml::Table = toml::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        let version = table
            .get("config_version")
            .and_then(|v| v.as_integer())
            .unwrap_or(i64::from(CONFIG_VERSION));

        if version != i64::from(CONFIG_VERSION) {
            let backup = backup_path(path, version);
            std::fs::rename(path, &backup)
                .map_err(|e| Error::io_path("backing up config", path, e))?;
            warn!(
                found = version,
                expected = CONFIG_VERSION,
                backup = %backup.display(),
                "Config version mismatch, starting from defaults"
            );
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Apply `MUXQ_*` overrides; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_MP4BOX_PATH) {
            self.mp4box_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_STORE_PATH) {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_LOG_FILTER) {
            self.log_filter = Some(v);
        }
        if let Some(v) = get(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(Error::config("event_buffer must be greater than 0"));
        }
        if self.output_tail_lines == 0 {
            return Err(Error::config("output_tail_lines must be greater than 0"));
        }
        if self.mp4box_path.as_os_str().is_empty() {
            return Err(Error::config("mp4box_path must not be empty"));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            event_buffer: self.event_buffer,
            cancel_grace: self.cancel_grace(),
        }
    }

    pub fn mp4box_config(&self) -> Mp4BoxConfig {
        Mp4BoxConfig {
            program: self.mp4box_path.clone(),
            cancel_grace: self.cancel_grace(),
            tail_lines: self.output_tail_lines,
        }
    }
}

fn backup_path(path: &Path, version: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "config.toml".into());
    name.push(format!(".v{}.bak", version));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.mp4box_path, PathBuf::from("MP4Box"));
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.cancel_grace(), Duration::from_secs(3));
        assert!(config.store_path.ends_with("muxq/queue.json"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "mp4box_path = \"/opt/gpac/bin/MP4Box\"\ncancel_grace_ms = 500\n",
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.mp4box_path, PathBuf::from("/opt/gpac/bin/MP4Box"));
        assert_eq!(config.cancel_grace(), Duration::from_millis(500));
        assert_eq!(config.output_tail_lines, 40);
    }

    #[test]
    fn test_version_mismatch_backs_up_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_version = 0\ncancel_grace_ms = 500\n").unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.toml.v0.bak").exists());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "event_buffer = \"lots\"\n").unwrap();

        let err = AppConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MP4BOX_PATH, "/usr/local/bin/MP4Box"),
            (ENV_STORE_PATH, "/tmp/q.json"),
            (ENV_LOG_FILTER, "muxq=debug"),
            (ENV_LOG_DIR, ""),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.mp4box_path, PathBuf::from("/usr/local/bin/MP4Box"));
        assert_eq!(config.store_path, PathBuf::from("/tmp/q.json"));
        assert_eq!(config.log_filter.as_deref(), Some("muxq=debug"));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = AppConfig {
            event_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = AppConfig {
            cancel_grace_ms: 500,
            output_tail_lines: 10,
            ..Default::default()
        };
        assert_eq!(config.queue_config().cancel_grace, Duration::from_millis(500));
        assert_eq!(config.mp4box_config().tail_lines, 10);
    }
}
