use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

pub const DEFAULT_CATALOG: &str = "./config.json";
pub const DEFAULT_TARGETS: &str = "./target_domains.json";
pub const DEFAULT_RESULT_BUFFER: usize = 10;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 500;

/// User settings from `~/.reconpipe/reconpipe.toml`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub catalog_path: Option<String>,
    pub targets_path: Option<String>,
    pub result_buffer: Option<usize>,
    pub chunk_size: Option<usize>,
    pub drain_grace_ms: Option<u64>,
}

/// Resolved engine tuning, with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of each result channel.
    pub result_buffer: usize,
    /// Read size used by the output streamer.
    pub chunk_size: usize,
    /// How long to keep draining pipes after the child has exited.
    pub drain_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_buffer: DEFAULT_RESULT_BUFFER,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
        }
    }
}

impl Config {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".reconpipe"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("reconpipe.toml"))
    }

    pub fn catalog_path(&self) -> PathBuf {
        expand_tilde(self.catalog_path.as_deref().unwrap_or(DEFAULT_CATALOG))
    }

    pub fn targets_path(&self) -> PathBuf {
        expand_tilde(self.targets_path.as_deref().unwrap_or(DEFAULT_TARGETS))
    }

    /// Zero values fall back to defaults; a zero-capacity channel or read
    /// buffer would be unusable.
    pub fn engine(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            result_buffer: self
                .result_buffer
                .filter(|n| *n > 0)
                .unwrap_or(defaults.result_buffer),
            chunk_size: self
                .chunk_size
                .filter(|n| *n > 0)
                .unwrap_or(defaults.chunk_size),
            drain_grace: self
                .drain_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_grace),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        rlog_debug!(
            "Config loaded: catalog={:?}, targets={:?}, buffer={:?}, chunk={:?}",
            config.catalog_path,
            config.targets_path,
            config.result_buffer,
            config.chunk_size
        );
        Ok(config)
    }

    /// Every field filled in with its current or default value.
    pub fn with_defaults(&self) -> Self {
        let engine = self.engine();
        Self {
            catalog_path: Some(
                self.catalog_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CATALOG.to_string()),
            ),
            targets_path: Some(
                self.targets_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TARGETS.to_string()),
            ),
            result_buffer: Some(engine.result_buffer),
            chunk_size: Some(engine.chunk_size),
            drain_grace_ms: Some(engine.drain_grace.as_millis() as u64),
        }
    }

    /// Write to `~/.reconpipe/reconpipe.toml` and return the path.
    pub fn save(&self) -> Result<PathBuf> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        ensure_dir(&Self::app_dir()?)
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        rlog_debug!("Creating app directory: {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
