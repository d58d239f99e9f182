//! Configuration loaded from `~/.config/glint/config.toml`.
//!
//! A default file is written on first run if none exists; a partial file
//! only overrides the sections it names.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket: SocketConfig,
    pub display: DisplayConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Override for the IPC socket path; defaults to
    /// `$XDG_RUNTIME_DIR/glint.sock`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Virtual output size for the headless platform.
    pub width: i32,
    pub height: i32,
    /// Draw ticks per second.
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Re-broadcast `echo` payloads to every client.
    pub echo_broadcast: bool,
    /// Upload every surface in full on every frame.
    pub force_full_upload: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            frame_rate: 60,
        }
    }
}

impl Config {
    /// Load from the config file, or fall back to defaults (and write them
    /// out) when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            info!("config file not found at {}, using defaults", path.display());
            if let Err(e) = Self::save_default(&path) {
                warn!("failed to create default config file: {e:#}");
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .path
            .clone()
            .unwrap_or_else(glint_ipc::socket_path)
    }

    fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("failed to locate config directory")?
            .join("glint");
        Ok(dir.join("config.toml"))
    }

    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(&Self::default()).context("failed to serialize defaults")?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }
}
