//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use sotto_core::ChatResult;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub admission: AdmissionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// `[admission]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4480
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    crate::admission::DEFAULT_MAX_ATTEMPTS
}
fn default_window_secs() -> u64 {
    crate::admission::DEFAULT_WINDOW_SECS
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub sweep_interval_secs: u64,
    pub admission_max_attempts: u32,
    pub admission_window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            sweep_interval_secs: default_sweep_interval(),
            admission_max_attempts: default_max_attempts(),
            admission_window_secs: default_window_secs(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_sweep_interval: Option<u64>,
    ) -> ChatResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    sotto_core::ChatError::Other(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            bind: cli_bind
                .map(|s| s.to_string())
                .unwrap_or(file_config.server.bind),
            port: cli_port.unwrap_or(file_config.server.port),
            sweep_interval_secs: cli_sweep_interval
                .unwrap_or(file_config.server.sweep_interval_secs),
            admission_max_attempts: file_config.admission.max_attempts,
            admission_window_secs: file_config.admission.window_secs,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
