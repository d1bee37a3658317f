//! Process configuration: TOML file + CLI overrides.
//!
//! Grounded on the teacher's `wsh-server::config::ServerConfig::load` —
//! same file-then-CLI merge shape, trimmed to the one thing this process
//! actually needs to know before it can start: where the declared
//! service-tree document lives, and at what level to log.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use overlay_core::error::{OverlayError, OverlayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeSection,
}

/// `[node]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            log_level: default_log_level(),
        }
    }
}

fn default_config_path() -> String {
    "~/.overlay/services.json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved process configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path to the JSON service-tree document (the root Group's declaration).
    pub service_doc_path: PathBuf,
    /// Log level passed to `tracing_subscriber::EnvFilter` when `RUST_LOG`
    /// is unset.
    pub log_level: String,
}

impl NodeConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// If `config_path` points to a file that does not exist, defaults are
    /// used silently. CLI arguments, when `Some`, take precedence over the
    /// file values.
    pub fn load(
        config_path: Option<&Path>,
        cli_service_doc: Option<&str>,
        cli_log_level: Option<&str>,
    ) -> OverlayResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded).map_err(OverlayError::Io)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| OverlayError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    node: NodeSection::default(),
                }
            }
        } else {
            ConfigFile {
                node: NodeSection::default(),
            }
        };

        let service_doc_str = cli_service_doc
            .map(|s| s.to_string())
            .unwrap_or(file_config.node.config_path);
        let log_level = cli_log_level
            .map(|s| s.to_string())
            .unwrap_or(file_config.node.log_level);

        Ok(Self {
            service_doc_path: expand_tilde_str(&service_doc_str),
            log_level,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
