use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{decode::DecodeOptions, session::DeliveryMode, store::StoreBackend};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for git-graph-sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSyncConfig {
    /// How the object database is read
    #[serde(default)]
    pub backend: StoreBackend,
    /// Snapshot delivery: one JSON array, or one message per element
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Capacity of the change-event channel
    #[serde(default = "defaults::event_buffer")]
    pub event_buffer: usize,
    /// Bound on one store operation in milliseconds, 0 for none
    #[serde(default = "defaults::timeout_ms")]
    pub read_timeout_ms: u64,
    /// Bound on one transport send in milliseconds, 0 for none
    #[serde(default = "defaults::timeout_ms")]
    pub send_timeout_ms: u64,
    /// Emit edges for every parent of a merge commit, not just the first
    #[serde(default)]
    pub all_parents: bool,
    /// Re-hash loose objects on read (loose backend only)
    #[serde(default)]
    pub verify_hashes: bool,
    /// Number of commits in the history report
    #[serde(default = "defaults::history_commits")]
    pub history_commits: usize,
}

impl Default for GraphSyncConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            delivery: DeliveryMode::default(),
            event_buffer: defaults::event_buffer(),
            read_timeout_ms: defaults::timeout_ms(),
            send_timeout_ms: defaults::timeout_ms(),
            all_parents: false,
            verify_hashes: false,
            history_commits: defaults::history_commits(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("Failed to parse {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

impl GraphSyncConfig {
    /// Load configuration from the config file (if any) and environment variables
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let config_path = match explicit_path {
            Some(path) => Some(expand_tilde(path)),
            None => Self::config_file_path(),
        };

        let mut config = match config_path {
            Some(path) if path.exists() => {
                tracing::debug!("loading git-graph-sync config from {:?}", path);
                Self::load_from_file(&path)?
            }
            Some(path) if explicit_path.is_some() => {
                anyhow::bail!("config file not found at {:?}", path);
            }
            _ => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = env::var("GIT_GRAPH_SYNC_BACKEND") {
            self.backend = serde_yaml::from_str(&backend)
                .with_context(|| format!("Failed to parse GIT_GRAPH_SYNC_BACKEND: {:?}", backend))?;
        }

        if let Ok(delivery) = env::var("GIT_GRAPH_SYNC_DELIVERY") {
            self.delivery = serde_yaml::from_str(&delivery).with_context(|| {
                format!("Failed to parse GIT_GRAPH_SYNC_DELIVERY: {:?}", delivery)
            })?;
        }

        if let Some(buffer) = parse_env("GIT_GRAPH_SYNC_EVENT_BUFFER")? {
            self.event_buffer = buffer;
        }

        if let Some(ms) = parse_env("GIT_GRAPH_SYNC_READ_TIMEOUT_MS")? {
            self.read_timeout_ms = ms;
        }

        if let Some(ms) = parse_env("GIT_GRAPH_SYNC_SEND_TIMEOUT_MS")? {
            self.send_timeout_ms = ms;
        }

        if let Some(all_parents) = parse_env("GIT_GRAPH_SYNC_ALL_PARENTS")? {
            self.all_parents = all_parents;
        }

        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Default config file path, overridable with GIT_GRAPH_SYNC_CONFIG
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("GIT_GRAPH_SYNC_CONFIG") {
            return Some(expand_tilde(&PathBuf::from(path)));
        }
        dirs::home_dir().map(|home| home.join(".config/git-graph-sync/config.yaml"))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            all_parents: self.all_parents,
        }
    }
}

mod defaults {
    pub(crate) fn event_buffer() -> usize {
        1024
    }

    pub(crate) fn timeout_ms() -> u64 {
        30_000
    }

    pub(crate) fn history_commits() -> usize {
        4
    }
}
