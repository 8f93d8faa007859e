//! Runtime configuration
//!
//! Every section has defaults, so an absent or partial TOML file is fine:
//!
//! ```toml
//! [fetch]
//! min_interval_ms = 750
//! max_retries = 3
//!
//! [export]
//! dark_mode = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NetworkError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub fetch: FetchConfig,
    pub community: CommunityConfig,
    pub layout: LayoutConfig,
    pub export: ExportConfig,
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NetworkError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.page_size == 0 {
            return Err(NetworkError::Config("api.page_size must be positive".into()));
        }
        if self.fetch.max_backoff_ms < self.fetch.initial_backoff_ms {
            return Err(NetworkError::Config(
                "fetch.max_backoff_ms must be >= fetch.initial_backoff_ms".into(),
            ));
        }
        if self.community.max_passes == 0 || self.community.max_levels == 0 {
            return Err(NetworkError::Config(
                "community.max_passes and community.max_levels must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Remote mutual-friends endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_agent: String,
    pub page_size: usize,
    pub page_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.vrchat.cloud/api/1".to_string(),
            user_agent: concat!("friend-network/", env!("CARGO_PKG_VERSION")).to_string(),
            page_size: 100,
            page_delay_ms: 200,
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Pacing and retry policy of the fetch loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Minimum gap between two requests
    pub min_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Retries after the first attempt before a friend is marked as error
    pub max_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 500,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    /// Local-move passes per level
    pub max_passes: usize,
    /// Aggregation levels
    pub max_levels: usize,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            max_passes: 100,
            max_levels: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub iterations: usize,
    pub width: f64,
    pub height: f64,
    /// Pull toward the centroid of the node's community, relative to edge attraction
    pub community_gravity: f64,
    pub seed: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            width: 1600.0,
            height: 1200.0,
            community_gravity: 0.08,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub title: String,
    pub dark_mode: bool,
    /// Also write a Graphviz rendering next to the HTML page
    pub dot: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            title: "Friend Network".to_string(),
            dark_mode: false,
            dot: false,
        }
    }
}

/// Files the pipeline owns inside its data directory
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<platform data dir>/friend-network`, or the working directory as a fallback
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("friend-network"))
            .unwrap_or_else(|| PathBuf::from("friend-network-data"))
    }

    pub fn cache_file(&self) -> PathBuf {
        self.root.join("mutual_cache.jsonl")
    }

    pub fn session_file(&self) -> PathBuf {
        self.root.join("session.json")
    }

    pub fn html_file(&self) -> PathBuf {
        self.root.join("friend_network.html")
    }

    pub fn json_file(&self) -> PathBuf {
        self.root.join("friend_network.json")
    }

    pub fn dot_file(&self) -> PathBuf {
        self.root.join("friend_network.dot")
    }

    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
