use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            detection: DetectionConfig::default(),
            firewall: FirewallConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/synban/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("synban/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Network interface to capture on
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// A record is flagged once it holds strictly more distinct
    /// destination ports than this
    #[serde(default = "default_port_threshold")]
    pub port_threshold: usize,

    /// Lifetime of a cache entry since its last write (seconds)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl DetectionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            port_threshold: default_port_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Name of the isolated chain in the filter table
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Addresses never blocked, in addition to the capture interface's
    /// own address
    #[serde(default)]
    pub allow_list: Vec<Ipv4Addr>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            allow_list: Vec::new(),
        }
    }
}

// Default value functions
fn default_interface() -> String {
    "eth0".to_string()
}

fn default_port_threshold() -> usize {
    3
}

fn default_cache_ttl_secs() -> u64 {
    60 // 1 minute
}

fn default_chain() -> String {
    "synban".to_string()
}
