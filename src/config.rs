//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `dashboard.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Where the JSON API listens.
//!     - DatabaseConfig: Hosted Postgres REST endpoint, key and table names.
//!     - FeedConfig: Detection window size, poll fallback, webhook secret.
//!     - HistoryConfig: How many rows the history view pulls and pages.
//!     - LoggingConfig: Default log level when RUST_LOG is unset.
//!
//! environment overrides:
//!     LEAKWATCH_DATABASE_URL, LEAKWATCH_API_KEY, LEAKWATCH_WEBHOOK_SECRET
//!
//! ==============================================================================

use anyhow::{bail, Context};
use log::{info, warn};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DashboardConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// project url, e.g. https://abcd.supabase.co
    pub url: String,
    pub api_key: String,
    pub sensors_table: String,
    pub events_table: String,
    pub timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            sensors_table: "sensors".to_string(),
            events_table: "detections".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    /// newest N detections pulled per refresh
    pub window_size: usize,
    /// 0 disables the polling fallback
    pub poll_interval_seconds: u64,
    pub webhook_secret: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            poll_interval_seconds: 15,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub limit: usize,
    pub page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { limit: 200, page_size: 20 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl DashboardConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DashboardConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("dashboard.toml"),
            std::path::PathBuf::from("..").join("config").join("dashboard.toml"),
        ];

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        info!("[CONFIG] Loaded from {}", path.display());
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        warn!("[CONFIG] Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        let mut config = config.unwrap_or_else(|| {
            warn!("[CONFIG] No config file found - using defaults");
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay secrets and endpoints from the environment.
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(url) = lookup("LEAKWATCH_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("LEAKWATCH_API_KEY") {
            self.database.api_key = key;
        }
        if let Some(secret) = lookup("LEAKWATCH_WEBHOOK_SECRET") {
            self.feed.webhook_secret = Some(secret);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.feed.window_size == 0 {
            bail!("feed.window_size must be at least 1");
        }
        if self.history.page_size == 0 {
            bail!("history.page_size must be at least 1");
        }
        if self.history.limit == 0 {
            bail!("history.limit must be at least 1");
        }
        if self.database.url.trim().is_empty() {
            bail!("database.url must not be empty");
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        info!("┌─────────────────────────────────────────┐");
        info!("│         DASHBOARD CONFIGURATION         │");
        info!("├─────────────────────────────────────────┤");
        info!("│ Bind: {}", self.server.bind);
        info!("│ Database: {}", self.database.url);
        info!("│ API key: {}", if self.database.api_key.is_empty() { "(none)" } else { "(set)" });
        info!("│ Window: {} events", self.feed.window_size);
        info!("│ Poll Interval: {}s", self.feed.poll_interval_seconds);
        info!("│ History: {} rows, {} per page", self.history.limit, self.history.page_size);
        info!("└─────────────────────────────────────────┘");
    }
}
