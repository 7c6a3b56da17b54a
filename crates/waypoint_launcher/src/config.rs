//! Launcher configuration.
//!
//! Loaded from a TOML file that is created with defaults on first run.
//! Command-line flags are applied on top with [`AppConfig::apply_args`].

use crate::cli::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use waypoint::config::MatchmakingConfig;

/// Application configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    #[serde(default)]
    pub lists: ListSettings,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where the favorites and recent lists are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSettings {
    /// Local list directory; each instance gets a subdirectory
    pub local_dir: PathBuf,
    /// Optional synced directory kept alongside the local copy
    pub cloud_dir: Option<PathBuf>,
    /// Byte budget shared by every list file in the cloud directory
    pub cloud_quota_bytes: u64,
    pub favorites_max_entries: usize,
    pub recent_max_entries: usize,
}

impl Default for ListSettings {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("lists"),
            cloud_dir: None,
            cloud_quota_bytes: 1024 * 1024,
            favorites_max_entries: waypoint::server_list::DEFAULT_MAX_ENTRIES,
            recent_max_entries: 20,
        }
    }
}

/// Settings for hosting a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub name: String,
    pub max_players: u32,
    /// Protects the session when set
    pub password: Option<String>,
    pub port: u16,
    /// `host:port` answering a plain HTTP GET with the caller's address
    pub public_ip_endpoint: Option<String>,
    pub public_ip_path: String,
    pub public_ip_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "Waypoint Session".to_string(),
            max_players: 10,
            password: None,
            port: 2456,
            public_ip_endpoint: None,
            public_ip_path: "/".to_string(),
            public_ip_timeout_ms: 5_000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing the defaults there first if
    /// the file doesn't exist.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(name) = &args.name {
            self.host.name = name.clone();
        }
        if args.host {
            if let Some(password) = &args.password {
                self.host.password = Some(password.clone());
            }
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        self.matchmaking.max_players = self.host.max_players;
    }

    /// Local list directory for one launcher instance.
    pub fn local_list_dir(&self, instance: &str) -> PathBuf {
        self.lists.local_dir.join(instance)
    }

    pub fn cloud_list_dir(&self, instance: &str) -> Option<PathBuf> {
        self.lists.cloud_dir.as_ref().map(|dir| dir.join(instance))
    }

    /// Hosted session name, suffixed with the instance unless it is the default one.
    pub fn session_name(&self, instance: &str) -> String {
        if instance == "default" {
            self.host.name.clone()
        } else {
            format!("{} ({})", self.host.name, instance)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.matchmaking
            .validate()
            .map_err(|e| format!("Invalid matchmaking settings: {e}"))?;

        if self.host.name.trim().is_empty() {
            return Err("Host name cannot be empty".to_string());
        }
        if self.host.port == 0 {
            return Err("Host port cannot be 0".to_string());
        }
        if self.lists.recent_max_entries == 0 || self.lists.favorites_max_entries == 0 {
            return Err("List capacities must be at least 1".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
