//! Server configuration: TOML file + CLI overrides.

use crate::matching::MatchSettings;
use duet_core::{DuetError, DuetResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub matching: MatchingSection,
    #[serde(default)]
    pub moderation: ModerationSection,
    #[serde(default)]
    pub geo: GeoSection,
    #[serde(default)]
    pub journal: JournalSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// `[matching]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingSection {
    /// Seconds without an activity signal before a connection is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for MatchingSection {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[moderation]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSection {
    #[serde(default = "default_report_threshold")]
    pub report_threshold: u32,
    /// Seconds a report stays on the tally.
    #[serde(default = "default_report_window")]
    pub report_window: u64,
}

impl Default for ModerationSection {
    fn default() -> Self {
        Self {
            report_threshold: default_report_threshold(),
            report_window: default_report_window(),
        }
    }
}

/// `[geo]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoSection {
    /// Lookup URL with an `{ip}` placeholder. Unset disables geolocation.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_geo_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GeoSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_geo_timeout_ms(),
        }
    }
}

/// `[journal]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalSection {
    /// JSON-lines output file. Unset disables the journal.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    4480
}
fn default_max_connections() -> usize {
    10_000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_report_threshold() -> u32 {
    3
}
fn default_report_window() -> u64 {
    3600
}
fn default_geo_timeout_ms() -> u64 {
    1500
}

/// Values given on the command line. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub report_threshold: Option<u32>,
    pub report_window: Option<u64>,
    pub geo_endpoint: Option<String>,
    pub journal: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout: u64,
    pub report_threshold: u32,
    pub report_window: u64,
    pub geo_endpoint: Option<String>,
    pub geo_timeout_ms: u64,
    pub journal_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> DuetResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file_config, cli))
    }

    fn merge(file: ConfigFile, cli: CliOverrides) -> Self {
        let journal = cli.journal.or(file.journal.path);
        Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            idle_timeout: cli.idle_timeout.unwrap_or(file.matching.idle_timeout),
            report_threshold: cli
                .report_threshold
                .unwrap_or(file.moderation.report_threshold),
            report_window: cli.report_window.unwrap_or(file.moderation.report_window),
            geo_endpoint: cli.geo_endpoint.or(file.geo.endpoint),
            geo_timeout_ms: file.geo.timeout_ms,
            journal_path: journal.as_deref().map(expand_tilde_str),
        }
    }

    /// Matching-engine tunables derived from this config.
    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            report_threshold: self.report_threshold,
            report_window: Duration::from_secs(self.report_window),
        }
    }
}

fn parse_config(content: &str) -> DuetResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| DuetError::Config(format!("config parse error: {e}")))
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
