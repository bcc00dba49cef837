// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use castcore::format::MountRuntimeConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

const fn default_queue_size_limit() -> u64 {
    1024 * 1024
}

const fn default_burst_size_bytes() -> u64 {
    65536
}

const fn default_source_timeout_secs() -> u64 {
    10
}

/// One statically declared mountpoint's fallback and sizing configuration —
/// the "Fallback configuration (persisted externally)" fields.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct MountConfig {
    #[serde(default)]
    pub fallback_mount: Option<String>,
    #[serde(default)]
    pub fallback_override: bool,
    #[serde(default)]
    pub fallback_when_full: bool,
    #[serde(default)]
    pub max_listeners: Option<u32>,
    #[serde(default = "default_queue_size_limit")]
    pub queue_size_limit: u64,
    #[serde(default = "default_burst_size_bytes")]
    pub burst_size_bytes: u64,
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fallback_mount: None,
            fallback_override: false,
            fallback_when_full: false,
            max_listeners: None,
            queue_size_limit: default_queue_size_limit(),
            burst_size_bytes: default_burst_size_bytes(),
            source_timeout_secs: default_source_timeout_secs(),
        }
    }
}

impl MountConfig {
    /// Folds this mount's sizing fields onto the process-wide framer
    /// defaults to produce the [`MountRuntimeConfig`] the core activates a
    /// Source with.
    #[must_use]
    pub fn to_runtime(&self, framer: &FramerConfig) -> MountRuntimeConfig {
        MountRuntimeConfig {
            fallback_mount: self.fallback_mount.clone(),
            fallback_override: self.fallback_override,
            fallback_when_full: self.fallback_when_full,
            max_listeners: self.max_listeners,
            queue_size_limit: self.queue_size_limit,
            burst_size_bytes: self.burst_size_bytes,
            source_timeout_secs: self.source_timeout_secs,
            mp3_sync_frames: u32::from(framer.mp3_sync_frames),
            desync_tolerance_bytes: framer.desync_tolerance_bytes,
            icy_metaint: framer.icy_metaint,
        }
    }
}

const fn default_mp3_sync_frames() -> u8 {
    4
}

const fn default_desync_tolerance_bytes() -> u64 {
    20_000
}

const fn default_icy_metaint() -> u32 {
    16_000
}

/// Process-wide framer tuning, shared by every mount unless a future
/// per-mount override is added.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct FramerConfig {
    #[serde(default = "default_mp3_sync_frames")]
    pub mp3_sync_frames: u8,
    #[serde(default = "default_desync_tolerance_bytes")]
    pub desync_tolerance_bytes: u64,
    #[serde(default = "default_icy_metaint")]
    pub icy_metaint: u32,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            mp3_sync_frames: default_mp3_sync_frames(),
            desync_tolerance_bytes: default_desync_tolerance_bytes(),
            icy_metaint: default_icy_metaint(),
        }
    }
}

/// TLS is explicitly out of the core's scope; this field is reserved for an
/// outer reverse-proxy/HTTP layer and is never read by the streaming core.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8000".to_string()
}

const fn default_max_sources() -> u32 {
    64
}

const fn default_max_clients() -> u32 {
    10_000
}

/// HTTP-facing server configuration.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Cap on concurrently reserved+running sources, independent of any
    /// single mount's `max_listeners`.
    #[serde(default = "default_max_sources")]
    pub max_sources: u32,
    /// Process-wide listener ceiling, independent of per-mount caps.
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_sources: default_max_sources(),
            max_clients: default_max_clients(),
            tls: None,
        }
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: true,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./castd.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Telemetry and observability configuration (OpenTelemetry).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub tracing_enable: bool,
    pub otlp_endpoint: Option<String>,
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
    #[serde(default)]
    pub tokio_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            tracing_enable: false,
            otlp_endpoint: None,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
            tokio_console: false,
        }
    }
}

/// Root configuration for the castd server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mounts: HashMap<String, MountConfig>,
    /// Fallback values applied to mounts created dynamically at
    /// producer-connect time rather than statically declared here.
    #[serde(default)]
    pub default_mount: MountConfig,
    #[serde(default)]
    pub framer: FramerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// environment variables prefixed `CASTD_` (double-underscore separated for
/// nested keys, e.g. `CASTD_SERVER__LISTEN_ADDRESS`).
///
/// # Errors
///
/// Returns an error if the configuration file contains invalid TOML, or if
/// environment variables or file values fail to deserialize into [`Config`].
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("CASTD_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to
/// TOML; this would indicate a programming error.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let toml_str = generate_default().unwrap();
        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.server.listen_address, Config::default().server.listen_address);
    }

    #[test]
    fn missing_config_file_is_reported_not_fatal() {
        let result = load("/nonexistent/castd.toml").unwrap();
        assert!(result.file_missing.is_some());
    }

    #[test]
    fn mount_config_folds_framer_defaults_into_runtime() {
        let mount = MountConfig { max_listeners: Some(10), ..Default::default() };
        let framer = FramerConfig::default();
        let runtime = mount.to_runtime(&framer);
        assert_eq!(runtime.max_listeners, Some(10));
        assert_eq!(runtime.mp3_sync_frames, framer.mp3_sync_frames);
    }
}
