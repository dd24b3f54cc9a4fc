//! Application configuration.
//!
//! Layered as defaults, then the TOML config file, then `LUNCHTRIP__*`
//! environment variables (`LUNCHTRIP__SERVER__PORT=9000`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::ws::DEFAULT_QUEUE_CAPACITY;

pub const APP_NAME: &str = "lunchtrip";

const ENV_PREFIX: &str = "LUNCHTRIP";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Location hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Snapshots buffered per connection before the oldest is dropped.
    pub queue_capacity: usize,
    /// Seconds between keepalive pings on idle streams.
    pub ping_interval_secs: u64,
    /// Seconds a single frame may take to reach the socket before the
    /// stream is dropped as a write error.
    pub write_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ping_interval_secs: 30,
            write_timeout_secs: 10,
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither `RUST_LOG` nor a verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("reading config from {}", path.display()))?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }
}

/// Write a commented default config file, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&AppConfig::default().to_toml()?);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve the config file path, honoring an explicit override.
pub fn resolve_config_path(override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(path) => match path.to_str() {
            Some(text) => expand_str_path(text),
            None => Ok(path.to_path_buf()),
        },
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hub.queue_capacity, 16);
        assert_eq!(config.hub.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.hub.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
        assert!(config.auth.jwt_secret.is_none());
    }

    #[test]
    fn test_timers_have_floor() {
        let hub = HubConfig {
            ping_interval_secs: 0,
            write_timeout_secs: 0,
            ..HubConfig::default()
        };
        assert_eq!(hub.ping_interval(), Duration::from_secs(1));
        assert_eq!(hub.write_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.hub.queue_capacity, 16);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9100

[hub]
queue_capacity = 4
write_timeout_secs = 3

[auth]
jwt_secret = "0123456789abcdef0123456789abcdef"
allowed_origins = ["http://localhost:3000"]

[[auth.users]]
id = "alice"
name = "Alice"
password_hash = "$2b$04$abcdefghijklmnopqrstuu"
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.hub.queue_capacity, 4);
        assert_eq!(config.hub.ping_interval_secs, 30);
        assert_eq!(config.hub.write_timeout(), Duration::from_secs(3));
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].name, "Alice");
        assert_eq!(config.auth.allowed_origins, vec!["http://localhost:3000"]);
        assert!(config.auth.validate().is_ok());
    }

    #[test]
    fn test_write_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for lunchtrip"));

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.hub.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_resolve_config_path_override() {
        let path = resolve_config_path(Some(Path::new("/tmp/lunchtrip.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/lunchtrip.toml"));

        let default = resolve_config_path(None).unwrap();
        assert!(default.ends_with("lunchtrip/config.toml"));
    }
}
