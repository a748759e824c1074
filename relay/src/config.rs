use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use relay_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Websocket route prefix; peers connect to `<signal_path>/<room_id>`
    pub signal_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            signal_path: "/signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (RELAY_SERVER__PORT, RELAY_SFU__MAX_ROOMS, ...)
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate the whole configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if !self.server.signal_path.starts_with('/') || self.server.signal_path.len() < 2 {
            errors.push(format!(
                "server.signal_path must be an absolute path, got '{}'",
                self.server.signal_path
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Route serving signaling websockets
    #[must_use]
    pub fn signal_route(&self) -> String {
        format!("{}/{{room_id}}", self.server.signal_path.trim_end_matches('/'))
    }
}

/// Pick the config file: explicit path (CLI flag or `RELAY_CONFIG_PATH`)
/// if it exists, else `config.yaml` in CWD
#[must_use]
pub fn resolve_config_path(explicit: Option<String>) -> Option<String> {
    explicit
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:5000");
        assert_eq!(config.signal_route(), "/signal/{room_id}");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 7000\n  signal_path: /rtc/\nlogging:\n  format: json\nsfu:\n  max_peers_per_room: 4\n  negotiation_timeout_ms: 2500"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.signal_route(), "/rtc/{room_id}");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.sfu.max_peers_per_room, 4);
        assert_eq!(config.sfu.negotiation_timeout_ms, 2500);
        assert!(!config.sfu.media_codecs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_prefers_existing_explicit_path() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert_eq!(resolve_config_path(Some(path.clone())), Some(path));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let config = Config::load(missing.to_str()).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.server.port = 0;
        config.server.signal_path = "signal".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.negotiation_timeout_ms = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.starts_with("sfu.negotiation_timeout_ms")));
    }
}
