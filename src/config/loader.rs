//! Configuration loading
//!
//! Values are read at startup with the precedence (lowest to highest):
//! built-in defaults, the JSON options file, process environment.

use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Default options file, written by the supervisor when running as an add-on
pub const DEFAULT_OPTIONS_FILE: &str = "/data/options.json";

/// Load the configuration
///
/// Reads `path` (or [`DEFAULT_OPTIONS_FILE`]) when it exists, applies
/// environment overrides on top, and validates the result.
///
/// # Errors
///
/// Returns `ConfigError` when the options file cannot be parsed, an
/// environment override is malformed, or validation fails.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_OPTIONS_FILE));

    let mut config = if path.exists() {
        debug!("Loading configuration from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{e} at {path:?}")))?
    } else {
        debug!("Options file {:?} not present, using defaults", path);
        Config::default()
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(config)
}

/// Load the configuration from a JSON string (no environment overrides)
///
/// # Errors
///
/// Returns `ConfigError` when parsing or validation fails.
pub fn load_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Write a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` when the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(host) = std::env::var("UPSTREAM_HOST") {
        if !host.is_empty() {
            config.upstream_host = host;
        }
    }

    if let Some(port) = parse_env_port("UPSTREAM_PORT")? {
        config.upstream_port = port;
    }
    if let Some(port) = parse_env_port("LISTEN_PORT")? {
        config.listen_port = port;
    }
    if let Some(port) = parse_env_port("WEB_PORT")? {
        config.web_port = port;
    }

    if let Ok(max) = std::env::var("MAX_CLIENTS") {
        config.max_clients = max
            .parse()
            .map_err(|_| ConfigError::env("MAX_CLIENTS", format!("Invalid number: {max}")))?;
    }

    if let Ok(v) = std::env::var("LOG_PACKETS") {
        config.log_packets = v == "true" || v == "1";
    }

    if let Ok(file) = std::env::var("LOG_FILE") {
        config.log_file = file;
    }

    if let Ok(delay) = std::env::var("RECONNECT_DELAY") {
        config.reconnect_initial_secs = delay.parse().map_err(|_| {
            ConfigError::env("RECONNECT_DELAY", format!("Invalid number: {delay}"))
        })?;
    }

    Ok(())
}

fn parse_env_port(name: &str) -> Result<Option<u16>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => {
            let port = v
                .parse()
                .map_err(|_| ConfigError::env(name, format!("Invalid port: {v}")))?;
            Ok(Some(port))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        // Missing options file is fine as long as UPSTREAM_HOST comes from
        // somewhere; here it does not, so validation rejects the result.
        let result = load(Some(Path::new("/nonexistent/options.json")));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"upstream_host": "10.0.0.5", "upstream_port": 9000, "max_clients": 4}}"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.upstream_host, "10.0.0.5");
        assert_eq!(config.upstream_port, 9000);
        assert_eq!(config.max_clients, 4);
        // Untouched fields keep their defaults
        assert_eq!(config.listen_port, 18899);
    }

    #[test]
    fn test_load_str() {
        let config = load_str(r#"{"upstream_host": "bridge.local"}"#).unwrap();
        assert_eq!(config.upstream_host, "bridge.local");
        assert_eq!(config.upstream_port, 8899);
    }

    #[test]
    fn test_load_str_invalid_json() {
        let result = load_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_str_rejects_invalid_values() {
        let result = load_str(r#"{"upstream_host": "h", "max_clients": 0}"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_create_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        create_default_config(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let config: Config = serde_json::from_str(&contents).unwrap();
        assert_eq!(config.listen_port, 18899);
    }
}
