//! File-based suite configuration.
//!
//! A YAML, JSON or TOML file supplies the API location, repeat policy and
//! initial variables. `APISUITE_*` environment variables override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::options::{self, SuiteOption};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration format: {message}")]
    InvalidFormat { message: String },

    #[error("Configuration validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Per-request timeout for the default HTTP doer
    pub request_timeout_ms: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    pub count: usize,
    pub stop_on_failure: bool,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            count: 1,
            stop_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    pub api: ApiConfig,
    pub repeats: RepeatConfig,
    pub trace_timings: bool,
    /// Initial variable values, reset at the start of every repeat
    pub variables: HashMap<String, Value>,
    /// OpenAPI document used for coverage
    pub oas_path: Option<PathBuf>,
    /// Where the JSON run report is written
    pub report_path: Option<PathBuf>,
}

impl SuiteConfig {
    /// Read, apply environment overrides and validate
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::parse(path, &content)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse by file extension
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(content).with_context(|| "Failed to parse YAML configuration")?
            }
            Some("json") => serde_json::from_str(content).with_context(|| "Failed to parse JSON configuration")?,
            Some("toml") => toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?,
            _ => {
                return Err(ConfigError::InvalidFormat {
                    message: format!("Unsupported config file format: {:?}", path),
                }
                .into());
            }
        };
        Ok(config)
    }

    /// Override fields from `APISUITE_*` variables looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("APISUITE_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("APISUITE_PORT") {
            self.api.port = port.parse().with_context(|| "Invalid APISUITE_PORT value")?;
        }
        if let Some(scheme) = lookup("APISUITE_SCHEME") {
            self.api.scheme = scheme;
        }
        if let Some(count) = lookup("APISUITE_REPEATS") {
            self.repeats.count = count.parse().with_context(|| "Invalid APISUITE_REPEATS value")?;
        }
        if let Some(flag) = lookup("APISUITE_STOP_ON_FAILURE") {
            self.repeats.stop_on_failure = parse_flag(&flag).with_context(|| "Invalid APISUITE_STOP_ON_FAILURE value")?;
        }
        if let Some(flag) = lookup("APISUITE_TRACE_TIMINGS") {
            self.trace_timings = parse_flag(&flag).with_context(|| "Invalid APISUITE_TRACE_TIMINGS value")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        match self.api.scheme.as_str() {
            "http" | "https" => {}
            other => errors.push(format!("Invalid scheme: {}", other)),
        }
        if self.api.host.trim().is_empty() {
            errors.push("api.host must not be empty".to_string());
        }
        if self.api.port == 0 {
            errors.push("api.port must be greater than 0".to_string());
        }
        if self.api.request_timeout_ms == Some(0) {
            errors.push("api.request_timeout_ms must be greater than 0".to_string());
        }
        if self.repeats.count == 0 {
            errors.push("repeats.count must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::ValidationFailed { errors }.into());
        }
        Ok(())
    }

    /// Suite options equivalent to this configuration. Reads the OpenAPI
    /// document when one is configured.
    pub fn into_options(self) -> Result<Vec<SuiteOption>> {
        let mut out = vec![
            options::api_scheme(self.api.scheme),
            options::api_host(self.api.host, self.api.port),
            options::repeats(self.repeats.count, self.repeats.stop_on_failure),
        ];
        if let Some(timeout) = self.api.request_timeout_ms {
            out.push(options::request_timeout(Duration::from_millis(timeout)));
        }
        if self.trace_timings {
            out.push(options::trace_timings());
        }

        let mut variables: Vec<_> = self.variables.into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(variables.into_iter().map(|(name, value)| options::var(name, value)));

        if let Some(path) = self.oas_path {
            let file = std::fs::File::open(&path).with_context(|| format!("Failed to open OpenAPI document: {:?}", path))?;
            out.push(options::oas(file));
        }
        if let Some(path) = self.report_path {
            out.push(options::report_path(path));
        }
        Ok(out)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[tokio::test]
    async fn test_load_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("suite.yaml");
        fs::write(
            &path,
            r#"
api:
  host: api.internal
  port: 9090
repeats:
  count: 3
  stop_on_failure: true
variables:
  token: abc
"#,
        )
        .await
        .unwrap();

        let config = SuiteConfig::load(&path).await.unwrap();
        assert_eq!(config.api.host, "api.internal");
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.scheme, "http");
        assert_eq!(config.repeats, RepeatConfig { count: 3, stop_on_failure: true });
        assert_eq!(config.variables["token"], Value::from("abc"));
    }

    #[test]
    fn test_parse_toml() {
        let config = SuiteConfig::parse(
            Path::new("suite.toml"),
            r#"
trace_timings = true

[api]
scheme = "https"
host = "example.test"
port = 443
request_timeout_ms = 2500
"#,
        )
        .unwrap();
        assert!(config.trace_timings);
        assert_eq!(config.api.scheme, "https");
        assert_eq!(config.api.request_timeout_ms, Some(2500));
        assert_eq!(config.repeats.count, 1);
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(SuiteConfig::parse(Path::new("suite.ini"), "").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SuiteConfig::default();
        let env: HashMap<&str, &str> = [
            ("APISUITE_HOST", "staging"),
            ("APISUITE_PORT", "8443"),
            ("APISUITE_SCHEME", "https"),
            ("APISUITE_REPEATS", "5"),
            ("APISUITE_STOP_ON_FAILURE", "yes"),
            ("APISUITE_TRACE_TIMINGS", "1"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|name| env.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.api.host, "staging");
        assert_eq!(config.api.port, 8443);
        assert_eq!(config.api.scheme, "https");
        assert_eq!(config.repeats.count, 5);
        assert!(config.repeats.stop_on_failure);
        assert!(config.trace_timings);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = SuiteConfig::default();
        let result = config.apply_env(|name| (name == "APISUITE_PORT").then(|| "eighty".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = SuiteConfig::default();
        config.api.port = 0;
        config.api.scheme = "ftp".to_string();
        config.repeats.count = 0;
        let err = config.validate().unwrap_err();
        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::ValidationFailed { errors }) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_into_options() {
        let mut config = SuiteConfig::default();
        config.trace_timings = true;
        config.variables.insert("b".to_string(), Value::from(2));
        config.variables.insert("a".to_string(), Value::from(1));
        let options = config.into_options().unwrap();
        let rendered: Vec<String> = options.iter().map(|option| format!("{:?}", option)).collect();
        assert_eq!(
            rendered,
            vec![
                "ApiScheme(http)",
                "ApiHost(localhost, 8080)",
                "Repeats(1, false)",
                "TraceTimings",
                "Var(a, 1)",
                "Var(b, 2)",
            ]
        );
    }

    #[test]
    fn test_missing_oas_file() {
        let config = SuiteConfig {
            oas_path: Some(PathBuf::from("/nonexistent/openapi.yaml")),
            ..SuiteConfig::default()
        };
        assert!(config.into_options().is_err());
    }
}
