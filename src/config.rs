// Application configuration - YAML file plus environment overrides

//! # Configuration
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. A YAML file (`--config` / `PIPELINER_CONFIG`, `~` is expanded)
//! 3. Environment variables prefixed with `PIPELINER__`, sections separated
//!    by a double underscore: `PIPELINER__HTTP__MAX_RETRIES=5`
//!
//! A `.env` file is loaded into the process environment before the
//! environment source is read. The resulting [`AppConfig`] is immutable; the
//! server hands pieces of it to the components at startup.

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::engine::pipeline::{EngineLimits, DEFAULT_MAX_DEPTH, DEFAULT_MAX_STEPS};
use crate::integrations::http::RetryPolicy;
use crate::integrations::Endpoints;
use crate::{PipelinerError, Result};

pub const ENV_PREFIX: &str = "PIPELINER";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub function_store: ServiceConfig,
    pub remedy: RemedyConfig,
    pub ngsa: NgsaConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub people: ServiceConfig,
    pub calendar: CalendarConfig,
    pub delegation: ServiceConfig,
    pub workgroup: ServiceConfig,
    pub sequence: ServiceConfig,
    pub sla: SlaConfig,
    pub sso: SsoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow any origin (editor front-ends served elsewhere)
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
            cors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_steps_per_task: usize,
    pub max_nesting_depth: usize,
    /// Run mode when a request does not say `with_stop`
    pub async_run_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_task: DEFAULT_MAX_STEPS,
            max_nesting_depth: DEFAULT_MAX_DEPTH,
            async_run_default: true,
        }
    }
}

/// A service reachable at a base URL; empty means not configured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
}

impl ServiceConfig {
    pub fn url(&self) -> Option<&str> {
        Some(self.base_url.as_str()).filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemedyConfig {
    pub base_url: String,
    pub fail_on_bad_status: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NgsaConfig {
    pub collector_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub base_url: String,
    /// Unit whose calendar applies when none is named
    pub default_unit_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkHoursOverride {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub work_hours_override: Option<WorkHoursOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsoConfig {
    pub client_id: String,
    /// Name of the environment variable holding the client secret
    pub client_secret_env: String,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret_env: "PIPELINER_SSO_CLIENT_SECRET".to_string(),
        }
    }
}

impl SsoConfig {
    pub fn client_secret(&self) -> Option<String> {
        std::env::var(&self.client_secret_env).ok().filter(|s| !s.is_empty())
    }
}

impl AppConfig {
    /// Load `.env`, then defaults, the optional YAML file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("loaded .env");
        }
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("PIPELINER_CONFIG").ok());
        Self::from_sources(path.as_deref())
    }

    /// Build from the file and the environment without touching `.env`
    pub fn from_sources(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let expanded = shellexpand::full(path)
                .map_err(|e| PipelinerError::Config(format!("can't expand {}: {}", path, e)))?
                .into_owned();
            if !Path::new(&expanded).exists() {
                return Err(PipelinerError::Config(format!("config file {} not found", expanded)));
            }
            info!(path = %expanded, "reading configuration file");
            builder = builder.add_source(File::new(&expanded, FileFormat::Yaml));
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document on top of the defaults; environment is ignored
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_steps_per_task == 0 {
            return Err(PipelinerError::Config("engine.max_steps_per_task must be positive".to_string()));
        }
        if self.cache.max_entries == 0 {
            return Err(PipelinerError::Config("cache.max_entries must be positive".to_string()));
        }
        let urls = [
            ("function_store.base_url", &self.function_store.base_url),
            ("remedy.base_url", &self.remedy.base_url),
            ("ngsa.collector_url", &self.ngsa.collector_url),
            ("people.base_url", &self.people.base_url),
            ("calendar.base_url", &self.calendar.base_url),
            ("delegation.base_url", &self.delegation.base_url),
            ("workgroup.base_url", &self.workgroup.base_url),
            ("sequence.base_url", &self.sequence.base_url),
        ];
        for (key, value) in urls {
            if !value.is_empty() {
                Url::parse(value).map_err(|e| PipelinerError::Config(format!("{} {:?}: {}", key, value, e)))?;
            }
        }
        if let Some(hours) = self.sla.work_hours_override {
            if hours.start >= hours.end || hours.end > 24 {
                return Err(PipelinerError::Config(format!(
                    "sla.work_hours_override {}..{} is not a valid window",
                    hours.start, hours.end
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            max_steps: self.engine.max_steps_per_task,
            max_depth: self.engine.max_nesting_depth,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http.max_retries,
            retry_delay: Duration::from_millis(self.http.retry_delay_ms),
            timeout: Duration::from_millis(self.http.timeout_ms),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            function_store: self.function_store.base_url.clone(),
            remedy: self.remedy.base_url.clone(),
            remedy_fail_on_bad_status: self.remedy.fail_on_bad_status,
            ngsa: self.ngsa.collector_url.clone(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_steps_per_task, 10_000);
        assert_eq!(config.engine.max_nesting_depth, 16);
        assert_eq!(config.http.max_retries, 3);
        assert_eq!(config.retry_policy().retry_delay, Duration::from_millis(500));
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.cache.max_entries, 10_000);
        assert!(!config.remedy.fail_on_bad_status);
        assert!(config.people.url().is_none());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = AppConfig::from_yaml(
            r#"
server:
  port: 9000
engine:
  max_steps_per_task: 50
function_store:
  base_url: http://functions:8080
remedy:
  base_url: http://remedy
  fail_on_bad_status: true
sla:
  work_hours_override: { start: 8, end: 17 }
"#,
        )
        .unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.limits().max_steps, 50);
        assert_eq!(config.limits().max_depth, 16);
        let endpoints = config.endpoints();
        assert_eq!(endpoints.function_store, "http://functions:8080");
        assert!(endpoints.remedy_fail_on_bad_status);
        assert_eq!(config.sla.work_hours_override, Some(WorkHoursOverride { start: 8, end: 17 }));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AppConfig::from_yaml("engine:\n  max_steps_per_task: 0\n").is_err());
        assert!(AppConfig::from_yaml("remedy:\n  base_url: \"not a url\"\n").is_err());
        assert!(AppConfig::from_yaml("sla:\n  work_hours_override: { start: 14, end: 6 }\n").is_err());
        assert!(AppConfig::from_yaml("cache:\n  max_entries: 0\n").is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            AppConfig::from_sources(Some("/nonexistent/pipeliner.yaml")),
            Err(PipelinerError::Config(_))
        ));
    }
}
