use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::{
    algorithms::RateLimitOptions,
    error::{RateLimitError, Result},
    redis::RedisConfig,
};

/// Top level settings for the HTTP front end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    /// Namespace prepended to every store key
    #[serde(default)]
    pub key_prefix: Option<String>,

    #[serde(default = "default_routes")]
    pub routes: Vec<RouteLimit>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            redis: RedisSettings::default(),
            key_prefix: None,
            routes: default_routes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_enable_pipelining")]
    pub enable_pipelining: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            enable_pipelining: default_enable_pipelining(),
        }
    }
}

impl From<RedisSettings> for RedisConfig {
    fn from(settings: RedisSettings) -> Self {
        RedisConfig {
            url: settings.url,
            connection_timeout: Some(Duration::from_millis(settings.connection_timeout_ms)),
            command_timeout: Some(Duration::from_millis(settings.command_timeout_ms)),
            enable_pipelining: settings.enable_pipelining,
        }
    }
}

/// One rate limited route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLimit {
    pub path: String,
    pub algorithm: String,
    pub limit: u64,
    pub window: u64,
}

impl RouteLimit {
    /// Resolve into limiter options, rejecting unknown algorithm names
    pub fn to_options(&self, key_prefix: Option<&str>) -> Result<RateLimitOptions> {
        let mut options = RateLimitOptions::new(self.algorithm.parse()?, self.limit, self.window);
        options.key_prefix = key_prefix.map(str::to_string);
        options.validate()?;
        Ok(options)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_enable_pipelining() -> bool {
    true
}

fn default_routes() -> Vec<RouteLimit> {
    [
        "token-bucket",
        "fixed-window",
        "leaky-bucket",
        "sliding-log",
        "sliding-window",
    ]
    .into_iter()
    .map(|algorithm| RouteLimit {
        path: format!("/{}", algorithm),
        algorithm: algorithm.to_string(),
        limit: 10,
        window: 30,
    })
    .collect()
}

/// Load settings from an optional YAML file overlaid with `RATELIMIT__*` env vars
pub fn load_settings(path: Option<&str>) -> Result<Settings> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(
            config::File::new(path, config::FileFormat::Yaml).required(true),
        );
    }
    builder = builder.add_source(
        config::Environment::with_prefix("RATELIMIT")
            .prefix_separator("__")
            .separator("__"),
    );

    let settings = builder.build()?.try_deserialize::<Settings>()?;
    Ok(settings)
}

/// Parse settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::Algorithm;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.http_addr.port(), 8080);
        assert_eq!(settings.routes.len(), 5);
        assert!(settings.routes.iter().all(|r| r.limit == 10 && r.window == 30));
    }

    #[test]
    fn test_load_settings_from_yaml() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:9000"
redis:
  url: "redis://cache:6379"
  enable_pipelining: false
key_prefix: edge
routes:
  - path: /login
    algorithm: sliding-log
    limit: 5
    window: 60
"#;
        let settings = load_settings_from_yaml(yaml).unwrap();
        assert_eq!(settings.server.http_addr.port(), 9000);
        assert_eq!(settings.redis.url, "redis://cache:6379");
        assert_eq!(settings.redis.command_timeout_ms, 1000);
        assert!(!settings.redis.enable_pipelining);

        let options = settings.routes[0]
            .to_options(settings.key_prefix.as_deref())
            .unwrap();
        assert_eq!(options.algorithm, Algorithm::SlidingLog);
        assert_eq!(options.key_for("x"), "edge:rate_limit:sliding-log:x");
    }

    #[test]
    fn test_route_with_unknown_algorithm() {
        let route = RouteLimit {
            path: "/x".to_string(),
            algorithm: "adaptive".to_string(),
            limit: 1,
            window: 1,
        };
        assert!(matches!(
            route.to_options(None),
            Err(RateLimitError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_redis_settings_conversion() {
        let config: RedisConfig = RedisSettings::default().into();
        assert_eq!(config.command_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.connection_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_load_settings_without_file() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.routes.len(), 5);
    }
}
