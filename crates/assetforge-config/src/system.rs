//! System configuration parsing.

use assetforge_core::job::QueueName;
use kdl::{KdlDocument, KdlNode};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::duration::parse_duration;
use crate::nodes::{children_named, first_arg, int_prop, string_args, string_prop};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    /// Absent means the in-memory job store.
    pub database: Option<DatabaseConfig>,
    pub timeouts: TimeoutConfig,
    pub retention: RetentionConfig,
    pub rate_limit: RateLimitConfig,
    pub providers: Vec<ProviderConfig>,
    /// One entry per queue, always covering every [`QueueName`].
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// The three timeout tiers plus the health check cadence.
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutConfig {
    pub health_check: Duration,
    pub health_check_interval: Duration,
    pub generation: Duration,
    pub training: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_check: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            generation: Duration::from_secs(5 * 60),
            training: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionConfig {
    pub max_age: Duration,
    pub cleanup_interval: Duration,
    pub dead_letter_age: Duration,
    /// Dead letters kept per queue.
    pub dead_letter_max: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(5 * 60),
            dead_letter_age: Duration::from_secs(7 * 24 * 3600),
            dead_letter_max: 1000,
        }
    }
}

/// Per-owner submission limits. Windows are fixed (calendar minute, hour
/// and day), not sliding.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    /// Processing jobs one owner may have at once.
    pub concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            per_hour: 100,
            per_day: 500,
            concurrent: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Self-hosted model service.
    LocalService,
    /// Third-party API authenticated with a bearer key.
    HostedApi,
}

impl ProviderKind {
    fn parse(value: &str) -> ConfigResult<Self> {
        match value {
            "local-service" => Ok(ProviderKind::LocalService),
            "hosted-api" => Ok(ProviderKind::HostedApi),
            other => Err(ConfigError::invalid(
                "provider.kind",
                format!("unknown provider kind '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: Url,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub name: QueueName,
    pub concurrency: usize,
    /// Dispatch attempts before a job fails for good. 1 disables retry.
    pub max_attempts: u32,
    /// Maximum non-terminal jobs.
    pub max_size: u64,
    pub lease: Duration,
    pub poll_interval: Duration,
    /// Failover order.
    pub providers: Vec<String>,
}

impl QueueConfig {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            concurrency: 2,
            max_attempts: 1,
            max_size: 1000,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            providers: Vec::new(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            timeouts: TimeoutConfig::default(),
            retention: RetentionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            providers: Vec::new(),
            queues: QueueName::ALL.into_iter().map(QueueConfig::new).collect(),
        }
    }
}

impl SystemConfig {
    pub fn queue(&self, name: QueueName) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Reject configurations the runtime cannot honour.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ConfigError::Duplicate(format!("provider '{}'", provider.id)));
            }
            if provider.kind == ProviderKind::HostedApi && provider.api_key_env.is_none() {
                return Err(ConfigError::MissingField(format!(
                    "api-key-env for hosted-api provider '{}'",
                    provider.id
                )));
            }
        }

        let mut queue_names = HashSet::new();
        for queue in &self.queues {
            if !queue_names.insert(queue.name) {
                return Err(ConfigError::Duplicate(format!("queue '{}'", queue.name)));
            }
            if queue.concurrency == 0 {
                return Err(ConfigError::invalid(
                    format!("queue '{}' concurrency", queue.name),
                    "must be at least 1",
                ));
            }
            if queue.max_attempts == 0 {
                return Err(ConfigError::invalid(
                    format!("queue '{}' max-attempts", queue.name),
                    "must be at least 1",
                ));
            }
            if queue.max_size == 0 {
                return Err(ConfigError::invalid(
                    format!("queue '{}' max-size", queue.name),
                    "must be at least 1",
                ));
            }
            if queue.lease.is_zero() || queue.poll_interval.is_zero() {
                return Err(ConfigError::invalid(
                    format!("queue '{}'", queue.name),
                    "lease and poll-interval must be non-zero",
                ));
            }
            for provider in &queue.providers {
                if !provider_ids.contains(provider.as_str()) {
                    return Err(ConfigError::InvalidReference(format!(
                        "queue '{}' references unknown provider '{}'",
                        queue.name, provider
                    )));
                }
            }
        }

        let t = &self.timeouts;
        let max_age = self.retention.max_age;
        if t.health_check.is_zero() {
            return Err(ConfigError::invalid("timeouts.health-check", "must be non-zero"));
        }
        if t.health_check >= t.health_check_interval {
            return Err(ConfigError::invalid(
                "timeouts",
                "health-check must be shorter than health-check-interval",
            ));
        }
        if t.health_check >= t.generation || t.health_check >= t.training {
            return Err(ConfigError::invalid(
                "timeouts",
                "health-check must be shorter than generation and training",
            ));
        }
        if t.generation >= max_age || t.training >= max_age {
            return Err(ConfigError::invalid(
                "timeouts",
                "generation and training must be shorter than retention max-age",
            ));
        }
        if self.retention.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid(
                "retention.cleanup-interval",
                "must be non-zero",
            ));
        }

        let r = &self.rate_limit;
        if r.per_minute == 0 || r.per_hour == 0 || r.per_day == 0 || r.concurrent == 0 {
            return Err(ConfigError::invalid("rate-limit", "limits must be at least 1"));
        }
        if r.per_minute > r.per_hour || r.per_hour > r.per_day {
            return Err(ConfigError::invalid(
                "rate-limit",
                "per-minute <= per-hour <= per-day",
            ));
        }

        Ok(())
    }
}

/// Read and parse a configuration file.
pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = SystemConfig {
        queues: Vec::new(),
        ..SystemConfig::default()
    };

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(bind) = string_prop(node, "bind") {
                    config.server.bind = bind;
                }
            }
            "database" => {
                let url = string_prop(node, "url")
                    .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
                config.database = Some(DatabaseConfig {
                    url,
                    max_connections: int_prop(node, "max-connections")?.unwrap_or(10),
                });
            }
            "timeouts" => parse_timeouts(node, &mut config.timeouts)?,
            "retention" => {
                if let Some(v) = string_prop(node, "max-age") {
                    config.retention.max_age = parse_duration("retention.max-age", &v)?;
                }
                if let Some(v) = string_prop(node, "cleanup-interval") {
                    config.retention.cleanup_interval =
                        parse_duration("retention.cleanup-interval", &v)?;
                }
                if let Some(v) = string_prop(node, "dead-letter-age") {
                    config.retention.dead_letter_age =
                        parse_duration("retention.dead-letter-age", &v)?;
                }
                if let Some(max) = int_prop(node, "dead-letter-max")? {
                    config.retention.dead_letter_max = max;
                }
            }
            "rate-limit" => parse_rate_limit(node, &mut config.rate_limit)?,
            "provider" => config.providers.push(parse_provider(node)?),
            "queue" => config.queues.push(parse_queue(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    // Queues left out of the file still get a worker pool.
    for name in QueueName::ALL {
        if !config.queues.iter().any(|q| q.name == name) {
            config.queues.push(QueueConfig::new(name));
        }
    }

    config.validate()?;
    Ok(config)
}

fn parse_timeouts(node: &KdlNode, timeouts: &mut TimeoutConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        let key = child.name().value();
        let field = format!("timeouts.{}", key);
        let value = first_arg(child)
            .ok_or_else(|| ConfigError::MissingField(field.clone()))?;
        let duration = parse_duration(&field, &value)?;
        match key {
            "health-check" => timeouts.health_check = duration,
            "health-check-interval" => timeouts.health_check_interval = duration,
            "generation" => timeouts.generation = duration,
            "training" => timeouts.training = duration,
            other => {
                return Err(ConfigError::invalid(
                    "timeouts",
                    format!("unknown timeout '{}'", other),
                ));
            }
        }
    }
    Ok(())
}

fn parse_rate_limit(node: &KdlNode, limits: &mut RateLimitConfig) -> ConfigResult<()> {
    if let Some(v) = int_prop(node, "per-minute")? {
        limits.per_minute = v;
    }
    if let Some(v) = int_prop(node, "per-hour")? {
        limits.per_hour = v;
    }
    if let Some(v) = int_prop(node, "per-day")? {
        limits.per_day = v;
    }
    if let Some(v) = int_prop(node, "concurrent")? {
        limits.concurrent = v;
    }
    Ok(())
}

fn parse_provider(node: &KdlNode) -> ConfigResult<ProviderConfig> {
    let id = first_arg(node)
        .ok_or_else(|| ConfigError::MissingField("provider id".to_string()))?;
    let kind = string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind for provider '{}'", id)))?;
    let base_url = string_prop(node, "base-url")
        .ok_or_else(|| ConfigError::MissingField(format!("base-url for provider '{}'", id)))?;
    let base_url = Url::parse(&base_url).map_err(|e| {
        ConfigError::invalid(format!("provider '{}' base-url", id), e.to_string())
    })?;

    Ok(ProviderConfig {
        kind: ProviderKind::parse(&kind)?,
        base_url,
        api_key_env: string_prop(node, "api-key-env"),
        id,
    })
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueConfig> {
    let name = first_arg(node)
        .ok_or_else(|| ConfigError::MissingField("queue name".to_string()))?;
    let name: QueueName = name
        .parse()
        .map_err(|e: String| ConfigError::invalid("queue", e))?;

    let mut queue = QueueConfig::new(name);
    if let Some(concurrency) = int_prop(node, "concurrency")? {
        queue.concurrency = concurrency;
    }
    if let Some(max_attempts) = int_prop(node, "max-attempts")? {
        queue.max_attempts = max_attempts;
    }
    if let Some(max_size) = int_prop(node, "max-size")? {
        queue.max_size = max_size;
    }
    if let Some(lease) = string_prop(node, "lease") {
        queue.lease = parse_duration(&format!("queue '{}' lease", name), &lease)?;
    }
    if let Some(poll) = string_prop(node, "poll-interval") {
        queue.poll_interval = parse_duration(&format!("queue '{}' poll-interval", name), &poll)?;
    }
    queue.providers = children_named(node, "providers")
        .into_iter()
        .flat_map(string_args)
        .collect();

    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        server bind="127.0.0.1:8080"
        database url="postgres://localhost/assetforge" max-connections=4

        timeouts {
            health-check "2s"
            health-check-interval "15s"
            generation "3m"
            training "20m"
        }
        retention max-age="12h" cleanup-interval="10m" dead-letter-age="3d" dead-letter-max=50
        rate-limit per-minute=5 per-hour=50 per-day=200 concurrent=2

        provider "primary" kind="local-service" base-url="http://gpu-box:8000"
        provider "fallback" kind="hosted-api" base-url="https://api.example.net/v1" api-key-env="FALLBACK_API_KEY"

        queue "asset-generation" concurrency=4 max-attempts=3 max-size=500 lease="90s" {
            providers "primary" "fallback"
        }
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_system_config(FULL).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.database.as_ref().unwrap().max_connections, 4);
        assert_eq!(config.timeouts.health_check, Duration::from_secs(2));
        assert_eq!(config.retention.max_age, Duration::from_secs(12 * 3600));
        assert_eq!(config.retention.dead_letter_age, Duration::from_secs(3 * 24 * 3600));
        assert_eq!(config.retention.dead_letter_max, 50);
        assert_eq!(config.rate_limit.per_minute, 5);
        assert_eq!(config.rate_limit.concurrent, 2);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.provider("fallback").unwrap().kind, ProviderKind::HostedApi);

        let queue = config.queue(QueueName::AssetGeneration).unwrap();
        assert_eq!(queue.concurrency, 4);
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.lease, Duration::from_secs(90));
        assert_eq!(queue.providers, vec!["primary", "fallback"]);
    }

    #[test]
    fn test_unlisted_queue_gets_defaults() {
        let config = parse_system_config(FULL).unwrap();
        let training = config.queue(QueueName::StylePackTraining).unwrap();
        assert_eq!(training.concurrency, 2);
        assert_eq!(training.max_attempts, 1);
        assert_eq!(training.max_size, 1000);
        assert!(training.providers.is_empty());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = SystemConfig::default();
        config.validate().unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.queues.len(), QueueName::ALL.len());
        assert_eq!(config.rate_limit.per_minute, 10);
        assert_eq!(config.rate_limit.per_hour, 100);
        assert_eq!(config.rate_limit.per_day, 500);
        assert_eq!(config.rate_limit.concurrent, 3);
        assert_eq!(config.retention.dead_letter_max, 1000);
    }

    #[test]
    fn test_detect_unknown_provider_reference() {
        let kdl = r#"
            queue "asset-generation" {
                providers "ghost"
            }
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_detect_duplicates() {
        let kdl = r#"
            provider "a" kind="local-service" base-url="http://a"
            provider "a" kind="local-service" base-url="http://b"
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));

        let kdl = r#"
            queue "asset-generation"
            queue "asset-generation"
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_reject_bad_values() {
        for kdl in [
            r#"provider "a" kind="magic" base-url="http://a""#,
            r#"provider "a" kind="local-service" base-url="not a url""#,
            r#"provider "a" kind="hosted-api" base-url="https://a""#,
            r#"queue "asset-generation" concurrency=0"#,
            r#"queue "asset-generation" concurrency=-1"#,
            r#"queue "thumbnails""#,
            r#"rate-limit concurrent=0"#,
            r#"rate-limit per-minute=200 per-hour=100"#,
        ] {
            assert!(parse_system_config(kdl).is_err(), "accepted: {}", kdl);
        }
    }

    #[test]
    fn test_timeout_tiers_must_increase() {
        let kdl = r#"
            timeouts {
                health-check "10m"
                generation "5m"
            }
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let kdl = r#"
            timeouts {
                training "2d"
            }
        "#;
        assert!(parse_system_config(kdl).is_err());
    }
}
