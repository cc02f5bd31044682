//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check identity (server ids present and unique)
//! - Validate value ranges (timeouts > 0, pool bounds ordered, cache limits)
//! - Validate deployment parameters (image, command, socket URL, memory format)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: OrchestratorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{
    CacheConfig, CircuitBreakerConfig, Deployment, OrchestratorConfig, PoolConfig, ServerConfig,
};
use crate::error::OrchestratorError;

/// A single semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a whole configuration.
pub fn validate_config(config: &OrchestratorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (i, server) in config.servers.iter().enumerate() {
        collect_server_errors(server, &format!("servers[{}]", i), &mut errors);
        if !server.id.is_empty() && !seen.insert(server.id.as_str()) {
            errors.push(ValidationError::new(
                format!("servers[{}].id", i),
                format!("duplicate server id '{}'", server.id),
            ));
        }
    }

    collect_pool_errors(&config.pool, "pool", &mut errors);
    collect_breaker_errors(&config.circuit_breaker, &mut errors);
    collect_cache_errors(&config.cache, &mut errors);

    if config.orchestrator.request_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "orchestrator.request_timeout_ms",
            "must be greater than zero",
        ));
    }
    if config.batching.max_batch_size == 0 {
        errors.push(ValidationError::new("batching.max_batch_size", "must be at least 1"));
    }
    if config.batching.request_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "batching.request_timeout_ms",
            "must be greater than zero",
        ));
    }
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be at least 1"));
    }
    if config.retries.multiplier < 1.0 {
        errors.push(ValidationError::new("retries.multiplier", "must be >= 1.0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one server definition, as done at registration time.
pub fn validate_server(server: &ServerConfig) -> Result<(), OrchestratorError> {
    let mut errors = Vec::new();
    collect_server_errors(server, &server.id, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Configuration(join(&errors)))
    }
}

/// Validate pool parameters on their own, as done when a pool is created.
pub fn validate_pool(pool: &PoolConfig) -> Result<(), OrchestratorError> {
    let mut errors = Vec::new();
    collect_pool_errors(pool, "pool", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Configuration(join(&errors)))
    }
}

pub(crate) fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn collect_server_errors(server: &ServerConfig, prefix: &str, errors: &mut Vec<ValidationError>) {
    if server.id.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.id", prefix), "must not be empty"));
    }
    if server.server_type.trim().is_empty() {
        errors.push(ValidationError::new(
            format!("{}.server_type", prefix),
            "must not be empty",
        ));
    }

    match &server.deployment {
        Deployment::Container(spec) => {
            if spec.image.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.deployment.image", prefix),
                    "must not be empty",
                ));
            }
            if spec.port == 0 {
                errors.push(ValidationError::new(
                    format!("{}.deployment.port", prefix),
                    "must be a valid port",
                ));
            }
            if !spec.path.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("{}.deployment.path", prefix),
                    "must start with '/'",
                ));
            }
            if spec.start_attempts == 0 {
                errors.push(ValidationError::new(
                    format!("{}.deployment.start_attempts", prefix),
                    "must be at least 1",
                ));
            }
        }
        Deployment::Subprocess(spec) => {
            if spec.command.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.deployment.command", prefix),
                    "must not be empty",
                ));
            }
            if let Some(endpoint) = &spec.endpoint {
                let is_http = url::Url::parse(endpoint)
                    .map(|u| matches!(u.scheme(), "http" | "https"))
                    .unwrap_or(false);
                if !is_http {
                    errors.push(ValidationError::new(
                        format!("{}.deployment.endpoint", prefix),
                        format!("'{}' is not an http(s) URL", endpoint),
                    ));
                }
            }
        }
        Deployment::Socket(spec) => {
            match url::Url::parse(&spec.url) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
                Ok(url) => errors.push(ValidationError::new(
                    format!("{}.deployment.url", prefix),
                    format!("unsupported scheme '{}', expected ws or wss", url.scheme()),
                )),
                Err(e) => errors.push(ValidationError::new(
                    format!("{}.deployment.url", prefix),
                    format!("invalid URL: {}", e),
                )),
            }
            if spec.call_timeout_ms == 0 {
                errors.push(ValidationError::new(
                    format!("{}.deployment.call_timeout_ms", prefix),
                    "must be greater than zero",
                ));
            }
        }
    }

    if let Some(memory) = &server.resources.memory {
        if parse_memory_limit(memory).is_none() {
            errors.push(ValidationError::new(
                format!("{}.resources.memory", prefix),
                format!("'{}' is not a memory size like 512m or 2g", memory),
            ));
        }
    }
    if let Some(cpus) = server.resources.cpus {
        if cpus <= 0.0 {
            errors.push(ValidationError::new(
                format!("{}.resources.cpus", prefix),
                "must be greater than zero",
            ));
        }
    }
    if let Some(health) = &server.health_check {
        if health.interval_secs == 0 || health.timeout_secs == 0 {
            errors.push(ValidationError::new(
                format!("{}.health_check", prefix),
                "interval and timeout must be greater than zero",
            ));
        }
    }
    if server.auto_scaling.min_instances > server.auto_scaling.max_instances {
        errors.push(ValidationError::new(
            format!("{}.auto_scaling", prefix),
            "min_instances must not exceed max_instances",
        ));
    }
    if server.request_timeout_ms == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.request_timeout_ms", prefix),
            "must be greater than zero",
        ));
    }
}

fn collect_pool_errors(pool: &PoolConfig, prefix: &str, errors: &mut Vec<ValidationError>) {
    if pool.max_connections == 0 {
        errors.push(ValidationError::new(
            format!("{}.max_connections", prefix),
            "must be at least 1",
        ));
    }
    if pool.min_connections > pool.max_connections {
        errors.push(ValidationError::new(
            format!("{}.min_connections", prefix),
            "must not exceed max_connections",
        ));
    }
    if pool.acquire_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.acquire_timeout_ms", prefix),
            "must be greater than zero",
        ));
    }
    if pool.health_check.max_failures == 0 {
        errors.push(ValidationError::new(
            format!("{}.health_check.max_failures", prefix),
            "must be at least 1",
        ));
    }
}

fn collect_breaker_errors(breaker: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new(
            "circuit_breaker.failure_threshold",
            "must be at least 1",
        ));
    }
    if breaker.reset_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "circuit_breaker.reset_timeout_ms",
            "must be greater than zero",
        ));
    }
}

fn collect_cache_errors(cache: &CacheConfig, errors: &mut Vec<ValidationError>) {
    if cache.max_entries == 0 {
        errors.push(ValidationError::new("cache.max_entries", "must be at least 1"));
    }
    if cache.max_size_bytes == 0 {
        errors.push(ValidationError::new("cache.max_size_bytes", "must be at least 1"));
    }
}

/// Parse "512m", "2g", "1024k" or plain bytes.
pub fn parse_memory_limit(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value.as_str(), 1),
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ContainerSpec, SocketSpec};

    #[test]
    fn memory_limits() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("4096"), Some(4096));
        assert_eq!(parse_memory_limit("m"), None);
        assert_eq!(parse_memory_limit("12x"), None);
        assert_eq!(parse_memory_limit("1.5g"), None);
    }

    #[test]
    fn reports_every_problem() {
        let mut config = OrchestratorConfig::default();
        config.servers.push(ServerConfig::subprocess("a", "", vec![]));
        config.servers.push(ServerConfig::subprocess("a", "cat", vec![]));
        config.servers.push(ServerConfig::with_deployment(
            "sock",
            Deployment::Socket(SocketSpec {
                url: "http://example.com".into(),
                call_timeout_ms: 1000,
            }),
        ));
        config.pool.min_connections = 20;
        config.cache.max_entries = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"servers[0].deployment.command"));
        assert!(fields.contains(&"servers[1].id"));
        assert!(fields.contains(&"servers[2].deployment.url"));
        assert!(fields.contains(&"pool.min_connections"));
        assert!(fields.contains(&"cache.max_entries"));
    }

    #[test]
    fn single_server_validation() {
        let mut server = ServerConfig::with_deployment(
            "img",
            Deployment::Container(ContainerSpec {
                image: "mcp/x".into(),
                port: 8080,
                path: "/mcp".into(),
                runtime: "docker".into(),
                args: vec![],
                start_attempts: 5,
                shutdown_grace_secs: 10,
            }),
        );
        assert!(validate_server(&server).is_ok());

        server.resources.memory = Some("lots".into());
        assert!(matches!(
            validate_server(&server),
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&OrchestratorConfig::default()).is_ok());
    }
}
