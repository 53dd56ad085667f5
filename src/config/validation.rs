#![allow(clippy::collapsible_if)]

use crate::{
    config::models::{
        CacheConfig, CacheRule, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig,
        PoolConfig, ServiceConfig,
    },
    utils::pattern::path_glob,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Duplicate instance '{instance}' in service '{service}'")]
    DuplicateInstance { service: String, instance: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator. Runs once at startup; every problem found is
/// reported together so operators can fix a config file in one pass.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (name, service) in &config.services {
            if let Err(mut service_errors) = Self::validate_service(name, service) {
                errors.append(&mut service_errors);
            }
        }

        if let Err(mut health_check_errors) =
            Self::validate_health_check_config(&config.health_check)
        {
            errors.append(&mut health_check_errors);
        }

        if let Err(mut breaker_errors) =
            Self::validate_breaker_config("circuit_breaker", &config.circuit_breaker)
        {
            errors.append(&mut breaker_errors);
        }
        for (service, breaker) in &config.circuit_breaker_overrides {
            if let Err(mut breaker_errors) = Self::validate_breaker_config(
                &format!("circuit_breaker_overrides.{service}"),
                breaker,
            ) {
                errors.append(&mut breaker_errors);
            }
        }

        if let Err(e) = Self::validate_pool_config("pool", &config.pool) {
            errors.push(e);
        }
        for (service, pool) in &config.pool_overrides {
            if let Err(e) = Self::validate_pool_config(&format!("pool_overrides.{service}"), pool)
            {
                errors.push(e);
            }
        }

        if config.pool_maintenance.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "pool_maintenance.interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.pool_maintenance.sweep_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "pool_maintenance.sweep_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Err(mut cache_errors) = Self::validate_cache_config(&config.cache) {
            errors.append(&mut cache_errors);
        }

        for (i, rule) in config.dispatcher.cache_rules.iter().enumerate() {
            if let Err(e) = Self::validate_cache_rule(i, rule) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services.<name>".to_string(),
            });
        }

        if service.instances.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}.instances"),
                message: "A service must declare at least one instance".to_string(),
            });
        }

        for (i, instance) in service.instances.iter().enumerate() {
            let field = format!("services.{name}.instances[{i}].url");
            if let Err(e) = Self::validate_url(&instance.url, &field) {
                errors.push(e);
            }
            if instance.weight.is_nan() || instance.weight <= 0.0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("services.{name}.instances[{i}].weight"),
                    message: "Weight must be greater than 0".to_string(),
                });
            }
            if service.instances[..i].iter().any(|prev| prev.name == instance.name) {
                errors.push(ValidationError::DuplicateInstance {
                    service: name.to_string(),
                    instance: instance.name.clone(),
                });
            }
        }

        if let Some(path) = &service.health_path {
            if !path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("services.{name}.health_path"),
                    message: "Must start with '/'".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_health_check_config(
        config: &HealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.unhealthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.healthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Must start with '/' when health checks are enabled".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_breaker_config(
        field: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut invalid = |name: &str, message: &str| {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.{name}"),
                message: message.to_string(),
            });
        };

        if !(config.failure_threshold > 0.0) {
            invalid("failure_threshold", "Must be greater than 0");
        }
        if !(config.min_failure_threshold > 0.0)
            || config.min_failure_threshold > config.failure_threshold
        {
            invalid(
                "min_failure_threshold",
                "Must be greater than 0 and not above failure_threshold",
            );
        }
        if config.window_secs == 0 {
            invalid("window_secs", "Must be greater than 0");
        }
        if config.half_open_max_calls == 0 {
            invalid("half_open_max_calls", "Must be greater than 0");
        }
        if config.recovery_multiplier < 1.0 {
            invalid("recovery_multiplier", "Must be at least 1.0");
        }
        if config.max_recovery_timeout_secs < config.recovery_timeout_secs {
            invalid(
                "max_recovery_timeout_secs",
                "Must not be below recovery_timeout_secs",
            );
        }
        let weights = &config.weights;
        if [
            weights.timeout,
            weights.connection,
            weights.http_5xx,
            weights.http_4xx,
            weights.slow_response,
        ]
        .iter()
        .any(|w| *w < 0.0)
        {
            invalid("weights", "Failure weights cannot be negative");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_pool_config(field: &str, config: &PoolConfig) -> ValidationResult<()> {
        if config.max_connections == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.max_connections"),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.request_timeout_secs"),
                message: "Must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_cache_config(config: &CacheConfig) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.local_max_items == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.local_max_items".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }

        if config.default_ttl_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.default_ttl_secs".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }

        let adaptive = &config.adaptive_ttl;
        if adaptive.enabled {
            if adaptive.min_ttl_secs == 0 || adaptive.min_ttl_secs > adaptive.max_ttl_secs {
                errors.push(ValidationError::InvalidField {
                    field: "cache.adaptive_ttl.min_ttl_secs".to_string(),
                    message: "Must be greater than 0 and not above max_ttl_secs".to_string(),
                });
            }
            if adaptive.max_ttl_secs > 3_600 {
                errors.push(ValidationError::InvalidField {
                    field: "cache.adaptive_ttl.max_ttl_secs".to_string(),
                    message: "Cannot exceed 3600 seconds".to_string(),
                });
            }
            if adaptive.recompute_interval_secs == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "cache.adaptive_ttl.recompute_interval_secs".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_cache_rule(index: usize, rule: &CacheRule) -> ValidationResult<()> {
        let field = format!("dispatcher.cache_rules[{index}]");

        if rule.methods.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.methods"),
                message: "At least one method is required".to_string(),
            });
        }

        for method in &rule.methods {
            if http::Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                return Err(ValidationError::InvalidField {
                    field: format!("{field}.methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        if !rule.path.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.path"),
                message: "Path globs must start with '/'".to_string(),
            });
        }

        if let Err(e) = path_glob(&rule.path) {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.path"),
                message: format!("Invalid path glob: {e}"),
            });
        }

        if let Some(raw) = &rule.ttl {
            if humantime::parse_duration(raw).is_err() {
                return Err(ValidationError::InvalidField {
                    field: format!("{field}.ttl"),
                    message: format!("'{raw}' is not a duration like '90s' or '5m'"),
                });
            }
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::InstanceConfig;

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .service("gen", "gen-1", "http://localhost:3000")
            .cache_rule(CacheRule::get("/models/**"))
            .build()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(GatewayConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_instance_url_and_weight() {
        let mut config = minimal_valid_config();
        config
            .services
            .get_mut("gen")
            .unwrap()
            .instances
            .push(InstanceConfig {
                name: "gen-2".to_string(),
                url: "ftp://gen-2".to_string(),
                weight: 0.0,
            });

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 2 validation errors"));
    }

    #[test]
    fn validate_rejects_duplicate_instance_names() {
        let config = GatewayConfig::builder()
            .service("gen", "gen-1", "http://a:1")
            .service("gen", "gen-1", "http://b:1")
            .build();

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate instance 'gen-1'"));
    }

    #[test]
    fn validate_rejects_zero_health_check_interval_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check.interval_secs = 0;

        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_floor_above_threshold() {
        let mut config = minimal_valid_config();
        config.circuit_breaker.min_failure_threshold = 20.0;

        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_unparsable_rule_ttl() {
        let mut rule = CacheRule::get("/models/*");
        rule.ttl = Some("eventually".to_string());
        let config = GatewayConfig::builder()
            .service("gen", "gen-1", "http://localhost:3000")
            .cache_rule(rule)
            .build();

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("ttl"));
    }

    #[test]
    fn validate_rejects_adaptive_ttl_above_an_hour() {
        let mut config = minimal_valid_config();
        config.cache.adaptive_ttl.max_ttl_secs = 7_200;

        assert!(GatewayConfigValidator::validate(&config).is_err());
    }
}
