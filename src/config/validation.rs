use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;

use crate::{
    config::models::ServerConfig,
    core::{entities::StoreSeed, tenant::is_valid_subdomain},
};

/// Longest TTL accepted for route caches and the config snapshot cache.
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate {kind} '{value}'")]
    Duplicate { kind: &'static str, value: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        for (field, value) in [
            ("config_cache_ttl", config.config_cache_ttl.as_str()),
            ("upstream_timeout", config.upstream_timeout.as_str()),
            ("shutdown_timeout", config.shutdown_timeout.as_str()),
            ("kv_sweep_interval", config.kv_sweep_interval.as_str()),
            ("execution_log.retention", config.execution_log.retention.as_str()),
        ] {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }
        if let Ok(ttl) = humantime::parse_duration(&config.config_cache_ttl) {
            if ttl.as_secs() > MAX_CACHE_TTL_SECS {
                errors.push(ValidationError::InvalidField {
                    field: "config_cache_ttl".to_string(),
                    message: format!("Must not exceed {MAX_CACHE_TTL_SECS} seconds"),
                });
            }
        }
        if let Some(interval) = &config.store.poll_interval {
            if let Err(e) = Self::validate_duration("store.poll_interval", interval) {
                errors.push(e);
            }
        }

        if config.tenant_override_param.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "tenant_override_param".to_string(),
            });
        }
        if config.max_request_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_request_body_bytes".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }

        let script = &config.script;
        if script.default_timeout_ms == 0 || script.max_timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "script".to_string(),
                message: "Script timeouts must be greater than zero".to_string(),
            });
        }
        if script.default_timeout_ms > script.max_timeout_ms {
            errors.push(ValidationError::InvalidField {
                field: "script.default_timeout_ms".to_string(),
                message: format!(
                    "Default timeout {}ms exceeds max_timeout_ms {}ms",
                    script.default_timeout_ms, script.max_timeout_ms
                ),
            });
        }

        if let Some(seed) = &config.store.seed {
            if config.store.is_remote() {
                if let Err(e) = Self::validate_url(seed, "store.seed") {
                    errors.push(e);
                }
            } else if seed.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "store.seed".to_string(),
                });
            }
        }

        Self::finish(errors)
    }

    /// Validate the administrative document set.
    pub fn validate_seed(seed: &StoreSeed) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut subdomains = HashSet::new();
        let mut gateway_ids = HashSet::new();

        for gateway in &seed.gateways {
            if !gateway_ids.insert(gateway.id.as_str()) {
                errors.push(ValidationError::Duplicate {
                    kind: "gateway id",
                    value: gateway.id.clone(),
                });
            }
            if !is_valid_subdomain(&gateway.subdomain) {
                errors.push(ValidationError::InvalidField {
                    field: format!("gateway '{}' subdomain", gateway.id),
                    message: format!(
                        "'{}' is not a lowercase DNS label",
                        gateway.subdomain
                    ),
                });
            }
            if !subdomains.insert(gateway.subdomain.as_str()) {
                errors.push(ValidationError::Duplicate {
                    kind: "subdomain",
                    value: gateway.subdomain.clone(),
                });
            }
            if let Err(e) =
                Self::validate_url(&gateway.base_url, &format!("gateway '{}' base_url", gateway.id))
            {
                errors.push(e);
            }
        }

        let mut route_ids = HashSet::new();
        for route in &seed.routes {
            let field = format!("route '{}'", route.id);
            if !route_ids.insert(route.id.as_str()) {
                errors.push(ValidationError::Duplicate {
                    kind: "route id",
                    value: route.id.clone(),
                });
            }
            if !gateway_ids.contains(route.gateway_id.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field} gateway_id"),
                    message: format!("Unknown gateway '{}'", route.gateway_id),
                });
            }
            if !route.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field} path"),
                    message: "Route paths must start with '/'".to_string(),
                });
            }
            if route.methods.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{field} methods"),
                });
            }
            for method in &route.methods {
                if method != "*" && http::Method::from_bytes(method.as_bytes()).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field} methods"),
                        message: format!("'{method}' is not an HTTP method"),
                    });
                }
            }
            if route.destination.starts_with("http://") || route.destination.starts_with("https://")
            {
                // Templates may carry placeholders that are not valid URL syntax yet.
                if !route.destination.contains("${") && !route.destination.contains("/:") {
                    if let Err(e) = Self::validate_url(&route.destination, &format!("{field} destination")) {
                        errors.push(e);
                    }
                }
            }
            if let Some(cache) = &route.cache {
                if cache.enabled && cache.ttl_secs == 0 {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field} cache.ttl_secs"),
                        message: "Cache TTL must be greater than zero".to_string(),
                    });
                }
                if cache.ttl_secs > MAX_CACHE_TTL_SECS {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{field} cache.ttl_secs"),
                        message: format!("Cache TTL must not exceed {MAX_CACHE_TTL_SECS} seconds"),
                    });
                }
            }
        }

        Self::finish(errors)
    }

    fn finish(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        humantime::parse_duration(value)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            })
    }

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

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
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
