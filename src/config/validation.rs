use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    CircuitBreakerConfig, GatewayConfig, MAX_CONCURRENT_LIMIT, MAX_ROUTE_TIMEOUT_SECS,
    RESERVED_ADMIN_PREFIX, RESERVED_API_PREFIX, RouteConfig,
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

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator.
///
/// The dispatcher never re-validates routes per request; everything that can be rejected
/// up front is rejected here.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration, collecting every error.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if !config.metrics_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "metrics_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        if let Err(mut route_errors) = Self::validate_routes(&config.proxies) {
            errors.append(&mut route_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate a list of proxy definitions, including cross-route conflicts.
    pub fn validate_routes(routes: &[RouteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for route in routes {
            if let Err(mut route_errors) = Self::validate_route(route) {
                errors.append(&mut route_errors);
            }
        }

        if let Err(mut conflicts) = Self::check_route_conflicts(routes) {
            errors.append(&mut conflicts);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a single route definition.
    pub fn validate_route(route: &RouteConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let name = if route.id.is_empty() {
            route.path.as_str()
        } else {
            route.id.as_str()
        };

        if route.id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("proxy '{}' id", route.path),
            });
        }

        if let Err(e) = Self::validate_path(&route.path, name) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_url(&route.upstream, &format!("proxy '{name}' upstream")) {
            errors.push(e);
        }

        if route.timeout == 0 || route.timeout > MAX_ROUTE_TIMEOUT_SECS {
            errors.push(ValidationError::InvalidField {
                field: format!("proxy '{name}' timeout"),
                message: format!("Must be between 1 and {MAX_ROUTE_TIMEOUT_SECS} seconds"),
            });
        }

        if route.max_concurrent > MAX_CONCURRENT_LIMIT {
            errors.push(ValidationError::InvalidField {
                field: format!("proxy '{name}' max_concurrent"),
                message: format!("Must be between 0 and {MAX_CONCURRENT_LIMIT}"),
            });
        }

        if let Some(cb) = &route.circuit_breaker {
            errors.extend(Self::validate_circuit_breaker(name, cb));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8090' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_path(path: &str, name: &str) -> ValidationResult<()> {
        let field = format!("proxy '{name}' path");

        if !path.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field,
                message: "Intercept paths must start with '/'".to_string(),
            });
        }
        if path == "/" {
            return Err(ValidationError::InvalidField {
                field,
                message: "Intercept path cannot be the root path".to_string(),
            });
        }
        for reserved in [RESERVED_API_PREFIX, RESERVED_ADMIN_PREFIX] {
            let bare = reserved.trim_end_matches('/');
            if path.starts_with(reserved) || path == bare {
                return Err(ValidationError::InvalidField {
                    field,
                    message: format!("Intercept path cannot use the reserved prefix '{reserved}'"),
                });
            }
        }
        Ok(())
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

    fn validate_circuit_breaker(name: &str, config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        let checks = [
            ("failure_threshold", u64::from(config.failure_threshold)),
            ("recovery_timeout", config.recovery_timeout),
            ("half_open_requests", u64::from(config.half_open_requests)),
        ];

        checks
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| ValidationError::InvalidField {
                field: format!("proxy '{name}' circuit_breaker.{field}"),
                message: "Must be greater than 0 when the circuit breaker is enabled".to_string(),
            })
            .collect()
    }

    fn check_route_conflicts(routes: &[RouteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();
        let mut paths = HashSet::new();

        for route in routes {
            if !route.id.is_empty() && !ids.insert(route.id.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate proxy id '{}'", route.id),
                });
            }
            if !paths.insert(route.path.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate intercept path '{}'", route.path),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

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
