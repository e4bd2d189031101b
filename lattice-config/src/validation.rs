//! Per-domain validation

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// A configuration domain that can check its own values
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Name used in error messages, e.g. `workflow`
    fn domain_name(&self) -> &'static str;

    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        invalid(self.domain_name(), message)
    }
}

fn invalid(domain: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        domain: domain.to_string(),
        message: message.into(),
    }
}

pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(domain, format!("{} cannot be empty", field_name)));
    }
    Ok(())
}

pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(invalid(
            domain,
            format!("{} must be at least 1, got {}", field_name, value),
        ));
    }
    Ok(())
}

/// Timeouts and delays of zero would fire immediately
pub fn validate_duration(value: Duration, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(invalid(domain, format!("{} must be greater than zero", field_name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1usize, "queue_capacity", "hot_reload").is_ok());
        assert!(validate_positive(0u32, "default_max_attempts", "workflow").is_err());
    }

    #[test]
    fn test_validate_duration_names_the_field() {
        assert!(validate_duration(Duration::from_millis(1), "stop_timeout", "registry").is_ok());
        let err = validate_duration(Duration::ZERO, "stop_timeout", "registry").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid registry configuration: stop_timeout must be greater than zero"
        );
    }

    #[test]
    fn test_blank_string_rejected() {
        assert!(validate_required_string("  ", "manifest_file_name", "discovery").is_err());
        assert!(validate_required_string("plugin.json", "manifest_file_name", "discovery").is_ok());
    }
}
