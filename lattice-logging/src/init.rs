use anyhow::Result;
use lattice_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Filter for the given level, falling back to `RUST_LOG` and then `info`
pub fn build_env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from configuration
///
/// Returns `Ok` when a global subscriber was already installed; the existing
/// one is kept.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(&config.level.to_string());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_env_filter(log_level);

    // Use try_init to avoid panic if global subscriber already set
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_config::LogLevel;

    #[test]
    fn test_repeated_initialisation_is_harmless() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Json,
            include_location: true,
        };

        assert!(init_logging_from_config(&config).is_ok());
        assert!(init_logging_from_config(&LoggingConfig::default()).is_ok());
        assert!(init_simple_tracing("warn").is_ok());
    }

    #[test]
    fn test_env_filter_accepts_directives() {
        let filter = build_env_filter("info,plugin_registry=debug");
        assert!(filter.to_string().contains("plugin_registry=debug"));
    }
}
