//! Configuration validation.

use super::error::{ConfigError, ConfigResult};
use super::schema::{CourierConfig, LogOutput, LoggingConfig, PollingConfig};

/// `getUpdates` accepts 1-100 updates per call.
const POLL_LIMIT: std::ops::RangeInclusive<u32> = 1..=100;

/// Validates the entire configuration.
pub fn validate_config(config: &CourierConfig) -> ConfigResult<()> {
    validate_dispatch(config)?;
    validate_polling(&config.polling)?;
    validate_logging(&config.logging)?;
    Ok(())
}

fn validate_dispatch(config: &CourierConfig) -> ConfigResult<()> {
    if config.dispatcher.workers == 0 {
        return Err(ConfigError::out_of_range("dispatcher.workers", 0));
    }
    if config.intake.capacity == 0 {
        return Err(ConfigError::out_of_range("intake.capacity", 0));
    }
    if config.conversation.timeout_secs == Some(0) {
        return Err(ConfigError::validation(
            "conversation.timeout_secs must be greater than 0; omit it to disable timeouts",
        ));
    }
    Ok(())
}

fn validate_polling(polling: &PollingConfig) -> ConfigResult<()> {
    if !POLL_LIMIT.contains(&polling.limit) {
        return Err(ConfigError::out_of_range(
            "polling.limit",
            u64::from(polling.limit),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&CourierConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        let mut config = CourierConfig::default();
        config.dispatcher.workers = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::OutOfRange { field: "dispatcher.workers", .. })
        ));

        let mut config = CourierConfig::default();
        config.intake.capacity = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::OutOfRange { field: "intake.capacity", .. })
        ));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = CourierConfig::default();
        config.conversation.timeout_secs = Some(0);
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));

        config.conversation.timeout_secs = None;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_poll_limit_range() {
        let mut config = CourierConfig::default();
        for limit in [0, 101] {
            config.polling.limit = limit;
            assert!(validate_config(&config).is_err());
        }
        config.polling.limit = 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = CourierConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some("courier.log".into());
        assert!(validate_config(&config).is_ok());
    }
}
