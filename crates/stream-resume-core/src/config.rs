//! Event log configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of events retained per stream.
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 100;

/// Configuration error, raised at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_events_per_stream must be greater than zero")]
    InvalidCapacity,
}

/// Event log configuration.
///
/// Fixed at construction and applied uniformly to every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Capacity of each stream buffer.
    pub max_events_per_stream: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
        }
    }
}

impl EventLogConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidCapacity`] when `max_events_per_stream` is zero.
    pub fn new(max_events_per_stream: usize) -> Result<Self, ConfigError> {
        let config = Self {
            max_events_per_stream,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidCapacity`] when `max_events_per_stream` is zero.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events_per_stream == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        let config = EventLogConfig::default();
        assert_eq!(config.max_events_per_stream, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(EventLogConfig::new(0), Err(ConfigError::InvalidCapacity));
        assert!(EventLogConfig::new(1).is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: EventLogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EventLogConfig::default());

        let config: EventLogConfig =
            serde_json::from_str(r#"{"max_events_per_stream": 5}"#).unwrap();
        assert_eq!(config.max_events_per_stream, 5);

        let negative = serde_json::from_str::<EventLogConfig>(r#"{"max_events_per_stream": -1}"#);
        assert!(negative.is_err());
    }
}
