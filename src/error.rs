//! Error types and handling for Powershare
//!
//! This module defines the error types used throughout the engine. Most of
//! them never reach a caller as a failure: telemetry errors are logged and the
//! sample discarded, unknown chargers are warnings, and capacity violations
//! are prevented by the allocation algorithm itself.

use thiserror::Error;

/// Result type alias for Powershare operations
pub type Result<T> = std::result::Result<T, PowershareError>;

/// Main error type for Powershare
#[derive(Debug, Error)]
pub enum PowershareError {
    /// Malformed or out-of-range telemetry; the sample is discarded
    #[error("Invalid telemetry: {field} - {message}")]
    InvalidTelemetry { field: String, message: String },

    /// Event referenced a charger the registry does not know
    #[error("Unknown charger: {charger_id}")]
    UnknownCharger { charger_id: String },

    /// Committed allocation would exceed the available budget
    #[error("Capacity exceeded: {allocated_kw:.3} kW allocated against {budget_kw:.3} kW budget")]
    CapacityExceeded { allocated_kw: f64, budget_kw: f64 },

    /// Session stopped sending heartbeats
    #[error("Stale session on charger {charger_id}")]
    StaleSession { charger_id: String },

    /// Lifecycle record could not be written
    #[error("Persistence failure: {message}")]
    PersistenceFailure { message: String },

    /// Battery tracker cannot provide a trustworthy boost figure
    #[error("BESS unavailable: {message}")]
    BessUnavailable { message: String },

    /// Session state change outside the transition table
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Event queue is full
    #[error("Event queue full: {message}")]
    QueueFull { message: String },

    /// Station is shutting down and no longer accepts events
    #[error("Station shutting down")]
    Shutdown,

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl PowershareError {
    /// Create a new invalid telemetry error
    pub fn invalid_telemetry<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidTelemetry {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new unknown charger error
    pub fn unknown_charger<S: Into<String>>(charger_id: S) -> Self {
        Self::UnknownCharger {
            charger_id: charger_id.into(),
        }
    }

    /// Create a new stale session error
    pub fn stale_session<S: Into<String>>(charger_id: S) -> Self {
        Self::StaleSession {
            charger_id: charger_id.into(),
        }
    }

    /// Create a new persistence failure
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
        }
    }

    /// Create a new BESS unavailable error
    pub fn bess_unavailable<S: Into<String>>(message: S) -> Self {
        Self::BessUnavailable {
            message: message.into(),
        }
    }

    /// Create a new queue full error
    pub fn queue_full<S: Into<String>>(message: S) -> Self {
        Self::QueueFull {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether the error only warrants a warning (sample or event dropped)
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidTelemetry { .. }
                | Self::UnknownCharger { .. }
                | Self::StaleSession { .. }
                | Self::InvalidTransition { .. }
                | Self::QueueFull { .. }
                | Self::BessUnavailable { .. }
        )
    }
}

impl From<std::io::Error> for PowershareError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PowershareError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PowershareError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for PowershareError {
    fn from(err: chrono::ParseError) -> Self {
        Self::invalid_telemetry("timestamp", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PowershareError::config("test config error");
        assert!(matches!(err, PowershareError::Config { .. }));

        let err = PowershareError::unknown_charger("CP9");
        assert!(matches!(err, PowershareError::UnknownCharger { .. }));

        let err = PowershareError::invalid_telemetry("soc_percent", "out of range");
        assert!(matches!(err, PowershareError::InvalidTelemetry { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PowershareError::invalid_telemetry("soc_percent", "120 outside 0..=100");
        assert_eq!(
            format!("{err}"),
            "Invalid telemetry: soc_percent - 120 outside 0..=100"
        );

        let err = PowershareError::CapacityExceeded {
            allocated_kw: 101.0,
            budget_kw: 100.0,
        };
        assert_eq!(
            format!("{err}"),
            "Capacity exceeded: 101.000 kW allocated against 100.000 kW budget"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(PowershareError::unknown_charger("x").is_recoverable());
        assert!(PowershareError::queue_full("x").is_recoverable());
        assert!(!PowershareError::Shutdown.is_recoverable());
        assert!(!PowershareError::persistence("disk").is_recoverable());
    }
}
