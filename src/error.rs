//! Custom error types for the field mapper.
//!
//! This module defines the primary error type, `DaqError`, used by every layer of
//! the crate. Using the `thiserror` crate it gives one consistent vocabulary for
//! the failures a scan can run into, from a bad configuration file to a stage
//! that outran the trigger pipeline.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: invalid axis names, invalid scan ranges, missing devices.
//!   Fails fast and is never retried.
//! - **`ConfigLoad`**: wraps `figment::Error` when the settings file or
//!   environment cannot be parsed.
//! - **`DeviceTimeout`**: a bounded wait expired (motion settle, encoder
//!   interrupt). Retryable by the caller.
//! - **`MissedTrigger`**: the axis passed a sampling point before the comparator
//!   was armed. Retryable, but a hint that the scan speed is too high.
//! - **`DeviceProtocol`**: malformed or unexpected response, bad echo, nonzero
//!   vendor status code. Retryable a bounded number of times.
//! - **`OutOfRange`**: a requested speed or position beyond device limits.
//!   Reported as a configuration problem, never retried.
//! - **`Io`**: wraps `std::io::Error` from transports and exporters.
//!
//! `DaqError::is_retryable` is the single place the retry classification lives;
//! the grid sweep controller matches on it to decide between retry and abort.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the field mapper can report.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Semantically invalid configuration (unknown axis, bad range, ...).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A bounded wait on a device expired.
    #[error("Timed out after {timeout_ms} ms on {device}: {operation}")]
    DeviceTimeout {
        /// Device that failed to respond in time
        device: String,
        /// What was being waited for
        operation: String,
        /// The bound that expired
        timeout_ms: u64,
    },

    /// The encoder was already past the next sampling point.
    #[error("Missed trigger at {target} steps, encoder already at {current}")]
    MissedTrigger {
        /// Comparator target in encoder steps
        target: i64,
        /// Encoder reading when the miss was detected
        current: f64,
    },

    /// Malformed reply, bad echo or nonzero vendor status code.
    #[error("Device protocol error on {device}: {message}")]
    DeviceProtocol {
        /// Device that produced the bad reply
        device: String,
        /// What was wrong with it
        message: String,
    },

    /// Requested value beyond a device limit.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Transport or exporter I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}

impl DaqError {
    /// Shorthand for a protocol error attributed to a named device.
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::DeviceProtocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a timeout attributed to a named device.
    pub fn timeout(device: impl Into<String>, operation: impl Into<String>, timeout_ms: u64) -> Self {
        DaqError::DeviceTimeout {
            device: device.into(),
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the grid sweep controller may re-run a line after this error.
    ///
    /// Transient hardware conditions are retryable; anything that would fail the
    /// same way on every attempt is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqError::DeviceTimeout { .. }
                | DaqError::MissedTrigger { .. }
                | DaqError::DeviceProtocol { .. }
                | DaqError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::protocol("axis 2", "bad echo");
        assert_eq!(err.to_string(), "Device protocol error on axis 2: bad echo");

        let err = DaqError::MissedTrigger {
            target: 4000,
            current: 4100.0,
        };
        assert_eq!(
            err.to_string(),
            "Missed trigger at 4000 steps, encoder already at 4100"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(DaqError::timeout("encoder z", "wait", 10).is_retryable());
        assert!(DaqError::MissedTrigger {
            target: 0,
            current: 1.0
        }
        .is_retryable());
        assert!(DaqError::protocol("probe", "garbled").is_retryable());
        assert!(!DaqError::Configuration("no axis 'q'".into()).is_retryable());
        assert!(!DaqError::OutOfRange("speed 40 > 30".into()).is_retryable());
    }
}
