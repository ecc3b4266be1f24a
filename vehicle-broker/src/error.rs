//! Error types for the vehicle-broker crate.

use vehicle_hal::HalError;

/// Errors surfaced by broker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The access policy refused the operation for this caller
    #[error("permission denied for property {property:#x} (uid {uid}, write {write})")]
    PermissionDenied {
        /// The property the caller tried to touch
        property: i32,
        /// The caller's uid
        uid: u32,
        /// Whether write access was requested
        write: bool,
    },

    /// A capability check failed: unknown property, wrong value type,
    /// zones out of range, or a flag the property cannot honor
    #[error("bad value for property {property:#x}: {reason}")]
    BadValue {
        /// The offending property
        property: i32,
        /// What exactly was rejected
        reason: &'static str,
    },

    /// The HAL kept reporting not-ready past the retry budget
    #[error("HAL not ready after retries")]
    NotReady,

    /// The HAL returned an error other than not-ready
    #[error("HAL error: {0}")]
    Hal(HalError),

    /// The registered mock returned non-success
    #[error("mock rejected operation: {0}")]
    MockRejected(HalError),

    /// HAL init failed at startup; the broker is alive but cannot serve
    /// real-HAL operations until a mock is registered
    #[error("broker not initialized (HAL init failed)")]
    NotInitialized,
}

impl BrokerError {
    pub(crate) fn bad_value(property: i32, reason: &'static str) -> Self {
        BrokerError::BadValue { property, reason }
    }
}

/// Convenience type alias for Results using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;
