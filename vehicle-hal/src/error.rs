//! Error types for HAL operations.

/// Errors a HAL driver (real or mock) can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// The driver has not finished fetching data yet; callers may retry
    #[error("HAL not ready")]
    NotReady,

    /// The driver does not support the requested operation
    #[error("operation not supported by HAL")]
    NotSupported,

    /// Driver-internal failure, with the driver's own error code
    #[error("HAL internal error (code {0})")]
    Internal(i32),
}

impl HalError {
    /// Numeric code carried on the error reporting path.
    pub fn code(&self) -> i32 {
        match self {
            HalError::NotReady => -11,
            HalError::NotSupported => -38,
            HalError::Internal(code) => *code,
        }
    }
}

/// Convenience type alias for Results using HalError.
pub type HalResult<T> = std::result::Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_code_passthrough() {
        assert_eq!(HalError::Internal(-22).code(), -22);
    }

    #[test]
    fn test_display() {
        assert_eq!(HalError::NotReady.to_string(), "HAL not ready");
    }
}
