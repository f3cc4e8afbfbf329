//! Core error surface.
//!
//! Every error carries a stable code for callers; the propagation policy is:
//! validation / authorization / liquidity / risk / conflict errors surface to
//! the caller without mutating state, transient errors are retried on
//! background paths, fatal errors halt the affected pair.

use crate::precision::PrecisionError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient liquidity: {0}")]
    Liquidity(String),

    #[error("risk check failed: {0}")]
    Risk(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("unknown pair: {0}")]
    UnknownPair(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),
}

impl CoreError {
    /// Stable machine-readable code surfaced alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_FAILED",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Liquidity(_) => "INSUFFICIENT_LIQUIDITY",
            CoreError::Risk(_) => "RISK_REJECTED",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Transient(_) => "TRANSIENT",
            CoreError::Fatal(_) => "FATAL",
            CoreError::UnknownPair(_) => "UNKNOWN_PAIR",
            CoreError::OrderNotFound(_) => "ORDER_NOT_FOUND",
        }
    }

    /// Whether the caller may safely retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

impl From<PrecisionError> for CoreError {
    fn from(e: PrecisionError) -> Self {
        match e {
            PrecisionError::Overflow | PrecisionError::DivideByZero => {
                CoreError::Fatal(e.to_string())
            }
            other => CoreError::Validation(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Transient(format!("warm tier: {e}"))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        CoreError::Transient(format!("hot tier: {e}"))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Transient(format!("cold tier: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Validation("x".into()).code(), "VALIDATION_FAILED");
        assert_eq!(CoreError::Liquidity("x".into()).code(), "INSUFFICIENT_LIQUIDITY");
        assert_eq!(CoreError::Fatal("x".into()).code(), "FATAL");
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(CoreError::Transient("x".into()).is_retryable());
        assert!(!CoreError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn precision_overflow_maps_to_fatal() {
        let e: CoreError = PrecisionError::Overflow.into();
        assert_eq!(e.code(), "FATAL");
        let e: CoreError = PrecisionError::InvalidDecimal("z".into()).into();
        assert_eq!(e.code(), "VALIDATION_FAILED");
    }
}
