//! Error types for engine operations.

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the public engine API.
///
/// Three kinds are distinguished: caller-supplied data inconsistent with the
/// registered models or options (`BadInput`), a required subsystem that was
/// never initialized (`InitFailed`), and transient-or-fatal operational
/// failures such as NaN in the physics, timeouts or lock contention
/// (`Generic`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Caller-supplied data inconsistent with the model or options.
    #[error("invalid input: {0}")]
    BadInput(String),

    /// A required subsystem (robot, controller, sensor, motor, telemetry)
    /// is not initialized.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Operational failure: NaN in physics, timeout, lock contention,
    /// inconsistent constraint system.
    #[error("{0}")]
    Generic(String),
}

impl EngineError {
    /// Create a `BadInput` error.
    #[must_use]
    pub fn bad_input(reason: impl Into<String>) -> Self {
        Self::BadInput(reason.into())
    }

    /// Create an `InitFailed` error.
    #[must_use]
    pub fn init_failed(reason: impl Into<String>) -> Self {
        Self::InitFailed(reason.into())
    }

    /// Create a `Generic` error.
    #[must_use]
    pub fn generic(reason: impl Into<String>) -> Self {
        Self::Generic(reason.into())
    }

    /// Check whether this is a `BadInput` error.
    #[must_use]
    pub fn is_bad_input(&self) -> bool {
        matches!(self, Self::BadInput(_))
    }

    /// Check whether this is an `InitFailed` error.
    #[must_use]
    pub fn is_init_failed(&self) -> bool {
        matches!(self, Self::InitFailed(_))
    }

    /// Check whether this is a `Generic` error.
    #[must_use]
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic(_))
    }
}
