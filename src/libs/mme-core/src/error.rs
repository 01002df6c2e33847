//! Core error types

use thiserror::Error;

/// Errors raised by the timer service and the execution engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid timer interval: must be non-zero")]
    InvalidInterval,
    #[error("Invalid max retries: {0} (must be at least 1)")]
    InvalidMaxRetries(u32),
    #[error("Process not found: {0}")]
    ProcessNotFound(u64),
    #[error("Handler fault: {0}")]
    HandlerFault(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
