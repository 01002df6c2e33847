//! NAS error types

use thiserror::Error;

/// NAS error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NasError {
    /// Buffer too short for decoding
    #[error("Buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Invalid message type
    #[error("Invalid message type: 0x{0:02x}")]
    InvalidMessageType(u8),

    /// Invalid protocol discriminator
    #[error("Invalid protocol discriminator: {0}")]
    InvalidProtocolDiscriminator(u8),

    /// Invalid security header type
    #[error("Invalid security header type: {0}")]
    InvalidSecurityHeaderType(u8),

    /// Invalid IE length
    #[error("Invalid IE length: expected {expected}, got {actual}")]
    InvalidIeLength { expected: usize, actual: usize },

    /// Invalid mobile identity type
    #[error("Invalid mobile identity type: {0}")]
    InvalidMobileIdentityType(u8),

    /// Invalid digit string
    #[error("Invalid digits: {0}")]
    InvalidDigits(String),

    /// Decoding error
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Result type for NAS operations
pub type NasResult<T> = Result<T, NasError>;
