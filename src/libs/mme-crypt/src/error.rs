//! Crypto error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid algorithm identifier: {0}")]
    InvalidAlgorithmId(u8),
}

pub type CryptResult<T> = Result<T, CryptError>;
