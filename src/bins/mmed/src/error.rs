//! MME error types

use thiserror::Error;

use mme_core::CoreError;
use mme_crypt::CryptError;
use mme_nas::NasError;

use crate::config::ConfigError;
use crate::context::UeId;

/// Errors raised while handling EMM procedures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmmError {
    #[error("NAS error: {0}")]
    Nas(#[from] NasError),
    #[error("Crypto error: {0}")]
    Crypt(#[from] CryptError),
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("No NAS security context")]
    NoSecurityContext,
    #[error("Unknown UE: {0}")]
    UnknownUe(UeId),
}

pub type EmmResult<T> = Result<T, EmmError>;
