//! MME cryptographic library
//!
//! Key hierarchy derivation for EPS (TS 33.401 Annex A) and the NAS
//! integrity/ciphering algorithms the MME selects from.

pub mod error;
pub mod kdf;     // KeNB, NH and NAS key derivation
pub mod nas;     // EIA/EEA algorithm dispatch

pub use error::{CryptError, CryptResult};
pub use kdf::{kdf_kenb, kdf_nas_eps, kdf_nh, NasKeyType, KEY_LEN, SHA256_DIGEST_SIZE};
pub use nas::{nas_encrypt, nas_mac, CipheringAlgorithm, Direction, IntegrityAlgorithm, NAS_MAC_LEN};
