//! NAS security algorithms
//!
//! Integrity (EIA) and ciphering (EEA) algorithm dispatch for NAS
//! messages. EIA0/EEA0 are the null algorithms; EIA2/EEA2 are the AES
//! based ones (CMAC and CTR, TS 33.401 Annex B). EIA1/EIA3 and EEA1/EEA3
//! are recognised identifiers but are not provided by this crate.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::{CryptError, CryptResult};
use crate::kdf::KEY_LEN;

/// Truncated NAS MAC length
pub const NAS_MAC_LEN: usize = 4;

const AES_BLOCK_SIZE: usize = 16;

/// Transfer direction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// EPS integrity algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum IntegrityAlgorithm {
    Eia0 = 0,
    Eia1 = 1,
    Eia2 = 2,
    Eia3 = 3,
}

impl IntegrityAlgorithm {
    pub fn from_u8(value: u8) -> CryptResult<Self> {
        match value {
            0 => Ok(Self::Eia0),
            1 => Ok(Self::Eia1),
            2 => Ok(Self::Eia2),
            3 => Ok(Self::Eia3),
            _ => Err(CryptError::InvalidAlgorithmId(value)),
        }
    }

    /// Whether this crate can compute MACs with the algorithm
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Eia0 | Self::Eia2)
    }
}

impl fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EIA{}", *self as u8)
    }
}

/// EPS ciphering algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CipheringAlgorithm {
    Eea0 = 0,
    Eea1 = 1,
    Eea2 = 2,
    Eea3 = 3,
}

impl CipheringAlgorithm {
    pub fn from_u8(value: u8) -> CryptResult<Self> {
        match value {
            0 => Ok(Self::Eea0),
            1 => Ok(Self::Eea1),
            2 => Ok(Self::Eea2),
            3 => Ok(Self::Eea3),
            _ => Err(CryptError::InvalidAlgorithmId(value)),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Eea0 | Self::Eea2)
    }
}

impl fmt::Display for CipheringAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EEA{}", *self as u8)
    }
}

/// Compute the 32-bit NAS MAC over `msg`
pub fn nas_mac(
    algorithm: IntegrityAlgorithm,
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    msg: &[u8],
) -> CryptResult<[u8; NAS_MAC_LEN]> {
    match algorithm {
        IntegrityAlgorithm::Eia0 => Ok([0u8; NAS_MAC_LEN]),
        IntegrityAlgorithm::Eia2 => {
            // COUNT || BEARER || DIRECTION || 0^26 || MESSAGE
            let mut m = Vec::with_capacity(8 + msg.len());
            m.extend_from_slice(&count.to_be_bytes());
            m.push(((bearer & 0x1f) << 3) | ((direction as u8 & 0x01) << 2));
            m.extend_from_slice(&[0u8; 3]);
            m.extend_from_slice(msg);

            let cmac = aes_cmac(key, &m);
            let mut mac = [0u8; NAS_MAC_LEN];
            mac.copy_from_slice(&cmac[..NAS_MAC_LEN]);
            Ok(mac)
        }
        other => {
            log::warn!("Integrity algorithm {} not implemented", other);
            Err(CryptError::UnsupportedAlgorithm(other.to_string()))
        }
    }
}

/// Encrypt or decrypt `data` in place
pub fn nas_encrypt(
    algorithm: CipheringAlgorithm,
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &mut [u8],
) -> CryptResult<()> {
    match algorithm {
        CipheringAlgorithm::Eea0 => Ok(()),
        CipheringAlgorithm::Eea2 => {
            let mut ivec = [0u8; AES_BLOCK_SIZE];
            ivec[..4].copy_from_slice(&count.to_be_bytes());
            ivec[4] = ((bearer & 0x1f) << 3) | ((direction as u8 & 0x01) << 2);
            aes_ctr128(key, &mut ivec, data);
            Ok(())
        }
        other => {
            log::warn!("Ciphering algorithm {} not implemented", other);
            Err(CryptError::UnsupportedAlgorithm(other.to_string()))
        }
    }
}

fn aes_cmac(key: &[u8; KEY_LEN], msg: &[u8]) -> [u8; AES_BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(&GenericArray::from(*key));
    mac.update(msg);
    let mut out = [0u8; AES_BLOCK_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn ctr128_inc(counter: &mut [u8; AES_BLOCK_SIZE]) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

fn aes_ctr128(key: &[u8; KEY_LEN], ivec: &mut [u8; AES_BLOCK_SIZE], data: &mut [u8]) {
    let cipher = Aes128::new(&GenericArray::from(*key));
    for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
        let mut keystream = GenericArray::from(*ivec);
        cipher.encrypt_block(&mut keystream);
        ctr128_inc(ivec);
        for (b, k) in chunk.iter_mut().zip(keystream.iter()) {
            *b ^= k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6,
        0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];

    const BLOCK: [u8; 16] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96,
        0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
    ];

    #[test]
    fn test_aes_cmac_rfc4493() {
        let expected = [
            0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44,
            0xf7, 0x9b, 0xdd, 0x9d, 0xd0, 0x4a, 0x28, 0x7c,
        ];
        assert_eq!(aes_cmac(&KEY, &BLOCK), expected);
    }

    #[test]
    fn test_aes_ctr_sp800_38a() {
        let mut ivec = [
            0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
            0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
        ];
        let expected = [
            0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26,
            0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d, 0xb6, 0xce,
        ];
        let mut data = BLOCK;
        aes_ctr128(&KEY, &mut ivec, &mut data);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_ctr_counter_carry() {
        let mut c = [0xffu8; 16];
        c[0] = 0;
        ctr128_inc(&mut c);
        assert_eq!(c[0], 1);
        assert!(c[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_eia0_is_zero() {
        let mac = nas_mac(IntegrityAlgorithm::Eia0, &KEY, 1, 0, Direction::Uplink, b"abc").unwrap();
        assert_eq!(mac, [0u8; 4]);
    }

    #[test]
    fn test_eia2_binds_count_and_direction() {
        let a = nas_mac(IntegrityAlgorithm::Eia2, &KEY, 1, 0, Direction::Uplink, b"msg").unwrap();
        let b = nas_mac(IntegrityAlgorithm::Eia2, &KEY, 2, 0, Direction::Uplink, b"msg").unwrap();
        let c = nas_mac(IntegrityAlgorithm::Eia2, &KEY, 1, 0, Direction::Downlink, b"msg").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_eea2_inverts() {
        let mut data = b"attach accept payload, longer than one block".to_vec();
        let plain = data.clone();
        nas_encrypt(CipheringAlgorithm::Eea2, &KEY, 9, 0, Direction::Downlink, &mut data).unwrap();
        assert_ne!(data, plain);
        nas_encrypt(CipheringAlgorithm::Eea2, &KEY, 9, 0, Direction::Downlink, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_unsupported_algorithms() {
        assert!(nas_mac(IntegrityAlgorithm::Eia1, &KEY, 0, 0, Direction::Uplink, b"").is_err());
        let mut data = [0u8; 4];
        assert!(nas_encrypt(CipheringAlgorithm::Eea3, &KEY, 0, 0, Direction::Uplink, &mut data).is_err());
        assert_eq!(IntegrityAlgorithm::from_u8(9), Err(CryptError::InvalidAlgorithmId(9)));
    }
}
