//! Key Derivation Functions
//!
//! EPS key hierarchy as defined in 3GPP TS 33.401 Annex A, built on the
//! generic KDF of TS 33.220 clause B.2.0 (HMAC-SHA-256 over
//! `FC || P0 || L0 || P1 || L1 ...`).

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Length of KASME, KeNB and NH
pub const SHA256_DIGEST_SIZE: usize = 32;

/// Length of NAS integrity and ciphering keys
pub const KEY_LEN: usize = 16;

const FC_FOR_KENB_DERIVATION: u8 = 0x11;
const FC_FOR_NH_ENB_DERIVATION: u8 = 0x12;
const FC_FOR_EPS_ALGORITHM_KEY_DERIVATION: u8 = 0x15;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm type distinguisher for NAS key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NasKeyType {
    Encryption = 0x01,
    Integrity = 0x02,
}

/// TS 33.220 B.2.0 generic KDF
fn kdf_common(key: &[u8; SHA256_DIGEST_SIZE], fc: u8, params: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut s = Vec::with_capacity(1 + params.iter().map(|p| p.len() + 2).sum::<usize>());
    s.push(fc);
    for param in params {
        s.extend_from_slice(param);
        s.extend_from_slice(&(param.len() as u16).to_be_bytes());
    }

    // HMAC zero-pads keys shorter than the block size
    let mut block = Key::<HmacSha256>::default();
    block[..key.len()].copy_from_slice(key);
    let mut mac = <HmacSha256 as KeyInit>::new(&block);
    mac.update(&s);

    let mut output = [0u8; SHA256_DIGEST_SIZE];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// TS 33.401 Annex A.3: KeNB derivation
///
/// `ul_count` is the uplink NAS COUNT the derivation is bound to.
pub fn kdf_kenb(kasme: &[u8; SHA256_DIGEST_SIZE], ul_count: u32) -> [u8; SHA256_DIGEST_SIZE] {
    kdf_common(kasme, FC_FOR_KENB_DERIVATION, &[&ul_count.to_be_bytes()])
}

/// TS 33.401 Annex A.4: NH derivation
///
/// `sync_input` is KeNB for the first hop after a new KASME, and the
/// previous NH for every later hop.
pub fn kdf_nh(
    kasme: &[u8; SHA256_DIGEST_SIZE],
    sync_input: &[u8; SHA256_DIGEST_SIZE],
) -> [u8; SHA256_DIGEST_SIZE] {
    kdf_common(kasme, FC_FOR_NH_ENB_DERIVATION, &[sync_input])
}

/// TS 33.401 Annex A.7: NAS key derivation
///
/// Returns the 16 least significant bytes of the 256-bit output.
pub fn kdf_nas_eps(
    key_type: NasKeyType,
    algorithm_id: u8,
    kasme: &[u8; SHA256_DIGEST_SIZE],
) -> [u8; KEY_LEN] {
    let output = kdf_common(
        kasme,
        FC_FOR_EPS_ALGORITHM_KEY_DERIVATION,
        &[&[key_type as u8], &[algorithm_id]],
    );

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&output[KEY_LEN..]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const KASME: [u8; 32] = [0x5a; 32];

    #[test]
    fn test_kenb_deterministic() {
        assert_eq!(kdf_kenb(&KASME, 0), kdf_kenb(&KASME, 0));
        assert_ne!(kdf_kenb(&KASME, 0), kdf_kenb(&KASME, 1));
    }

    #[test]
    fn test_kenb_depends_on_kasme() {
        let other = [0xa5u8; 32];
        assert_ne!(kdf_kenb(&KASME, 7), kdf_kenb(&other, 7));
    }

    #[test]
    fn test_nh_chain_advances() {
        let kenb = kdf_kenb(&KASME, 0);
        let nh1 = kdf_nh(&KASME, &kenb);
        let nh2 = kdf_nh(&KASME, &nh1);
        assert_ne!(nh1, kenb);
        assert_ne!(nh2, nh1);
    }

    #[test]
    fn test_nas_keys_distinct() {
        let int = kdf_nas_eps(NasKeyType::Integrity, 2, &KASME);
        let enc = kdf_nas_eps(NasKeyType::Encryption, 2, &KASME);
        assert_ne!(int, enc);
        assert_ne!(int, kdf_nas_eps(NasKeyType::Integrity, 1, &KASME));
    }

    #[test]
    fn test_kdf_common_matches_hmac() {
        // with a 32-byte key the padded-block construction equals plain HMAC
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&KASME).unwrap();
        mac.update(&[FC_FOR_KENB_DERIVATION, 0, 0, 0, 5, 0, 4]);
        let expected = mac.finalize().into_bytes();
        assert_eq!(kdf_kenb(&KASME, 5).as_slice(), expected.as_slice());
    }
}
