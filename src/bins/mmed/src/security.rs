//! NAS security context
//!
//! Per-subscriber key material: the KASME established by authentication,
//! NAS keys, the KeNB handed to the access stratum and the NH chain used
//! for handover. Also tracks the uplink/downlink NAS COUNTs and rejects
//! replayed uplink sequence numbers.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use mme_crypt::{
    kdf_kenb, kdf_nas_eps, kdf_nh, CipheringAlgorithm, IntegrityAlgorithm, NasKeyType, KEY_LEN,
    SHA256_DIGEST_SIZE,
};
use mme_nas::KeySetIdentifier;

/// NAS COUNT is 24 bits: 16-bit overflow counter and 8-bit sequence number
pub const NAS_COUNT_MASK: u32 = 0x00ff_ffff;

/// One authentication vector from the identity service
#[derive(Clone, PartialEq, Eq)]
pub struct AuthVector {
    pub rand: [u8; 16],
    pub autn: [u8; 16],
    pub xres: Bytes,
    pub kasme: [u8; SHA256_DIGEST_SIZE],
}

impl fmt::Debug for AuthVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthVector")
            .field("rand", &self.rand)
            .field("autn", &self.autn)
            .finish_non_exhaustive()
    }
}

/// Estimate the full COUNT from the low `bits` bits carried in a PDU.
///
/// `next` is the lowest COUNT still acceptable. A carried value below
/// `next` is taken as a wrap of the low bits only when `next` sits in the
/// top quarter of the window and the carried value in the bottom quarter;
/// anything else behind `next` is a replay.
pub fn estimate_count(next: u32, seq: u32, bits: u32) -> Option<u32> {
    let window = 1u32 << bits;
    let low_mask = window - 1;
    let seq = seq & low_mask;

    let candidate = (next & !low_mask) | seq;
    if candidate >= next {
        return Some(candidate & NAS_COUNT_MASK);
    }
    let next_low = next & low_mask;
    if next_low >= window - window / 4 && seq < window / 4 {
        let wrapped = candidate + window;
        if wrapped <= NAS_COUNT_MASK {
            return Some(wrapped);
        }
    }
    None
}

/// NAS security context of one subscriber
#[derive(Clone)]
pub struct SecurityContext {
    /// KSI of the established KASME
    ksi: KeySetIdentifier,
    /// KSI and vector of an authentication challenge awaiting a response
    challenge: Option<(KeySetIdentifier, AuthVector)>,
    vectors: VecDeque<AuthVector>,

    kasme: Option<[u8; SHA256_DIGEST_SIZE]>,
    knas_int: [u8; KEY_LEN],
    knas_enc: [u8; KEY_LEN],
    integrity: IntegrityAlgorithm,
    ciphering: CipheringAlgorithm,

    kenb: Option<[u8; SHA256_DIGEST_SIZE]>,
    nh: Option<[u8; SHA256_DIGEST_SIZE]>,
    ncc: u32,

    /// Next acceptable uplink COUNT
    ul_count: u32,
    /// COUNT of the next downlink PDU
    dl_count: u32,
    /// Uplink COUNT at which security was activated
    activation_ul_count: Option<u32>,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("ksi", &self.ksi.value)
            .field("integrity", &self.integrity)
            .field("ciphering", &self.ciphering)
            .field("ncc", &self.ncc)
            .field("ul_count", &self.ul_count)
            .field("dl_count", &self.dl_count)
            .field("activated", &self.is_activated())
            .finish_non_exhaustive()
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityContext {
    pub fn new() -> Self {
        Self {
            ksi: KeySetIdentifier::none(),
            challenge: None,
            vectors: VecDeque::new(),
            kasme: None,
            knas_int: [0; KEY_LEN],
            knas_enc: [0; KEY_LEN],
            integrity: IntegrityAlgorithm::Eia0,
            ciphering: CipheringAlgorithm::Eea0,
            kenb: None,
            nh: None,
            ncc: 0,
            ul_count: 0,
            dl_count: 0,
            activation_ul_count: None,
        }
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    pub fn push_vectors(&mut self, vectors: impl IntoIterator<Item = AuthVector>) {
        self.vectors.extend(vectors);
    }

    pub fn has_vectors(&self) -> bool {
        !self.vectors.is_empty()
    }

    /// Unused vectors are stale after a resynchronisation
    pub fn clear_vectors(&mut self) {
        self.vectors.clear();
    }

    /// Take the next vector for a challenge. The new KSI is one past the
    /// current one, modulo 7.
    pub fn start_challenge(&mut self) -> Option<(KeySetIdentifier, &AuthVector)> {
        let vector = self.vectors.pop_front()?;
        let ksi = if self.ksi.is_valid() {
            KeySetIdentifier::native((self.ksi.value + 1) % KeySetIdentifier::NO_KEY_AVAILABLE)
        } else {
            KeySetIdentifier::native(0)
        };
        self.challenge = Some((ksi, vector));
        self.challenge.as_ref().map(|(ksi, vector)| (*ksi, vector))
    }

    pub fn challenge(&self) -> Option<(KeySetIdentifier, &AuthVector)> {
        self.challenge.as_ref().map(|(ksi, vector)| (*ksi, vector))
    }

    /// Byte-for-byte RES check against the outstanding challenge
    pub fn verify_res(&self, res: &[u8]) -> bool {
        match &self.challenge {
            Some((_, vector)) => vector.xres.as_ref() == res,
            None => false,
        }
    }

    /// Install the challenged KASME as the new root key.
    ///
    /// NAS keys are derived for the selected algorithms, both COUNTs start
    /// from zero and the KeNB/NH chain is reset.
    pub fn establish(&mut self, integrity: IntegrityAlgorithm, ciphering: CipheringAlgorithm) -> bool {
        let Some((ksi, vector)) = self.challenge.take() else {
            return false;
        };
        let kasme = vector.kasme;

        self.ksi = ksi;
        self.kasme = Some(kasme);
        self.integrity = integrity;
        self.ciphering = ciphering;
        self.knas_int = kdf_nas_eps(NasKeyType::Integrity, integrity as u8, &kasme);
        self.knas_enc = kdf_nas_eps(NasKeyType::Encryption, ciphering as u8, &kasme);
        self.kenb = None;
        self.nh = None;
        self.ncc = 0;
        self.ul_count = 0;
        self.dl_count = 0;
        self.activation_ul_count = None;
        true
    }

    /// Mark security active as of uplink COUNT `ul_count` and derive the
    /// initial KeNB from it
    pub fn activate(&mut self, ul_count: u32) -> Option<[u8; SHA256_DIGEST_SIZE]> {
        self.kasme?;
        self.activation_ul_count = Some(ul_count);
        self.derive_kenb(ul_count)
    }

    pub fn is_activated(&self) -> bool {
        self.activation_ul_count.is_some()
    }

    pub fn has_keys(&self) -> bool {
        self.kasme.is_some()
    }

    /// Valid for use: keys established and security activated
    pub fn is_valid(&self) -> bool {
        self.has_keys() && self.is_activated()
    }

    pub fn ksi(&self) -> KeySetIdentifier {
        self.ksi
    }

    /// Whether a KSI sent by the UE names this context
    pub fn matches_ksi(&self, ksi: KeySetIdentifier) -> bool {
        self.ksi.is_valid() && ksi.is_valid() && !ksi.tsc && ksi.value == self.ksi.value
    }

    pub fn integrity(&self) -> IntegrityAlgorithm {
        self.integrity
    }

    pub fn ciphering(&self) -> CipheringAlgorithm {
        self.ciphering
    }

    pub fn knas_int(&self) -> &[u8; KEY_LEN] {
        &self.knas_int
    }

    pub fn knas_enc(&self) -> &[u8; KEY_LEN] {
        &self.knas_enc
    }

    pub fn activation_ul_count(&self) -> Option<u32> {
        self.activation_ul_count
    }

    // ------------------------------------------------------------------------
    // Access stratum keys
    // ------------------------------------------------------------------------

    /// KeNB for an uplink COUNT. Deriving again from the same COUNT yields
    /// the same key.
    pub fn derive_kenb(&mut self, ul_count: u32) -> Option<[u8; SHA256_DIGEST_SIZE]> {
        let kasme = self.kasme?;
        let kenb = kdf_kenb(&kasme, ul_count);
        self.kenb = Some(kenb);
        Some(kenb)
    }

    pub fn kenb(&self) -> Option<[u8; SHA256_DIGEST_SIZE]> {
        self.kenb
    }

    /// Next hop of the NH chain and its chaining counter (3 bits).
    ///
    /// The first hop is derived from the current KeNB and carries NCC 1;
    /// each later hop is derived from the previous NH.
    pub fn next_nh(&mut self) -> Option<([u8; SHA256_DIGEST_SIZE], u8)> {
        let kasme = self.kasme?;
        let sync_input = match self.nh {
            Some(nh) => nh,
            None => self.kenb?,
        };
        let nh = kdf_nh(&kasme, &sync_input);
        self.nh = Some(nh);
        self.ncc += 1;
        Some((nh, self.ncc_bits()))
    }

    /// Chaining counter as sent over the air
    pub fn ncc_bits(&self) -> u8 {
        (self.ncc & 0x07) as u8
    }

    /// Hops taken since the root key was established
    pub fn ncc(&self) -> u32 {
        self.ncc
    }

    // ------------------------------------------------------------------------
    // NAS COUNT
    // ------------------------------------------------------------------------

    /// COUNT for an 8-bit uplink sequence number, or `None` on replay
    pub fn estimate_ul(&self, seq: u8) -> Option<u32> {
        estimate_count(self.ul_count, seq as u32, 8)
    }

    /// COUNT for a 5-bit service request sequence number
    pub fn estimate_ul_short(&self, seq: u8) -> Option<u32> {
        estimate_count(self.ul_count, seq as u32, 5)
    }

    /// Best guess for deciphering when the sequence number failed the
    /// replay check
    pub fn guess_ul(&self, seq: u8) -> u32 {
        (self.ul_count & !0xff) | seq as u32
    }

    /// Record `count` as accepted
    pub fn commit_ul(&mut self, count: u32) {
        self.ul_count = (count + 1) & NAS_COUNT_MASK;
    }

    pub fn ul_count(&self) -> u32 {
        self.ul_count
    }

    /// COUNT for the next downlink PDU
    pub fn next_dl(&mut self) -> u32 {
        let count = self.dl_count;
        self.dl_count = (self.dl_count + 1) & NAS_COUNT_MASK;
        count
    }

    pub fn dl_count(&self) -> u32 {
        self.dl_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn vector(seed: u8) -> AuthVector {
        AuthVector {
            rand: [seed; 16],
            autn: [seed.wrapping_add(1); 16],
            xres: Bytes::from(vec![seed; 8]),
            kasme: [seed.wrapping_add(2); 32],
        }
    }

    fn established() -> SecurityContext {
        let mut sc = SecurityContext::new();
        sc.push_vectors([vector(1)]);
        sc.start_challenge().unwrap();
        assert!(sc.establish(IntegrityAlgorithm::Eia2, CipheringAlgorithm::Eea2));
        sc
    }

    #[test]
    fn test_ksi_rotation() {
        let mut sc = SecurityContext::new();
        sc.push_vectors((0..9).map(vector));

        let mut seen = Vec::new();
        for _ in 0..8 {
            let (ksi, _) = sc.start_challenge().unwrap();
            seen.push(ksi.value);
            assert!(sc.establish(IntegrityAlgorithm::Eia2, CipheringAlgorithm::Eea0));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 0]);
    }

    #[test]
    fn test_verify_res() {
        let mut sc = SecurityContext::new();
        assert!(!sc.verify_res(&[1; 8]));
        sc.push_vectors([vector(1)]);
        sc.start_challenge().unwrap();
        assert!(sc.verify_res(&[1; 8]));
        assert!(!sc.verify_res(&[1; 7]));
        assert!(!sc.verify_res(&[2; 8]));
    }

    #[test]
    fn test_establish_resets_chain() {
        let mut sc = established();
        sc.activate(0).unwrap();
        sc.next_nh().unwrap();
        sc.next_nh().unwrap();
        assert_eq!(sc.ncc(), 2);
        sc.next_dl();

        sc.push_vectors([vector(7)]);
        sc.start_challenge().unwrap();
        sc.establish(IntegrityAlgorithm::Eia2, CipheringAlgorithm::Eea2);
        assert_eq!(sc.ncc(), 0);
        assert_eq!(sc.kenb(), None);
        assert_eq!(sc.dl_count(), 0);
        assert_eq!(sc.ul_count(), 0);
        assert!(!sc.is_activated());
    }

    #[test]
    fn test_kenb_idempotent() {
        let mut sc = established();
        let a = sc.activate(3).unwrap();
        let b = sc.derive_kenb(3).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, sc.derive_kenb(4).unwrap());
    }

    #[test]
    fn test_nh_chain() {
        let mut sc = established();
        assert!(sc.next_nh().is_none());
        let kenb = sc.activate(0).unwrap();

        let (nh1, ncc1) = sc.next_nh().unwrap();
        let (nh2, ncc2) = sc.next_nh().unwrap();
        assert_eq!(ncc1, 1);
        assert_eq!(ncc2, 2);
        assert_ne!(nh1, nh2);
        assert_ne!(nh1, kenb);

        for _ in 0..6 {
            sc.next_nh().unwrap();
        }
        assert_eq!(sc.ncc(), 8);
        assert_eq!(sc.ncc_bits(), 0);
    }

    #[test]
    fn test_estimate_count() {
        assert_eq!(estimate_count(0, 0, 8), Some(0));
        assert_eq!(estimate_count(5, 7, 8), Some(7));
        assert_eq!(estimate_count(5, 4, 8), None);
        assert_eq!(estimate_count(0x1fe, 0x02, 8), Some(0x202));
        assert_eq!(estimate_count(0x1f0, 0x10, 8), Some(0x210));
        assert_eq!(estimate_count(0x180, 0x10, 8), None);
        assert_eq!(estimate_count(0x3e, 0x01, 5), Some(0x41));
    }

    #[test]
    fn test_ul_replay() {
        let mut sc = established();
        let c = sc.estimate_ul(0).unwrap();
        sc.commit_ul(c);
        let c = sc.estimate_ul(1).unwrap();
        sc.commit_ul(c);
        assert_eq!(sc.estimate_ul(1), None);
        assert_eq!(sc.estimate_ul(0), None);
        assert_eq!(sc.estimate_ul(2), Some(2));
    }
}
