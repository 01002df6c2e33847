//! EPS NAS information elements
//!
//! Based on 3GPP TS 24.301 clause 9.9

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NasError, NasResult};

/// Fail unless `buf` holds at least `n` more bytes
pub(crate) fn need(buf: &Bytes, n: usize) -> NasResult<()> {
    if buf.remaining() < n {
        return Err(NasError::BufferTooShort {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

/// Read an LV element with a one-byte length
pub(crate) fn get_lv(buf: &mut Bytes) -> NasResult<Bytes> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

/// Read an LV-E element with a two-byte length
pub(crate) fn get_lv_e(buf: &mut Bytes) -> NasResult<Bytes> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

pub(crate) fn put_lv(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

pub(crate) fn put_lv_e(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

// ============================================================================
// EMM cause
// ============================================================================

/// EMM cause values (TS 24.301 clause 9.9.3.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmmCause {
    ImsiUnknownInHss = 2,
    IllegalUe = 3,
    IllegalMe = 6,
    EpsServicesNotAllowed = 7,
    UeIdentityCannotBeDerived = 9,
    ImplicitlyDetached = 10,
    PlmnNotAllowed = 11,
    TrackingAreaNotAllowed = 12,
    NetworkFailure = 17,
    EsmFailure = 19,
    MacFailure = 20,
    SynchFailure = 21,
    Congestion = 22,
    UeSecurityCapabilitiesMismatch = 23,
    SecurityModeRejected = 24,
    NonEpsAuthenticationUnacceptable = 26,
    SemanticallyIncorrectMessage = 95,
    InvalidMandatoryInformation = 96,
    MessageTypeNonExistent = 97,
    MessageTypeNotCompatible = 98,
    ProtocolErrorUnspecified = 111,
}

impl EmmCause {
    /// Lenient decode; unknown values map to "protocol error, unspecified"
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::ImsiUnknownInHss,
            3 => Self::IllegalUe,
            6 => Self::IllegalMe,
            7 => Self::EpsServicesNotAllowed,
            9 => Self::UeIdentityCannotBeDerived,
            10 => Self::ImplicitlyDetached,
            11 => Self::PlmnNotAllowed,
            12 => Self::TrackingAreaNotAllowed,
            17 => Self::NetworkFailure,
            19 => Self::EsmFailure,
            20 => Self::MacFailure,
            21 => Self::SynchFailure,
            22 => Self::Congestion,
            23 => Self::UeSecurityCapabilitiesMismatch,
            24 => Self::SecurityModeRejected,
            26 => Self::NonEpsAuthenticationUnacceptable,
            95 => Self::SemanticallyIncorrectMessage,
            96 => Self::InvalidMandatoryInformation,
            97 => Self::MessageTypeNonExistent,
            98 => Self::MessageTypeNotCompatible,
            _ => Self::ProtocolErrorUnspecified,
        }
    }
}

// ============================================================================
// Key set identifier
// ============================================================================

/// NAS key set identifier (TS 24.301 clause 9.9.3.21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySetIdentifier {
    /// Type of security context flag: mapped context when set
    pub tsc: bool,
    /// 0..=6, or 7 for "no key is available"
    pub value: u8,
}

impl KeySetIdentifier {
    pub const NO_KEY_AVAILABLE: u8 = 7;

    pub fn native(value: u8) -> Self {
        Self { tsc: false, value: value & 0x07 }
    }

    pub fn none() -> Self {
        Self::native(Self::NO_KEY_AVAILABLE)
    }

    pub fn is_valid(&self) -> bool {
        self.value != Self::NO_KEY_AVAILABLE
    }

    /// Encode to half-byte
    pub fn encode(&self) -> u8 {
        ((self.tsc as u8) << 3) | (self.value & 0x07)
    }

    /// Decode from half-byte
    pub fn decode(nibble: u8) -> Self {
        Self {
            tsc: nibble & 0x08 != 0,
            value: nibble & 0x07,
        }
    }
}

impl Default for KeySetIdentifier {
    fn default() -> Self {
        Self::none()
    }
}

// ============================================================================
// PLMN / GUTI
// ============================================================================

/// PLMN identity stored as decimal digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlmnId {
    pub mcc: [u8; 3],
    pub mnc: [u8; 3],
    /// 2 or 3
    pub mnc_len: u8,
}

impl PlmnId {
    pub fn new(mcc: &str, mnc: &str) -> NasResult<Self> {
        let mcc_digits = parse_digits(mcc)?;
        let mnc_digits = parse_digits(mnc)?;
        if mcc_digits.len() != 3 || !(2..=3).contains(&mnc_digits.len()) {
            return Err(NasError::InvalidDigits(format!("{}/{}", mcc, mnc)));
        }
        let mut plmn = PlmnId {
            mcc: [mcc_digits[0], mcc_digits[1], mcc_digits[2]],
            mnc: [0; 3],
            mnc_len: mnc_digits.len() as u8,
        };
        plmn.mnc[..mnc_digits.len()].copy_from_slice(&mnc_digits);
        Ok(plmn)
    }

    /// Encode as 3-byte BCD (TS 24.008 clause 10.5.1.3)
    pub fn encode(&self, buf: &mut BytesMut) {
        let mnc3 = if self.mnc_len == 2 { 0x0f } else { self.mnc[2] };
        buf.put_u8((self.mcc[1] << 4) | self.mcc[0]);
        buf.put_u8((mnc3 << 4) | self.mcc[2]);
        buf.put_u8((self.mnc[1] << 4) | self.mnc[0]);
    }

    pub fn decode(buf: &mut Bytes) -> NasResult<Self> {
        need(buf, 3)?;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();
        let mnc3 = b1 >> 4;
        Ok(PlmnId {
            mcc: [b0 & 0x0f, b0 >> 4, b1 & 0x0f],
            mnc: [b2 & 0x0f, b2 >> 4, if mnc3 == 0x0f { 0 } else { mnc3 }],
            mnc_len: if mnc3 == 0x0f { 2 } else { 3 },
        })
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.mcc {
            write!(f, "{}", d)?;
        }
        for d in &self.mnc[..self.mnc_len as usize] {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// Globally unique temporary identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guti {
    pub plmn_id: PlmnId,
    pub mme_gid: u16,
    pub mme_code: u8,
    pub m_tmsi: u32,
}

impl fmt::Display for Guti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04x}-{:02x}-{:08x}",
            self.plmn_id, self.mme_gid, self.mme_code, self.m_tmsi
        )
    }
}

// ============================================================================
// Mobile identity
// ============================================================================

const IDENTITY_TYPE_IMSI: u8 = 1;
const IDENTITY_TYPE_IMEI: u8 = 2;
const IDENTITY_TYPE_IMEISV: u8 = 3;
const IDENTITY_TYPE_GUTI: u8 = 6;

/// Identity requested by an Identity Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdentityType {
    Imsi = IDENTITY_TYPE_IMSI,
    Imei = IDENTITY_TYPE_IMEI,
    Imeisv = IDENTITY_TYPE_IMEISV,
}

impl IdentityType {
    pub fn decode(value: u8) -> NasResult<Self> {
        match value & 0x07 {
            IDENTITY_TYPE_IMSI => Ok(Self::Imsi),
            IDENTITY_TYPE_IMEI => Ok(Self::Imei),
            IDENTITY_TYPE_IMEISV => Ok(Self::Imeisv),
            other => Err(NasError::InvalidMobileIdentityType(other)),
        }
    }
}

/// EPS mobile identity (TS 24.301 clause 9.9.3.12)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileIdentity {
    Imsi(String),
    Imei(String),
    Imeisv(String),
    Guti(Guti),
}

fn parse_digits(s: &str) -> NasResult<Vec<u8>> {
    s.chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as u8)
                .ok_or_else(|| NasError::InvalidDigits(s.to_string()))
        })
        .collect()
}

fn encode_digits(buf: &mut BytesMut, type_id: u8, digits: &str) -> NasResult<()> {
    let digits = parse_digits(digits)?;
    if digits.is_empty() {
        return Err(NasError::InvalidDigits(String::new()));
    }
    let odd = digits.len() % 2 == 1;
    let mut value = Vec::with_capacity(digits.len() / 2 + 1);
    value.push((digits[0] << 4) | ((odd as u8) << 3) | type_id);
    for pair in digits[1..].chunks(2) {
        let hi = pair.get(1).copied().unwrap_or(0x0f);
        value.push((hi << 4) | pair[0]);
    }
    put_lv(buf, &value);
    Ok(())
}

/// BCD digits after the type octet. Only the high nibble of the last octet
/// may be 0xF filler; any other nibble above 9 is invalid.
fn decode_digits(value: &[u8]) -> NasResult<String> {
    let invalid = || NasError::InvalidDigits(format!("{:02x?}", value));
    let digit = |nibble: u8| match nibble {
        0..=9 => Ok(char::from(b'0' + nibble)),
        _ => Err(invalid()),
    };

    let mut out = String::with_capacity(value.len() * 2);
    out.push(digit(value[0] >> 4)?);
    for (i, byte) in value.iter().enumerate().skip(1) {
        out.push(digit(byte & 0x0f)?);
        let hi = byte >> 4;
        if hi == 0x0f && i == value.len() - 1 {
            continue;
        }
        out.push(digit(hi)?);
    }
    Ok(out)
}

impl MobileIdentity {
    pub fn encode(&self, buf: &mut BytesMut) -> NasResult<()> {
        match self {
            Self::Imsi(digits) => encode_digits(buf, IDENTITY_TYPE_IMSI, digits),
            Self::Imei(digits) => encode_digits(buf, IDENTITY_TYPE_IMEI, digits),
            Self::Imeisv(digits) => encode_digits(buf, IDENTITY_TYPE_IMEISV, digits),
            Self::Guti(guti) => {
                buf.put_u8(11);
                buf.put_u8(0xf0 | IDENTITY_TYPE_GUTI);
                guti.plmn_id.encode(buf);
                buf.put_u16(guti.mme_gid);
                buf.put_u8(guti.mme_code);
                buf.put_u32(guti.m_tmsi);
                Ok(())
            }
        }
    }

    /// Decode an LV-encoded mobile identity
    pub fn decode(buf: &mut Bytes) -> NasResult<Self> {
        let mut value = get_lv(buf)?;
        if value.is_empty() {
            return Err(NasError::InvalidIeLength { expected: 1, actual: 0 });
        }
        match value[0] & 0x07 {
            IDENTITY_TYPE_IMSI => Ok(Self::Imsi(decode_digits(&value)?)),
            IDENTITY_TYPE_IMEI => Ok(Self::Imei(decode_digits(&value)?)),
            IDENTITY_TYPE_IMEISV => Ok(Self::Imeisv(decode_digits(&value)?)),
            IDENTITY_TYPE_GUTI => {
                if value.len() != 11 {
                    return Err(NasError::InvalidIeLength {
                        expected: 11,
                        actual: value.len(),
                    });
                }
                value.advance(1);
                let plmn_id = PlmnId::decode(&mut value)?;
                Ok(Self::Guti(Guti {
                    plmn_id,
                    mme_gid: value.get_u16(),
                    mme_code: value.get_u8(),
                    m_tmsi: value.get_u32(),
                }))
            }
            other => Err(NasError::InvalidMobileIdentityType(other)),
        }
    }
}

impl fmt::Display for MobileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imsi(d) => write!(f, "IMSI[{}]", d),
            Self::Imei(d) => write!(f, "IMEI[{}]", d),
            Self::Imeisv(d) => write!(f, "IMEISV[{}]", d),
            Self::Guti(g) => write!(f, "GUTI[{}]", g),
        }
    }
}

// ============================================================================
// UE network capability / selected algorithms
// ============================================================================

/// UE network capability (TS 24.301 clause 9.9.3.34)
///
/// Bit 8 of each octet is algorithm 0, bit 1 is algorithm 7.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UeNetworkCapability {
    pub eea: u8,
    pub eia: u8,
    /// Remaining octets, carried opaquely and replayed unchanged
    pub rest: Vec<u8>,
}

impl UeNetworkCapability {
    pub fn new(eea: u8, eia: u8) -> Self {
        Self { eea, eia, rest: Vec::new() }
    }

    pub fn supports_eea(&self, algorithm: u8) -> bool {
        algorithm < 8 && self.eea & (0x80 >> algorithm) != 0
    }

    pub fn supports_eia(&self, algorithm: u8) -> bool {
        algorithm < 8 && self.eia & (0x80 >> algorithm) != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((2 + self.rest.len()) as u8);
        buf.put_u8(self.eea);
        buf.put_u8(self.eia);
        buf.put_slice(&self.rest);
    }

    pub fn decode(buf: &mut Bytes) -> NasResult<Self> {
        let value = get_lv(buf)?;
        if value.len() < 2 {
            return Err(NasError::InvalidIeLength {
                expected: 2,
                actual: value.len(),
            });
        }
        Ok(Self {
            eea: value[0],
            eia: value[1],
            rest: value[2..].to_vec(),
        })
    }
}

/// NAS security algorithms IE (TS 24.301 clause 9.9.3.23)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityAlgorithms {
    pub ciphering: u8,
    pub integrity: u8,
}

impl SecurityAlgorithms {
    pub fn encode(&self) -> u8 {
        ((self.ciphering & 0x07) << 4) | (self.integrity & 0x07)
    }

    pub fn decode(byte: u8) -> Self {
        Self {
            ciphering: (byte >> 4) & 0x07,
            integrity: byte & 0x07,
        }
    }
}

// ============================================================================
// Procedure types
// ============================================================================

/// EPS attach type (TS 24.301 clause 9.9.3.11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsAttachType {
    #[default]
    EpsAttach = 1,
    CombinedEpsImsiAttach = 2,
    EpsEmergencyAttach = 6,
}

impl EpsAttachType {
    pub fn decode(byte: u8) -> Self {
        match byte & 0x07 {
            2 => Self::CombinedEpsImsiAttach,
            6 => Self::EpsEmergencyAttach,
            _ => Self::EpsAttach,
        }
    }
}

/// EPS attach result (TS 24.301 clause 9.9.3.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsAttachResult {
    #[default]
    EpsOnly = 1,
    CombinedEpsImsi = 2,
}

impl EpsAttachResult {
    pub fn decode(byte: u8) -> Self {
        match byte & 0x07 {
            2 => Self::CombinedEpsImsi,
            _ => Self::EpsOnly,
        }
    }
}

/// EPS update type (TS 24.301 clause 9.9.3.14)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsUpdateType {
    #[default]
    TaUpdating = 0,
    CombinedTaLaUpdating = 1,
    CombinedTaLaUpdatingWithImsiAttach = 2,
    PeriodicUpdating = 3,
}

impl EpsUpdateType {
    pub fn decode(byte: u8) -> NasResult<Self> {
        match byte & 0x07 {
            0 => Ok(Self::TaUpdating),
            1 => Ok(Self::CombinedTaLaUpdating),
            2 => Ok(Self::CombinedTaLaUpdatingWithImsiAttach),
            3 => Ok(Self::PeriodicUpdating),
            other => Err(NasError::DecodingError(format!("Unknown EPS update type: {}", other))),
        }
    }

    /// Result carried in the TAU Accept for each update type
    pub fn accept_result(&self) -> EpsUpdateResult {
        match self {
            Self::TaUpdating | Self::PeriodicUpdating => EpsUpdateResult::TaUpdated,
            Self::CombinedTaLaUpdating | Self::CombinedTaLaUpdatingWithImsiAttach => {
                EpsUpdateResult::CombinedTaLaUpdated
            }
        }
    }
}

/// EPS update result (TS 24.301 clause 9.9.3.13)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EpsUpdateResult {
    #[default]
    TaUpdated = 0,
    CombinedTaLaUpdated = 1,
}

impl EpsUpdateResult {
    pub fn decode(byte: u8) -> Self {
        match byte & 0x07 {
            1 => Self::CombinedTaLaUpdated,
            _ => Self::TaUpdated,
        }
    }
}

/// Detach type (TS 24.301 clause 9.9.3.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetachType {
    pub switch_off: bool,
    /// 1 EPS, 2 IMSI, 3 combined (UE originating); 1 re-attach required,
    /// 2 re-attach not required, 3 IMSI detach (network originating)
    pub value: u8,
}

impl DetachType {
    pub const REATTACH_REQUIRED: u8 = 1;
    pub const REATTACH_NOT_REQUIRED: u8 = 2;

    pub fn encode(&self) -> u8 {
        ((self.switch_off as u8) << 3) | (self.value & 0x07)
    }

    pub fn decode(nibble: u8) -> Self {
        Self {
            switch_off: nibble & 0x08 != 0,
            value: nibble & 0x07,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plmn() -> PlmnId {
        PlmnId::new("001", "01").unwrap()
    }

    #[test]
    fn test_plmn_bcd() {
        let mut buf = BytesMut::new();
        plmn().encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0xf1, 0x10]);
        let decoded = PlmnId::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, plmn());
        assert_eq!(decoded.to_string(), "00101");
    }

    #[test]
    fn test_plmn_rejects_bad_digits() {
        assert!(PlmnId::new("0a1", "01").is_err());
        assert!(PlmnId::new("001", "1").is_err());
    }

    #[test]
    fn test_imsi_identity() {
        let id = MobileIdentity::Imsi("001010123456789".into());
        let mut buf = BytesMut::new();
        id.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 8);
        assert_eq!(buf[1], 0x09);
        assert_eq!(MobileIdentity::decode(&mut buf.freeze()).unwrap(), id);
    }

    #[test]
    fn test_even_length_imei() {
        let id = MobileIdentity::Imeisv("3534900698733190".into());
        let mut buf = BytesMut::new();
        id.encode(&mut buf).unwrap();
        assert_eq!(MobileIdentity::decode(&mut buf.freeze()).unwrap(), id);
    }

    #[test]
    fn test_guti_identity() {
        let guti = Guti {
            plmn_id: plmn(),
            mme_gid: 2,
            mme_code: 1,
            m_tmsi: 0xc000_0001,
        };
        let mut buf = BytesMut::new();
        MobileIdentity::Guti(guti).encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(
            MobileIdentity::decode(&mut buf.freeze()).unwrap(),
            MobileIdentity::Guti(guti)
        );
    }

    #[test]
    fn test_non_decimal_imsi_digit_rejected() {
        // IMSI 0010101234 with a 0xC nibble in place of the fifth digit
        let mut buf = Bytes::from_static(&[6, 0x09, 0x10, 0xc0, 0x21, 0x43, 0xf5]);
        assert!(matches!(
            MobileIdentity::decode(&mut buf),
            Err(NasError::InvalidDigits(_))
        ));

        // filler only allowed in the last octet
        let mut buf = Bytes::from_static(&[3, 0x09, 0xf0, 0x01]);
        assert!(matches!(
            MobileIdentity::decode(&mut buf),
            Err(NasError::InvalidDigits(_))
        ));
    }

    #[test]
    fn test_truncated_identity() {
        let mut buf = Bytes::from_static(&[11, 0xf6, 0x00]);
        assert!(matches!(
            MobileIdentity::decode(&mut buf),
            Err(NasError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_capability_bits() {
        let cap = UeNetworkCapability::new(0xe0, 0x60);
        assert!(cap.supports_eea(0));
        assert!(cap.supports_eea(2));
        assert!(!cap.supports_eea(3));
        assert!(!cap.supports_eia(0));
        assert!(cap.supports_eia(1));
        assert!(cap.supports_eia(2));
    }

    #[test]
    fn test_update_type_results() {
        assert_eq!(EpsUpdateType::TaUpdating.accept_result(), EpsUpdateResult::TaUpdated);
        assert_eq!(
            EpsUpdateType::CombinedTaLaUpdating.accept_result(),
            EpsUpdateResult::CombinedTaLaUpdated
        );
        assert_eq!(
            EpsUpdateType::CombinedTaLaUpdatingWithImsiAttach.accept_result(),
            EpsUpdateResult::CombinedTaLaUpdated
        );
        assert_eq!(EpsUpdateType::PeriodicUpdating.accept_result(), EpsUpdateResult::TaUpdated);
    }

    #[test]
    fn test_ksi_nibble() {
        let ksi = KeySetIdentifier::native(3);
        assert_eq!(KeySetIdentifier::decode(ksi.encode()), ksi);
        assert!(!KeySetIdentifier::none().is_valid());
    }
}
