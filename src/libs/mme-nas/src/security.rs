//! NAS security header framing
//!
//! Splits a raw NAS PDU by security header type (TS 24.301 clause 9.3.1)
//! and builds protected PDUs. Integrity and ciphering themselves are left
//! to the caller; this module only knows the layout:
//!
//! ```text
//! protected:        | SHT/PD | MAC (4) | SEQ | NAS message ... |
//! service request:  | SHT/PD | KSI/SEQ | short MAC (2) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NasError, NasResult};
use crate::message::{parse_emm_message, EmmMessage, Link, PD_EMM};
use crate::types::{Guti, KeySetIdentifier, MobileIdentity};

/// Length of the protected header (SHT/PD, MAC, SEQ)
pub const PROTECTED_HEADER_LEN: usize = 6;

/// Length of the service request PDU
pub const SERVICE_REQUEST_LEN: usize = 4;

/// Security header types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityHeaderType {
    Plain = 0,
    IntegrityProtected = 1,
    IntegrityProtectedAndCiphered = 2,
    IntegrityProtectedWithNewContext = 3,
    IntegrityProtectedAndCipheredWithNewContext = 4,
    ServiceRequest = 12,
}

impl SecurityHeaderType {
    pub fn decode(value: u8) -> NasResult<Self> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::IntegrityProtected),
            2 => Ok(Self::IntegrityProtectedAndCiphered),
            3 => Ok(Self::IntegrityProtectedWithNewContext),
            4 => Ok(Self::IntegrityProtectedAndCipheredWithNewContext),
            12 => Ok(Self::ServiceRequest),
            other => Err(NasError::InvalidSecurityHeaderType(other)),
        }
    }

    pub fn is_ciphered(&self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedAndCiphered | Self::IntegrityProtectedAndCipheredWithNewContext
        )
    }

    pub fn is_new_context(&self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedWithNewContext | Self::IntegrityProtectedAndCipheredWithNewContext
        )
    }
}

/// A protected PDU split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPdu {
    pub header_type: SecurityHeaderType,
    pub mac: [u8; 4],
    pub seq: u8,
    /// SEQ followed by the (possibly ciphered) inner message; the MAC covers this
    pub covered: Bytes,
}

impl ProtectedPdu {
    /// The inner message, without the SEQ octet
    pub fn inner(&self) -> Bytes {
        self.covered.slice(1..)
    }
}

/// A service request PDU (TS 24.301 clause 8.2.25)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequestPdu {
    pub ksi: KeySetIdentifier,
    /// Five least significant bits of the uplink NAS COUNT
    pub seq: u8,
    pub short_mac: [u8; 2],
    /// First two octets; the short MAC covers these
    pub covered: [u8; 2],
}

/// A raw NAS PDU classified by security header type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasPdu {
    Plain(Bytes),
    Protected(ProtectedPdu),
    ServiceRequest(ServiceRequestPdu),
}

/// Classify a raw uplink PDU by its security header type
pub fn split_pdu(raw: &Bytes) -> NasResult<NasPdu> {
    if raw.is_empty() {
        return Err(NasError::BufferTooShort { expected: 1, actual: 0 });
    }
    let first = raw[0];
    if first & 0x0f != PD_EMM {
        return Err(NasError::InvalidProtocolDiscriminator(first & 0x0f));
    }

    match SecurityHeaderType::decode(first >> 4)? {
        SecurityHeaderType::Plain => Ok(NasPdu::Plain(raw.clone())),
        SecurityHeaderType::ServiceRequest => {
            if raw.len() < SERVICE_REQUEST_LEN {
                return Err(NasError::BufferTooShort {
                    expected: SERVICE_REQUEST_LEN,
                    actual: raw.len(),
                });
            }
            Ok(NasPdu::ServiceRequest(ServiceRequestPdu {
                ksi: KeySetIdentifier::native(raw[1] >> 5),
                seq: raw[1] & 0x1f,
                short_mac: [raw[2], raw[3]],
                covered: [raw[0], raw[1]],
            }))
        }
        header_type => {
            if raw.len() < PROTECTED_HEADER_LEN + 2 {
                return Err(NasError::BufferTooShort {
                    expected: PROTECTED_HEADER_LEN + 2,
                    actual: raw.len(),
                });
            }
            let mut buf = raw.clone();
            buf.advance(1);
            let mut mac = [0u8; 4];
            buf.copy_to_slice(&mut mac);
            Ok(NasPdu::Protected(ProtectedPdu {
                header_type,
                mac,
                seq: buf[0],
                covered: buf,
            }))
        }
    }
}

/// Prefix `covered` (SEQ || message) with a protected header
pub fn build_protected_pdu(header_type: SecurityHeaderType, mac: [u8; 4], covered: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + covered.len());
    buf.put_u8(((header_type as u8) << 4) | PD_EMM);
    buf.put_slice(&mac);
    buf.put_slice(covered);
    buf.freeze()
}

/// The two octets a service request's short MAC covers
pub fn service_request_header(ksi: u8, seq: u8) -> [u8; 2] {
    [
        ((SecurityHeaderType::ServiceRequest as u8) << 4) | PD_EMM,
        ((ksi & 0x07) << 5) | (seq & 0x1f),
    ]
}

/// Build a service request PDU
pub fn build_service_request(ksi: u8, seq: u8, short_mac: [u8; 2]) -> Bytes {
    let header = service_request_header(ksi, seq);
    Bytes::copy_from_slice(&[header[0], header[1], short_mac[0], short_mac[1]])
}

/// Best-effort GUTI extraction for routing before a context is found.
///
/// Looks through a plain or integrity-only protected PDU for the GUTI in an
/// Attach Request, TAU Request or Detach Request. Ciphered PDUs and
/// anything undecodable yield `None`.
pub fn get_guti_from_message(raw: &Bytes) -> Option<Guti> {
    let mut inner = match split_pdu(raw).ok()? {
        NasPdu::Plain(plain) => plain,
        NasPdu::Protected(pdu) if !pdu.header_type.is_ciphered() => pdu.inner(),
        _ => return None,
    };

    let identity = match parse_emm_message(&mut inner, Link::Uplink).ok()? {
        EmmMessage::AttachRequest(m) => m.identity,
        EmmMessage::TrackingAreaUpdateRequest(m) => m.old_guti,
        EmmMessage::DetachRequestUe(m) => m.identity,
        _ => return None,
    };

    match identity {
        MobileIdentity::Guti(guti) => Some(guti),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_emm_message, TrackingAreaUpdateRequest};
    use crate::types::{EpsUpdateType, PlmnId};

    fn guti() -> Guti {
        Guti {
            plmn_id: PlmnId::new("001", "01").unwrap(),
            mme_gid: 2,
            mme_code: 1,
            m_tmsi: 0xdead_beef,
        }
    }

    fn tau() -> Bytes {
        build_emm_message(&EmmMessage::TrackingAreaUpdateRequest(TrackingAreaUpdateRequest {
            update_type: EpsUpdateType::PeriodicUpdating,
            active: false,
            ksi: KeySetIdentifier::native(1),
            old_guti: MobileIdentity::Guti(guti()),
            ue_network_capability: None,
        }))
        .unwrap()
    }

    fn with_seq(seq: u8, msg: &[u8]) -> Vec<u8> {
        let mut covered = vec![seq];
        covered.extend_from_slice(msg);
        covered
    }

    #[test]
    fn test_split_plain() {
        let raw = tau();
        assert_eq!(split_pdu(&raw).unwrap(), NasPdu::Plain(raw.clone()));
    }

    #[test]
    fn test_split_protected() {
        let raw = build_protected_pdu(
            SecurityHeaderType::IntegrityProtected,
            [1, 2, 3, 4],
            &with_seq(9, &tau()),
        );
        match split_pdu(&raw).unwrap() {
            NasPdu::Protected(pdu) => {
                assert_eq!(pdu.mac, [1, 2, 3, 4]);
                assert_eq!(pdu.seq, 9);
                assert_eq!(pdu.inner(), tau());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_service_request() {
        let raw = build_service_request(3, 0x15, [0xaa, 0xbb]);
        match split_pdu(&raw).unwrap() {
            NasPdu::ServiceRequest(sr) => {
                assert_eq!(sr.ksi, KeySetIdentifier::native(3));
                assert_eq!(sr.seq, 0x15);
                assert_eq!(sr.short_mac, [0xaa, 0xbb]);
                assert_eq!(sr.covered, service_request_header(3, 0x15));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_rejects_unknown_header() {
        let raw = Bytes::from_static(&[0x57, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(split_pdu(&raw), Err(NasError::InvalidSecurityHeaderType(5)));
    }

    #[test]
    fn test_guti_from_plain_and_integrity_only() {
        assert_eq!(get_guti_from_message(&tau()), Some(guti()));

        let protected = build_protected_pdu(
            SecurityHeaderType::IntegrityProtected,
            [0; 4],
            &with_seq(0, &tau()),
        );
        assert_eq!(get_guti_from_message(&protected), Some(guti()));
    }

    #[test]
    fn test_guti_not_from_ciphered() {
        let ciphered = build_protected_pdu(
            SecurityHeaderType::IntegrityProtectedAndCiphered,
            [0; 4],
            &with_seq(0, &tau()),
        );
        assert_eq!(get_guti_from_message(&ciphered), None);
        assert_eq!(get_guti_from_message(&Bytes::from_static(&[0x07])), None);
    }
}
