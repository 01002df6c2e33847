//! NAS security encode/decode
//!
//! Downlink: integrity protect and optionally cipher an EMM message with
//! the subscriber's security context. Uplink: classify a PDU, verify its
//! MAC and sequence number, decipher, and parse the inner message.
//!
//! Verification failures are not errors here. The result carries an
//! [`Integrity`] verdict and the state machine decides what to do with it.

use bytes::Bytes;

use mme_crypt::{nas_encrypt, nas_mac, Direction};
use mme_nas::security::{build_protected_pdu, ServiceRequestPdu};
use mme_nas::{
    build_emm_message, parse_emm_message, split_pdu, EmmMessage, KeySetIdentifier, Link, NasPdu,
    SecurityHeaderType,
};

use crate::error::EmmResult;
use crate::security::SecurityContext;

/// NAS signalling always uses bearer 0
pub const NAS_SECURITY_BEARER: u8 = 0;

/// Outcome of uplink integrity checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// Sent without protection
    Plain,
    /// MAC verified and sequence number fresh
    Verified,
    /// MAC mismatch, replayed sequence number, or no keys to check with
    Failed,
}

/// A decoded uplink EMM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub message: EmmMessage,
    pub header_type: SecurityHeaderType,
    pub integrity: Integrity,
    /// Uplink COUNT, when verified
    pub count: Option<u32>,
}

/// A decoded Service Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequest {
    pub ksi: KeySetIdentifier,
    /// A valid security context named by `ksi` exists. Without one the
    /// short MAC cannot be checked at all.
    pub known_ksi: bool,
    pub integrity: Integrity,
    pub count: Option<u32>,
}

/// A decoded uplink PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkPdu {
    Message(Uplink),
    ServiceRequest(ServiceRequest),
}

/// Encode a downlink message.
///
/// `Plain` returns the bare message. Any other header type consumes one
/// downlink COUNT from `sc`. EEA0 leaves the body in clear even when the
/// header type says ciphered.
pub fn nas_eps_security_encode(
    sc: Option<&mut SecurityContext>,
    header_type: SecurityHeaderType,
    message: &EmmMessage,
) -> EmmResult<Bytes> {
    let plain = build_emm_message(message)?;
    let sc = match (header_type, sc) {
        (SecurityHeaderType::Plain, _) | (_, None) => return Ok(plain),
        (_, Some(sc)) if !sc.has_keys() => return Ok(plain),
        (_, Some(sc)) => sc,
    };

    let count = sc.next_dl();
    let mut covered = Vec::with_capacity(1 + plain.len());
    covered.push((count & 0xff) as u8);
    covered.extend_from_slice(&plain);

    if header_type.is_ciphered() {
        nas_encrypt(
            sc.ciphering(),
            sc.knas_enc(),
            count,
            NAS_SECURITY_BEARER,
            Direction::Downlink,
            &mut covered[1..],
        )?;
    }

    let mac = nas_mac(
        sc.integrity(),
        sc.knas_int(),
        count,
        NAS_SECURITY_BEARER,
        Direction::Downlink,
        &covered,
    )?;

    Ok(build_protected_pdu(header_type, mac, &covered))
}

/// Decode an uplink PDU.
///
/// Ciphered PDUs without keys to decipher them, and anything that does
/// not parse, are errors.
pub fn nas_eps_security_decode(
    sc: Option<&mut SecurityContext>,
    raw: &Bytes,
) -> EmmResult<UplinkPdu> {
    match split_pdu(raw)? {
        NasPdu::Plain(mut buf) => {
            let message = parse_emm_message(&mut buf, Link::Uplink)?;
            Ok(UplinkPdu::Message(Uplink {
                message,
                header_type: SecurityHeaderType::Plain,
                integrity: Integrity::Plain,
                count: None,
            }))
        }
        NasPdu::ServiceRequest(pdu) => Ok(UplinkPdu::ServiceRequest(decode_service_request(sc, &pdu)?)),
        NasPdu::Protected(pdu) => {
            let sc = match sc {
                Some(sc) if sc.has_keys() => sc,
                _ => {
                    if pdu.header_type.is_ciphered() {
                        return Err(crate::error::EmmError::NoSecurityContext);
                    }
                    let mut inner = pdu.inner();
                    let message = parse_emm_message(&mut inner, Link::Uplink)?;
                    return Ok(UplinkPdu::Message(Uplink {
                        message,
                        header_type: pdu.header_type,
                        integrity: Integrity::Failed,
                        count: None,
                    }));
                }
            };

            let fresh = sc.estimate_ul(pdu.seq);
            let count = fresh.unwrap_or_else(|| sc.guess_ul(pdu.seq));

            let mac = nas_mac(
                sc.integrity(),
                sc.knas_int(),
                count,
                NAS_SECURITY_BEARER,
                Direction::Uplink,
                &pdu.covered,
            )?;
            let mac_ok = mac == pdu.mac;
            if !mac_ok {
                log::warn!(
                    "NAS MAC verification failed ({:02x?} != {:02x?})",
                    pdu.mac,
                    mac
                );
            } else if fresh.is_none() {
                log::warn!("NAS sequence number {} replayed (next COUNT {})", pdu.seq, sc.ul_count());
            }

            let mut body = pdu.inner().to_vec();
            if pdu.header_type.is_ciphered() {
                nas_encrypt(
                    sc.ciphering(),
                    sc.knas_enc(),
                    count,
                    NAS_SECURITY_BEARER,
                    Direction::Uplink,
                    &mut body,
                )?;
            }
            let mut body = Bytes::from(body);
            let message = parse_emm_message(&mut body, Link::Uplink)?;

            let verified = mac_ok && fresh.is_some();
            if verified {
                sc.commit_ul(count);
            }
            Ok(UplinkPdu::Message(Uplink {
                message,
                header_type: pdu.header_type,
                integrity: if verified { Integrity::Verified } else { Integrity::Failed },
                count: if verified { Some(count) } else { None },
            }))
        }
    }
}

/// Verify a Service Request's short MAC: the low 16 bits of the MAC over
/// its first two octets
fn decode_service_request(
    sc: Option<&mut SecurityContext>,
    pdu: &ServiceRequestPdu,
) -> EmmResult<ServiceRequest> {
    let failed = ServiceRequest {
        ksi: pdu.ksi,
        known_ksi: true,
        integrity: Integrity::Failed,
        count: None,
    };
    let Some(sc) = sc.filter(|sc| sc.is_valid() && sc.matches_ksi(pdu.ksi)) else {
        return Ok(ServiceRequest {
            known_ksi: false,
            ..failed
        });
    };
    let Some(count) = sc.estimate_ul_short(pdu.seq) else {
        log::warn!("Service Request sequence number {} replayed", pdu.seq);
        return Ok(failed);
    };

    let mac = nas_mac(
        sc.integrity(),
        sc.knas_int(),
        count,
        NAS_SECURITY_BEARER,
        Direction::Uplink,
        &pdu.covered,
    )?;
    if mac[2..] != pdu.short_mac {
        log::warn!(
            "Service Request short MAC failed ({:02x?} != {:02x?})",
            pdu.short_mac,
            &mac[2..]
        );
        return Ok(failed);
    }

    sc.commit_ul(count);
    Ok(ServiceRequest {
        ksi: pdu.ksi,
        known_ksi: true,
        integrity: Integrity::Verified,
        count: Some(count),
    })
}
