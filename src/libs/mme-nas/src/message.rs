//! EPS mobility management messages
//!
//! Based on 3GPP TS 24.301 clause 8.2. Mandatory IEs follow the standard
//! order; optional IEs are TLV/TV with the standard IEIs, and unknown
//! optional IEs are skipped on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NasError, NasResult};
use crate::types::*;

/// EPS mobility management protocol discriminator
pub const PD_EMM: u8 = 0x07;

const IEI_GUTI: u8 = 0x50;
const IEI_EMM_CAUSE: u8 = 0x53;
const IEI_TAI_LIST: u8 = 0x54;
const IEI_UE_NETWORK_CAPABILITY: u8 = 0x58;
const IEI_T3412_VALUE: u8 = 0x5a;
const IEI_AUTS: u8 = 0x30;
const IEI_ESM_CONTAINER: u8 = 0x78;

/// AUTS length (TS 33.102)
pub const AUTS_LEN: usize = 14;

/// EMM message types (TS 24.301 table 9.8.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EmmMessageType {
    AttachRequest = 0x41,
    AttachAccept = 0x42,
    AttachComplete = 0x43,
    AttachReject = 0x44,
    DetachRequest = 0x45,
    DetachAccept = 0x46,
    TrackingAreaUpdateRequest = 0x48,
    TrackingAreaUpdateAccept = 0x49,
    TrackingAreaUpdateComplete = 0x4a,
    TrackingAreaUpdateReject = 0x4b,
    ServiceReject = 0x4e,
    AuthenticationRequest = 0x52,
    AuthenticationResponse = 0x53,
    AuthenticationReject = 0x54,
    IdentityRequest = 0x55,
    IdentityResponse = 0x56,
    AuthenticationFailure = 0x5c,
    SecurityModeCommand = 0x5d,
    SecurityModeComplete = 0x5e,
    SecurityModeReject = 0x5f,
    EmmStatus = 0x60,
}

impl TryFrom<u8> for EmmMessageType {
    type Error = NasError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x41 => Ok(Self::AttachRequest),
            0x42 => Ok(Self::AttachAccept),
            0x43 => Ok(Self::AttachComplete),
            0x44 => Ok(Self::AttachReject),
            0x45 => Ok(Self::DetachRequest),
            0x46 => Ok(Self::DetachAccept),
            0x48 => Ok(Self::TrackingAreaUpdateRequest),
            0x49 => Ok(Self::TrackingAreaUpdateAccept),
            0x4a => Ok(Self::TrackingAreaUpdateComplete),
            0x4b => Ok(Self::TrackingAreaUpdateReject),
            0x4e => Ok(Self::ServiceReject),
            0x52 => Ok(Self::AuthenticationRequest),
            0x53 => Ok(Self::AuthenticationResponse),
            0x54 => Ok(Self::AuthenticationReject),
            0x55 => Ok(Self::IdentityRequest),
            0x56 => Ok(Self::IdentityResponse),
            0x5c => Ok(Self::AuthenticationFailure),
            0x5d => Ok(Self::SecurityModeCommand),
            0x5e => Ok(Self::SecurityModeComplete),
            0x5f => Ok(Self::SecurityModeReject),
            0x60 => Ok(Self::EmmStatus),
            _ => Err(NasError::InvalidMessageType(value)),
        }
    }
}

/// Which side sent the message; Detach Request differs by direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Uplink,
    Downlink,
}

// ============================================================================
// Messages
// ============================================================================

/// Attach Request (TS 24.301 clause 8.2.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub attach_type: EpsAttachType,
    pub ksi: KeySetIdentifier,
    pub identity: MobileIdentity,
    pub ue_network_capability: UeNetworkCapability,
    pub esm_container: Bytes,
}

/// Attach Accept (TS 24.301 clause 8.2.1)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachAccept {
    pub result: EpsAttachResult,
    pub t3412: u8,
    pub tai_list: Bytes,
    pub esm_container: Bytes,
    pub guti: Option<Guti>,
}

/// Attach Complete (TS 24.301 clause 8.2.2)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachComplete {
    pub esm_container: Bytes,
}

/// Attach Reject (TS 24.301 clause 8.2.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReject {
    pub cause: EmmCause,
    pub esm_container: Option<Bytes>,
}

/// UE originating Detach Request (TS 24.301 clause 8.2.11.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachRequestUe {
    pub detach_type: DetachType,
    pub ksi: KeySetIdentifier,
    pub identity: MobileIdentity,
}

/// Network originating Detach Request (TS 24.301 clause 8.2.11.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachRequestNetwork {
    pub detach_type: DetachType,
    pub cause: Option<EmmCause>,
}

/// Tracking Area Update Request (TS 24.301 clause 8.2.29)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingAreaUpdateRequest {
    pub update_type: EpsUpdateType,
    /// "Bearer establishment requested" flag
    pub active: bool,
    pub ksi: KeySetIdentifier,
    pub old_guti: MobileIdentity,
    pub ue_network_capability: Option<UeNetworkCapability>,
}

/// Tracking Area Update Accept (TS 24.301 clause 8.2.26)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackingAreaUpdateAccept {
    pub result: EpsUpdateResult,
    pub t3412: Option<u8>,
    pub guti: Option<Guti>,
    pub tai_list: Option<Bytes>,
}

/// Authentication Request (TS 24.301 clause 8.2.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub ksi: KeySetIdentifier,
    pub rand: [u8; 16],
    pub autn: [u8; 16],
}

/// Authentication Response (TS 24.301 clause 8.2.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationResponse {
    pub res: Bytes,
}

/// Authentication Failure (TS 24.301 clause 8.2.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationFailure {
    pub cause: EmmCause,
    pub auts: Option<[u8; AUTS_LEN]>,
}

/// Security Mode Command (TS 24.301 clause 8.2.20)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityModeCommand {
    pub algorithms: SecurityAlgorithms,
    pub ksi: KeySetIdentifier,
    pub replayed_capability: UeNetworkCapability,
}

/// EMM messages handled by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmmMessage {
    AttachRequest(AttachRequest),
    AttachAccept(AttachAccept),
    AttachComplete(AttachComplete),
    AttachReject(AttachReject),
    DetachRequestUe(DetachRequestUe),
    DetachRequestNetwork(DetachRequestNetwork),
    DetachAccept,
    TrackingAreaUpdateRequest(TrackingAreaUpdateRequest),
    TrackingAreaUpdateAccept(TrackingAreaUpdateAccept),
    TrackingAreaUpdateComplete,
    TrackingAreaUpdateReject(EmmCause),
    ServiceReject(EmmCause),
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    AuthenticationReject,
    AuthenticationFailure(AuthenticationFailure),
    IdentityRequest(IdentityType),
    IdentityResponse(MobileIdentity),
    SecurityModeCommand(SecurityModeCommand),
    SecurityModeComplete,
    SecurityModeReject(EmmCause),
    EmmStatus(EmmCause),
}

impl EmmMessage {
    pub fn message_type(&self) -> EmmMessageType {
        match self {
            Self::AttachRequest(_) => EmmMessageType::AttachRequest,
            Self::AttachAccept(_) => EmmMessageType::AttachAccept,
            Self::AttachComplete(_) => EmmMessageType::AttachComplete,
            Self::AttachReject(_) => EmmMessageType::AttachReject,
            Self::DetachRequestUe(_) | Self::DetachRequestNetwork(_) => EmmMessageType::DetachRequest,
            Self::DetachAccept => EmmMessageType::DetachAccept,
            Self::TrackingAreaUpdateRequest(_) => EmmMessageType::TrackingAreaUpdateRequest,
            Self::TrackingAreaUpdateAccept(_) => EmmMessageType::TrackingAreaUpdateAccept,
            Self::TrackingAreaUpdateComplete => EmmMessageType::TrackingAreaUpdateComplete,
            Self::TrackingAreaUpdateReject(_) => EmmMessageType::TrackingAreaUpdateReject,
            Self::ServiceReject(_) => EmmMessageType::ServiceReject,
            Self::AuthenticationRequest(_) => EmmMessageType::AuthenticationRequest,
            Self::AuthenticationResponse(_) => EmmMessageType::AuthenticationResponse,
            Self::AuthenticationReject => EmmMessageType::AuthenticationReject,
            Self::AuthenticationFailure(_) => EmmMessageType::AuthenticationFailure,
            Self::IdentityRequest(_) => EmmMessageType::IdentityRequest,
            Self::IdentityResponse(_) => EmmMessageType::IdentityResponse,
            Self::SecurityModeCommand(_) => EmmMessageType::SecurityModeCommand,
            Self::SecurityModeComplete => EmmMessageType::SecurityModeComplete,
            Self::SecurityModeReject(_) => EmmMessageType::SecurityModeReject,
            Self::EmmStatus(_) => EmmMessageType::EmmStatus,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttachRequest(_) => "Attach request",
            Self::AttachAccept(_) => "Attach accept",
            Self::AttachComplete(_) => "Attach complete",
            Self::AttachReject(_) => "Attach reject",
            Self::DetachRequestUe(_) | Self::DetachRequestNetwork(_) => "Detach request",
            Self::DetachAccept => "Detach accept",
            Self::TrackingAreaUpdateRequest(_) => "TAU request",
            Self::TrackingAreaUpdateAccept(_) => "TAU accept",
            Self::TrackingAreaUpdateComplete => "TAU complete",
            Self::TrackingAreaUpdateReject(_) => "TAU reject",
            Self::ServiceReject(_) => "Service reject",
            Self::AuthenticationRequest(_) => "Authentication request",
            Self::AuthenticationResponse(_) => "Authentication response",
            Self::AuthenticationReject => "Authentication reject",
            Self::AuthenticationFailure(_) => "Authentication failure",
            Self::IdentityRequest(_) => "Identity request",
            Self::IdentityResponse(_) => "Identity response",
            Self::SecurityModeCommand(_) => "Security mode command",
            Self::SecurityModeComplete => "Security mode complete",
            Self::SecurityModeReject(_) => "Security mode reject",
            Self::EmmStatus(_) => "EMM status",
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn put_optional_esm(buf: &mut BytesMut, esm: &Option<Bytes>) {
    if let Some(esm) = esm {
        buf.put_u8(IEI_ESM_CONTAINER);
        put_lv_e(buf, esm);
    }
}

/// Encode a plain EMM message with its header
pub fn build_emm_message(msg: &EmmMessage) -> NasResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(PD_EMM);
    buf.put_u8(msg.message_type() as u8);

    match msg {
        EmmMessage::AttachRequest(m) => {
            buf.put_u8((m.ksi.encode() << 4) | (m.attach_type as u8));
            m.identity.encode(&mut buf)?;
            m.ue_network_capability.encode(&mut buf);
            put_lv_e(&mut buf, &m.esm_container);
        }
        EmmMessage::AttachAccept(m) => {
            buf.put_u8(m.result as u8);
            buf.put_u8(m.t3412);
            put_lv(&mut buf, &m.tai_list);
            put_lv_e(&mut buf, &m.esm_container);
            if let Some(guti) = m.guti {
                buf.put_u8(IEI_GUTI);
                MobileIdentity::Guti(guti).encode(&mut buf)?;
            }
        }
        EmmMessage::AttachComplete(m) => put_lv_e(&mut buf, &m.esm_container),
        EmmMessage::AttachReject(m) => {
            buf.put_u8(m.cause as u8);
            put_optional_esm(&mut buf, &m.esm_container);
        }
        EmmMessage::DetachRequestUe(m) => {
            buf.put_u8((m.ksi.encode() << 4) | m.detach_type.encode());
            m.identity.encode(&mut buf)?;
        }
        EmmMessage::DetachRequestNetwork(m) => {
            buf.put_u8(m.detach_type.encode());
            if let Some(cause) = m.cause {
                buf.put_u8(IEI_EMM_CAUSE);
                buf.put_u8(cause as u8);
            }
        }
        EmmMessage::TrackingAreaUpdateRequest(m) => {
            let update = ((m.active as u8) << 3) | (m.update_type as u8);
            buf.put_u8((m.ksi.encode() << 4) | update);
            m.old_guti.encode(&mut buf)?;
            if let Some(cap) = &m.ue_network_capability {
                buf.put_u8(IEI_UE_NETWORK_CAPABILITY);
                cap.encode(&mut buf);
            }
        }
        EmmMessage::TrackingAreaUpdateAccept(m) => {
            buf.put_u8(m.result as u8);
            if let Some(t3412) = m.t3412 {
                buf.put_u8(IEI_T3412_VALUE);
                buf.put_u8(t3412);
            }
            if let Some(guti) = m.guti {
                buf.put_u8(IEI_GUTI);
                MobileIdentity::Guti(guti).encode(&mut buf)?;
            }
            if let Some(tai_list) = &m.tai_list {
                buf.put_u8(IEI_TAI_LIST);
                put_lv(&mut buf, tai_list);
            }
        }
        EmmMessage::AuthenticationRequest(m) => {
            buf.put_u8(m.ksi.encode());
            buf.put_slice(&m.rand);
            put_lv(&mut buf, &m.autn);
        }
        EmmMessage::AuthenticationResponse(m) => put_lv(&mut buf, &m.res),
        EmmMessage::AuthenticationFailure(m) => {
            buf.put_u8(m.cause as u8);
            if let Some(auts) = &m.auts {
                buf.put_u8(IEI_AUTS);
                put_lv(&mut buf, auts);
            }
        }
        EmmMessage::IdentityRequest(t) => buf.put_u8(*t as u8),
        EmmMessage::IdentityResponse(identity) => identity.encode(&mut buf)?,
        EmmMessage::SecurityModeCommand(m) => {
            buf.put_u8(m.algorithms.encode());
            buf.put_u8(m.ksi.encode());
            m.replayed_capability.encode(&mut buf);
        }
        EmmMessage::TrackingAreaUpdateReject(cause)
        | EmmMessage::ServiceReject(cause)
        | EmmMessage::SecurityModeReject(cause)
        | EmmMessage::EmmStatus(cause) => buf.put_u8(*cause as u8),
        EmmMessage::DetachAccept
        | EmmMessage::TrackingAreaUpdateComplete
        | EmmMessage::AuthenticationReject
        | EmmMessage::SecurityModeComplete => {}
    }

    Ok(buf.freeze())
}

// ============================================================================
// Decoding
// ============================================================================

fn get_u8(buf: &mut Bytes) -> NasResult<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_array<const N: usize>(buf: &mut Bytes) -> NasResult<[u8; N]> {
    need(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn lv_array<const N: usize>(buf: &mut Bytes) -> NasResult<[u8; N]> {
    let value = get_lv(buf)?;
    if value.len() != N {
        return Err(NasError::InvalidIeLength {
            expected: N,
            actual: value.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&value);
    Ok(out)
}

fn decode_guti(buf: &mut Bytes) -> NasResult<Guti> {
    match MobileIdentity::decode(buf)? {
        MobileIdentity::Guti(guti) => Ok(guti),
        other => Err(NasError::DecodingError(format!("Expected GUTI, got {}", other))),
    }
}

/// Skip an unknown optional IE. Type 1 IEs (IEI >= 0x80) are one octet;
/// anything else is assumed to be TLV.
fn skip_ie(iei: u8, buf: &mut Bytes) -> NasResult<()> {
    log::trace!("Skipping IE 0x{:02x}", iei);
    if iei & 0x80 == 0 {
        get_lv(buf)?;
    }
    Ok(())
}

/// Decode a plain EMM message
pub fn parse_emm_message(buf: &mut Bytes, link: Link) -> NasResult<EmmMessage> {
    need(buf, 2)?;
    let pd = buf.get_u8();
    if pd & 0x0f != PD_EMM {
        return Err(NasError::InvalidProtocolDiscriminator(pd & 0x0f));
    }
    if pd >> 4 != 0 {
        return Err(NasError::InvalidSecurityHeaderType(pd >> 4));
    }
    let message_type = EmmMessageType::try_from(buf.get_u8())?;

    let msg = match message_type {
        EmmMessageType::AttachRequest => {
            let first = get_u8(buf)?;
            EmmMessage::AttachRequest(AttachRequest {
                attach_type: EpsAttachType::decode(first),
                ksi: KeySetIdentifier::decode(first >> 4),
                identity: MobileIdentity::decode(buf)?,
                ue_network_capability: UeNetworkCapability::decode(buf)?,
                esm_container: get_lv_e(buf)?,
            })
        }
        EmmMessageType::AttachAccept => {
            let result = EpsAttachResult::decode(get_u8(buf)?);
            let t3412 = get_u8(buf)?;
            let tai_list = get_lv(buf)?;
            let esm_container = get_lv_e(buf)?;
            let mut accept = AttachAccept {
                result,
                t3412,
                tai_list,
                esm_container,
                guti: None,
            };
            while buf.has_remaining() {
                match buf.get_u8() {
                    IEI_GUTI => accept.guti = Some(decode_guti(buf)?),
                    iei => skip_ie(iei, buf)?,
                }
            }
            EmmMessage::AttachAccept(accept)
        }
        EmmMessageType::AttachComplete => EmmMessage::AttachComplete(AttachComplete {
            esm_container: get_lv_e(buf)?,
        }),
        EmmMessageType::AttachReject => {
            let cause = EmmCause::from_u8(get_u8(buf)?);
            let mut esm_container = None;
            while buf.has_remaining() {
                match buf.get_u8() {
                    IEI_ESM_CONTAINER => esm_container = Some(get_lv_e(buf)?),
                    iei => skip_ie(iei, buf)?,
                }
            }
            EmmMessage::AttachReject(AttachReject { cause, esm_container })
        }
        EmmMessageType::DetachRequest => {
            let first = get_u8(buf)?;
            match link {
                Link::Uplink => EmmMessage::DetachRequestUe(DetachRequestUe {
                    detach_type: DetachType::decode(first & 0x0f),
                    ksi: KeySetIdentifier::decode(first >> 4),
                    identity: MobileIdentity::decode(buf)?,
                }),
                Link::Downlink => {
                    let mut cause = None;
                    while buf.has_remaining() {
                        match buf.get_u8() {
                            IEI_EMM_CAUSE => cause = Some(EmmCause::from_u8(get_u8(buf)?)),
                            iei => skip_ie(iei, buf)?,
                        }
                    }
                    EmmMessage::DetachRequestNetwork(DetachRequestNetwork {
                        detach_type: DetachType::decode(first & 0x0f),
                        cause,
                    })
                }
            }
        }
        EmmMessageType::DetachAccept => EmmMessage::DetachAccept,
        EmmMessageType::TrackingAreaUpdateRequest => {
            let first = get_u8(buf)?;
            let mut request = TrackingAreaUpdateRequest {
                update_type: EpsUpdateType::decode(first)?,
                active: first & 0x08 != 0,
                ksi: KeySetIdentifier::decode(first >> 4),
                old_guti: MobileIdentity::decode(buf)?,
                ue_network_capability: None,
            };
            while buf.has_remaining() {
                match buf.get_u8() {
                    IEI_UE_NETWORK_CAPABILITY => {
                        request.ue_network_capability = Some(UeNetworkCapability::decode(buf)?)
                    }
                    iei => skip_ie(iei, buf)?,
                }
            }
            EmmMessage::TrackingAreaUpdateRequest(request)
        }
        EmmMessageType::TrackingAreaUpdateAccept => {
            let mut accept = TrackingAreaUpdateAccept {
                result: EpsUpdateResult::decode(get_u8(buf)?),
                ..Default::default()
            };
            while buf.has_remaining() {
                match buf.get_u8() {
                    IEI_T3412_VALUE => accept.t3412 = Some(get_u8(buf)?),
                    IEI_GUTI => accept.guti = Some(decode_guti(buf)?),
                    IEI_TAI_LIST => accept.tai_list = Some(get_lv(buf)?),
                    iei => skip_ie(iei, buf)?,
                }
            }
            EmmMessage::TrackingAreaUpdateAccept(accept)
        }
        EmmMessageType::TrackingAreaUpdateComplete => EmmMessage::TrackingAreaUpdateComplete,
        EmmMessageType::TrackingAreaUpdateReject => {
            EmmMessage::TrackingAreaUpdateReject(EmmCause::from_u8(get_u8(buf)?))
        }
        EmmMessageType::ServiceReject => EmmMessage::ServiceReject(EmmCause::from_u8(get_u8(buf)?)),
        EmmMessageType::AuthenticationRequest => {
            let ksi = KeySetIdentifier::decode(get_u8(buf)? & 0x0f);
            let rand = get_array::<16>(buf)?;
            let autn = lv_array::<16>(buf)?;
            EmmMessage::AuthenticationRequest(AuthenticationRequest { ksi, rand, autn })
        }
        EmmMessageType::AuthenticationResponse => {
            let res = get_lv(buf)?;
            if !(4..=16).contains(&res.len()) {
                return Err(NasError::InvalidIeLength {
                    expected: 16,
                    actual: res.len(),
                });
            }
            EmmMessage::AuthenticationResponse(AuthenticationResponse { res })
        }
        EmmMessageType::AuthenticationReject => EmmMessage::AuthenticationReject,
        EmmMessageType::AuthenticationFailure => {
            let cause = EmmCause::from_u8(get_u8(buf)?);
            let mut auts = None;
            while buf.has_remaining() {
                match buf.get_u8() {
                    IEI_AUTS => auts = Some(lv_array::<AUTS_LEN>(buf)?),
                    iei => skip_ie(iei, buf)?,
                }
            }
            EmmMessage::AuthenticationFailure(AuthenticationFailure { cause, auts })
        }
        EmmMessageType::IdentityRequest => EmmMessage::IdentityRequest(IdentityType::decode(get_u8(buf)?)?),
        EmmMessageType::IdentityResponse => EmmMessage::IdentityResponse(MobileIdentity::decode(buf)?),
        EmmMessageType::SecurityModeCommand => {
            let algorithms = SecurityAlgorithms::decode(get_u8(buf)?);
            let ksi = KeySetIdentifier::decode(get_u8(buf)? & 0x0f);
            let replayed_capability = UeNetworkCapability::decode(buf)?;
            EmmMessage::SecurityModeCommand(SecurityModeCommand {
                algorithms,
                ksi,
                replayed_capability,
            })
        }
        EmmMessageType::SecurityModeComplete => EmmMessage::SecurityModeComplete,
        EmmMessageType::SecurityModeReject => {
            EmmMessage::SecurityModeReject(EmmCause::from_u8(get_u8(buf)?))
        }
        EmmMessageType::EmmStatus => EmmMessage::EmmStatus(EmmCause::from_u8(get_u8(buf)?)),
    };

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guti() -> Guti {
        Guti {
            plmn_id: PlmnId::new("001", "01").unwrap(),
            mme_gid: 2,
            mme_code: 1,
            m_tmsi: 0x1234_5678,
        }
    }

    fn roundtrip(msg: EmmMessage, link: Link) -> EmmMessage {
        let mut bytes = build_emm_message(&msg).unwrap();
        parse_emm_message(&mut bytes, link).unwrap()
    }

    #[test]
    fn test_attach_request_layout() {
        let msg = EmmMessage::AttachRequest(AttachRequest {
            attach_type: EpsAttachType::EpsAttach,
            ksi: KeySetIdentifier::none(),
            identity: MobileIdentity::Guti(guti()),
            ue_network_capability: UeNetworkCapability::new(0xe0, 0xe0),
            esm_container: Bytes::from_static(&[0x02, 0x01, 0xd0, 0x11]),
        });
        let bytes = build_emm_message(&msg).unwrap();
        assert_eq!(&bytes[..3], &[0x07, 0x41, 0x71]);
        assert_eq!(roundtrip(msg.clone(), Link::Uplink), msg);
    }

    #[test]
    fn test_detach_request_by_direction() {
        let ue = EmmMessage::DetachRequestUe(DetachRequestUe {
            detach_type: DetachType { switch_off: true, value: 1 },
            ksi: KeySetIdentifier::native(2),
            identity: MobileIdentity::Guti(guti()),
        });
        assert_eq!(roundtrip(ue.clone(), Link::Uplink), ue);

        let network = EmmMessage::DetachRequestNetwork(DetachRequestNetwork {
            detach_type: DetachType {
                switch_off: false,
                value: DetachType::REATTACH_NOT_REQUIRED,
            },
            cause: Some(EmmCause::ImplicitlyDetached),
        });
        assert_eq!(roundtrip(network.clone(), Link::Downlink), network);
    }

    #[test]
    fn test_tau_accept_optional_ies() {
        let msg = EmmMessage::TrackingAreaUpdateAccept(TrackingAreaUpdateAccept {
            result: EpsUpdateResult::CombinedTaLaUpdated,
            t3412: Some(0x21),
            guti: Some(guti()),
            tai_list: None,
        });
        assert_eq!(roundtrip(msg.clone(), Link::Downlink), msg);
    }

    #[test]
    fn test_auth_failure_with_auts() {
        let msg = EmmMessage::AuthenticationFailure(AuthenticationFailure {
            cause: EmmCause::SynchFailure,
            auts: Some([0xab; AUTS_LEN]),
        });
        assert_eq!(roundtrip(msg.clone(), Link::Uplink), msg);
    }

    #[test]
    fn test_unknown_optional_ie_skipped() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[0x07, 0x5c, 21]);
        bytes.put_slice(&[0x77, 0x02, 0xaa, 0xbb]); // unknown TLV
        bytes.put_u8(0xa1); // unknown type 1
        let msg = parse_emm_message(&mut bytes.freeze(), Link::Uplink).unwrap();
        assert_eq!(
            msg,
            EmmMessage::AuthenticationFailure(AuthenticationFailure {
                cause: EmmCause::SynchFailure,
                auts: None,
            })
        );
    }

    #[test]
    fn test_rejects_wrong_discriminator() {
        let mut bytes = Bytes::from_static(&[0x02, 0xc1]);
        assert_eq!(
            parse_emm_message(&mut bytes, Link::Uplink),
            Err(NasError::InvalidProtocolDiscriminator(2))
        );
    }

    #[test]
    fn test_rejects_truncated_auth_response() {
        let mut bytes = Bytes::from_static(&[0x07, 0x53, 0x08, 0x01]);
        assert!(matches!(
            parse_emm_message(&mut bytes, Link::Uplink),
            Err(NasError::BufferTooShort { .. })
        ));
    }
}
