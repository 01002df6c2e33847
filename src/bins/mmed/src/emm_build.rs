//! EMM message building
//!
//! Downlink EMM messages the MME originates. Protection is applied
//! separately, see [`crate::nas_security`].

use bytes::{BufMut, Bytes, BytesMut};

use mme_nas::message::{
    AttachAccept, AttachReject, AuthenticationRequest, DetachRequestNetwork, SecurityModeCommand,
    TrackingAreaUpdateAccept,
};
use mme_nas::types::{DetachType, EpsAttachResult, EpsUpdateResult, IdentityType, SecurityAlgorithms};
use mme_nas::{EmmCause, EmmMessage, Guti, KeySetIdentifier, PlmnId, UeNetworkCapability};

use crate::config::MmeConfig;
use crate::security::{AuthVector, SecurityContext};

/// TAI list with the single served TAI (TS 24.301 clause 9.9.3.33, type 0)
pub fn served_tai_list(plmn_id: &PlmnId, tac: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    // type of list 0, one element
    buf.put_u8(0x00);
    plmn_id.encode(&mut buf);
    buf.put_u16(tac);
    buf.freeze()
}

pub fn identity_request() -> EmmMessage {
    EmmMessage::IdentityRequest(IdentityType::Imsi)
}

pub fn authentication_request(ksi: KeySetIdentifier, vector: &AuthVector) -> EmmMessage {
    EmmMessage::AuthenticationRequest(AuthenticationRequest {
        ksi,
        rand: vector.rand,
        autn: vector.autn,
    })
}

pub fn authentication_reject() -> EmmMessage {
    EmmMessage::AuthenticationReject
}

/// Security Mode Command for the selected algorithms, replaying the UE's
/// capability
pub fn security_mode_command(sc: &SecurityContext, capability: &UeNetworkCapability) -> EmmMessage {
    EmmMessage::SecurityModeCommand(SecurityModeCommand {
        algorithms: SecurityAlgorithms {
            ciphering: sc.ciphering() as u8,
            integrity: sc.integrity() as u8,
        },
        ksi: sc.ksi(),
        replayed_capability: capability.clone(),
    })
}

pub fn attach_accept(
    config: &MmeConfig,
    plmn_id: &PlmnId,
    guti: Guti,
    esm_container: Bytes,
) -> EmmMessage {
    EmmMessage::AttachAccept(AttachAccept {
        result: EpsAttachResult::EpsOnly,
        t3412: config.t3412,
        tai_list: served_tai_list(plmn_id, config.gummei.tac),
        esm_container,
        guti: Some(guti),
    })
}

pub fn attach_reject(cause: EmmCause, esm_container: Option<Bytes>) -> EmmMessage {
    EmmMessage::AttachReject(AttachReject { cause, esm_container })
}

pub fn tracking_area_update_accept(
    config: &MmeConfig,
    plmn_id: &PlmnId,
    result: EpsUpdateResult,
    guti: Option<Guti>,
) -> EmmMessage {
    EmmMessage::TrackingAreaUpdateAccept(TrackingAreaUpdateAccept {
        result,
        t3412: Some(config.t3412),
        guti,
        tai_list: Some(served_tai_list(plmn_id, config.gummei.tac)),
    })
}

pub fn tracking_area_update_reject(cause: EmmCause) -> EmmMessage {
    EmmMessage::TrackingAreaUpdateReject(cause)
}

pub fn service_reject(cause: EmmCause) -> EmmMessage {
    EmmMessage::ServiceReject(cause)
}

pub fn detach_accept() -> EmmMessage {
    EmmMessage::DetachAccept
}

/// Network-initiated Detach Request
pub fn detach_request(reattach: bool, cause: Option<EmmCause>) -> EmmMessage {
    EmmMessage::DetachRequestNetwork(DetachRequestNetwork {
        detach_type: DetachType {
            switch_off: false,
            value: if reattach {
                DetachType::REATTACH_REQUIRED
            } else {
                DetachType::REATTACH_NOT_REQUIRED
            },
        },
        cause,
    })
}

pub fn emm_status(cause: EmmCause) -> EmmMessage {
    EmmMessage::EmmStatus(cause)
}
