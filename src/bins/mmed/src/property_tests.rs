//! Property-based tests for authentication and uplink replay protection

use bytes::Bytes;
use proptest::prelude::*;
use tokio::sync::mpsc;

use mme_crypt::CipheringAlgorithm;
use mme_nas::message::{AttachComplete, AttachRequest, AuthenticationResponse};
use mme_nas::types::EpsAttachType;
use mme_nas::{build_emm_message, EmmMessage, KeySetIdentifier, MobileIdentity, SecurityHeaderType, UeNetworkCapability};

use crate::config::MmeConfig;
use crate::context::SessionId;
use crate::emm_sm::EmmState;
use crate::mme::Mme;
use crate::nas_security::tests::{context, uplink};
use crate::nas_security::{nas_eps_security_decode, Integrity, UplinkPdu};
use crate::peers::{Inbound, Outbound, Peers};
use crate::security::{estimate_count, AuthVector, NAS_COUNT_MASK};

const SESSION: SessionId = SessionId(7);

fn vector() -> AuthVector {
    AuthVector {
        rand: [0x11; 16],
        autn: [0x22; 16],
        xres: Bytes::from_static(&[0x33; 8]),
        kasme: [0x44; 32],
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Security header type of every NAS PDU sent
fn nas_headers(out: &[Outbound]) -> Vec<u8> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Nas { pdu, .. } => pdu.first().map(|b| b >> 4),
            _ => None,
        })
        .collect()
}

/// An MME with one UE waiting for its Authentication Response
fn challenged() -> (Mme, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (peers, _) = Peers::channel(tx);
    let mut mme = Mme::new(MmeConfig::default(), peers).unwrap();

    let attach = EmmMessage::AttachRequest(AttachRequest {
        attach_type: EpsAttachType::EpsAttach,
        ksi: KeySetIdentifier::none(),
        identity: MobileIdentity::Imsi("001010000000001".to_string()),
        ue_network_capability: UeNetworkCapability::new(0xa0, 0x60),
        esm_container: Bytes::from_static(&[0x02, 0x01, 0xd0, 0x11]),
    });
    mme.process_initial_message(SESSION, build_emm_message(&attach).unwrap(), None);
    mme.run_until_idle();
    let ue = mme.find_by_session(SESSION).unwrap();
    drain(&mut rx);

    mme.deliver(Inbound::AuthInfo {
        ue,
        result: Ok(vec![vector()]),
    });
    mme.run_until_idle();
    assert_eq!(nas_headers(&drain(&mut rx)), vec![0]);
    (mme, rx)
}

fn authentication_response(res: Vec<u8>) -> Bytes {
    let msg = EmmMessage::AuthenticationResponse(AuthenticationResponse { res: Bytes::from(res) });
    build_emm_message(&msg).unwrap()
}

fn attach_complete() -> EmmMessage {
    EmmMessage::AttachComplete(AttachComplete {
        esm_container: Bytes::from_static(&[0x52, 0x01, 0xc2]),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A RES that differs from XRES never reaches security mode control:
    /// the UE gets an Authentication Reject and ends DE_REGISTERED.
    #[test]
    fn prop_wrong_res_rejected(res in proptest::collection::vec(any::<u8>(), 4..16)) {
        prop_assume!(res.as_slice() != vector().xres.as_ref());
        let (mut mme, mut rx) = challenged();
        let ue = mme.find_by_session(SESSION).unwrap();

        mme.process_message(SESSION, authentication_response(res));
        mme.run_until_idle();

        let out = drain(&mut rx);
        let headers = nas_headers(&out);
        prop_assert!(!headers.contains(&(SecurityHeaderType::IntegrityProtectedWithNewContext as u8)));
        let released = out.iter().any(|o| matches!(o, Outbound::Release { .. }));
        prop_assert!(released);
        prop_assert_eq!(mme.state(ue), Some(EmmState::Deregistered));
        prop_assert!(mme.security(ue).is_none());
    }

    /// A byte-exact RES always leads to a Security Mode Command.
    #[test]
    fn prop_matching_res_accepted(_seed in any::<u8>()) {
        let (mut mme, mut rx) = challenged();
        let ue = mme.find_by_session(SESSION).unwrap();

        mme.process_message(SESSION, authentication_response(vector().xres.to_vec()));
        mme.run_until_idle();

        let headers = nas_headers(&drain(&mut rx));
        prop_assert_eq!(headers, vec![SecurityHeaderType::IntegrityProtectedWithNewContext as u8]);
        prop_assert_eq!(mme.state(ue), Some(EmmState::CommonProcedureInitiated));
        prop_assert!(mme.security(ue).map(|sc| !sc.is_valid()).unwrap_or(false));
    }

    /// Once a COUNT has been accepted, any PDU reusing it is never verified
    /// and leaves the uplink COUNT where it was.
    #[test]
    fn prop_replay_never_verified(steps in proptest::collection::vec(1u32..40, 1..12), pick in any::<prop::sample::Index>()) {
        // integrity only, so a replay still parses whatever COUNT it maps to
        let mut sc = context(CipheringAlgorithm::Eea0);
        let mut sent = Vec::new();
        let mut count = 0u32;
        for step in steps {
            let raw = uplink(&sc, count, SecurityHeaderType::IntegrityProtected, &attach_complete());
            match nas_eps_security_decode(Some(&mut sc), &raw).unwrap() {
                UplinkPdu::Message(up) => prop_assert_eq!(up.integrity, Integrity::Verified),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
            sent.push(raw);
            count += step;
        }

        let before = sc.ul_count();
        let replay = pick.get(&sent).clone();
        match nas_eps_security_decode(Some(&mut sc), &replay).unwrap() {
            UplinkPdu::Message(up) => {
                prop_assert_eq!(up.integrity, Integrity::Failed);
                prop_assert_eq!(up.count, None);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
        prop_assert_eq!(sc.ul_count(), before);
    }

    /// An accepted COUNT is never behind the next expected one and carries
    /// the sequence number it was estimated from.
    #[test]
    fn prop_estimate_count_monotonic(next in 0u32..=NAS_COUNT_MASK, seq in any::<u8>()) {
        if let Some(count) = estimate_count(next, seq as u32, 8) {
            prop_assert!(count >= next);
            prop_assert_eq!(count & 0xff, seq as u32);
            prop_assert!(count <= NAS_COUNT_MASK);
        }
    }
}
