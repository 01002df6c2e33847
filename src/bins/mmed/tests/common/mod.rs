//! Common test utilities
//!
//! A [`Harness`] owns an MME wired to channel peers and a manual clock.
//! A [`Ue`] plays the UE side of NAS: it builds uplink messages, protects
//! them with its own copy of the keys and decodes what the MME sends.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use mme_crypt::{
    kdf_nas_eps, nas_encrypt, nas_mac, CipheringAlgorithm, Direction, IntegrityAlgorithm, NasKeyType,
    KEY_LEN, SHA256_DIGEST_SIZE,
};
use mme_nas::message::{
    AttachComplete, AttachRequest, AuthenticationResponse, DetachRequestUe, TrackingAreaUpdateRequest,
};
use mme_nas::security::{build_protected_pdu, build_service_request, service_request_header};
use mme_nas::types::{DetachType, EpsAttachType, EpsUpdateType};
use mme_nas::{
    build_emm_message, parse_emm_message, split_pdu, EmmMessage, Guti, KeySetIdentifier, Link,
    MobileIdentity, NasPdu, SecurityHeaderType, UeNetworkCapability,
};

use mmed::{AuthVector, EmmState, EsmEvent, Inbound, Mme, MmeConfig, Outbound, Peers, SessionId, SessionRegistry, UeId};

pub const BEARER: u8 = 0;

/// ESM payload a UE piggybacks on its Attach Request
pub const PDN_CONNECTIVITY: &[u8] = &[0x02, 0x01, 0xd0, 0x11, 0x27, 0x01, 0x80];
/// Default bearer activation the session side hands back
pub const BEARER_CONTEXT_REQUEST: &[u8] = &[0x52, 0x01, 0xc1, 0x01, 0x09];
/// Default bearer acceptance inside the Attach Complete
pub const BEARER_CONTEXT_ACCEPT: &[u8] = &[0x52, 0x01, 0xc2];

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub mme: Mme,
    pub sessions: SessionRegistry,
    rx: mpsc::UnboundedReceiver<Outbound>,
    now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MmeConfig::default())
    }

    pub fn with_config(config: MmeConfig) -> Self {
        let _ = env_logger::try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        let (peers, sessions) = Peers::channel(tx);
        let now = Instant::now();
        let mme = Mme::with_clock(config, peers, now).expect("valid config");
        Self { mme, sessions, rx, now }
    }

    /// Everything the MME sent since the last drain
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Deliver an uplink PDU from `ue` and collect the MME's output
    pub fn uplink(&mut self, ue: &Ue, pdu: Bytes) -> Vec<Outbound> {
        self.mme.process_initial_message(ue.session, pdu, None);
        self.mme.run_until_idle();
        self.drain()
    }

    /// Deliver a collaborator event and collect the MME's output
    pub fn deliver(&mut self, inbound: Inbound) -> Vec<Outbound> {
        self.mme.deliver(inbound);
        self.mme.run_until_idle();
        self.drain()
    }

    /// Move the clock forward, firing due timers
    pub fn advance(&mut self, by: Duration) -> Vec<Outbound> {
        self.now += by;
        self.mme.tick(self.now);
        self.drain()
    }

    pub fn ue_id(&self, ue: &Ue) -> UeId {
        self.mme.find_by_imsi(&ue.imsi).expect("UE context")
    }

    pub fn state(&self, ue: &Ue) -> Option<EmmState> {
        self.mme.find_by_imsi(&ue.imsi).and_then(|id| self.mme.state(id))
    }

    /// Run a complete attach for `ue` and return its context id
    pub fn attach(&mut self, ue: &mut Ue) -> UeId {
        let out = self.uplink(ue, ue.attach_request());
        let id = self.ue_id(ue);
        assert!(out.iter().any(|o| matches!(o, Outbound::AuthInfoRequest { .. })));

        let out = self.deliver(Inbound::AuthInfo {
            ue: id,
            result: Ok(vec![ue.vector.clone()]),
        });
        match ue.receive_one(&out) {
            EmmMessage::AuthenticationRequest(req) => assert_eq!(req.rand, ue.vector.rand),
            other => panic!("expected Authentication Request, got {:?}", other),
        }

        let out = self.uplink(ue, ue.authentication_response());
        assert!(matches!(ue.receive_one(&out), EmmMessage::SecurityModeCommand(_)));
        assert!(ue.has_keys());

        let smc_complete = ue.protect(
            SecurityHeaderType::IntegrityProtectedAndCipheredWithNewContext,
            &EmmMessage::SecurityModeComplete,
        );
        let out = self.uplink(ue, smc_complete);
        assert!(out.iter().any(|o| matches!(o, Outbound::UpdateLocationRequest { .. })));
        assert!(out.iter().any(|o| matches!(o, Outbound::EsmMessage { .. })));
        assert_eq!(self.mme.state(id), Some(EmmState::SpecificProcedureInitiated));

        self.sessions.set(id, vec![5]);
        let mut out = self.deliver(Inbound::UpdateLocation { ue: id, result: Ok(()) });
        out.extend(self.deliver(Inbound::Esm {
            ue: id,
            event: EsmEvent::BearerReady {
                container: Bytes::from_static(BEARER_CONTEXT_REQUEST),
            },
        }));
        match ue.receive_one(&out) {
            EmmMessage::AttachAccept(accept) => {
                assert_eq!(accept.esm_container.as_ref(), BEARER_CONTEXT_REQUEST);
                ue.guti = accept.guti;
            }
            other => panic!("expected Attach Accept, got {:?}", other),
        }
        assert!(out.iter().any(|o| matches!(o, Outbound::AsSecurity { .. })));

        let complete = ue.protect(
            SecurityHeaderType::IntegrityProtectedAndCiphered,
            &EmmMessage::AttachComplete(AttachComplete {
                esm_container: Bytes::from_static(BEARER_CONTEXT_ACCEPT),
            }),
        );
        self.uplink(ue, complete);
        assert_eq!(self.mme.state(id), Some(EmmState::Registered));
        id
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// NAS PDUs sent on `session`
pub fn nas_pdus(out: &[Outbound], session: SessionId) -> Vec<Bytes> {
    out.iter()
        .filter_map(|o| match o {
            Outbound::Nas { session: s, pdu } if *s == session => Some(pdu.clone()),
            _ => None,
        })
        .collect()
}

pub fn released(out: &[Outbound], session: SessionId) -> bool {
    out.iter()
        .any(|o| matches!(o, Outbound::Release { session: s } if *s == session))
}

// ============================================================================
// UE simulator
// ============================================================================

struct UeKeys {
    ksi: u8,
    integrity: IntegrityAlgorithm,
    ciphering: CipheringAlgorithm,
    knas_int: [u8; KEY_LEN],
    knas_enc: [u8; KEY_LEN],
}

pub struct Ue {
    pub imsi: String,
    pub session: SessionId,
    pub capability: UeNetworkCapability,
    pub vector: AuthVector,
    pub guti: Option<Guti>,
    pub ul_count: u32,
    keys: Option<UeKeys>,
}

impl Ue {
    /// A UE supporting EEA0/EEA2 and EIA1/EIA2
    pub fn new(imsi: &str, session: u64) -> Self {
        let seed = imsi.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        Self {
            imsi: imsi.to_string(),
            session: SessionId(session),
            capability: UeNetworkCapability::new(0xa0, 0x60),
            vector: AuthVector {
                rand: [seed; 16],
                autn: [seed ^ 0x5a; 16],
                xres: Bytes::from(vec![seed ^ 0xa5; 8]),
                kasme: [seed.wrapping_add(1); SHA256_DIGEST_SIZE],
            },
            guti: None,
            ul_count: 0,
            keys: None,
        }
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn ksi(&self) -> KeySetIdentifier {
        match &self.keys {
            Some(keys) => KeySetIdentifier::native(keys.ksi),
            None => KeySetIdentifier::none(),
        }
    }

    /// Forget the NAS security context, as after a detach
    pub fn forget_keys(&mut self) {
        self.keys = None;
        self.ul_count = 0;
    }

    // ------------------------------------------------------------------------
    // Uplink messages
    // ------------------------------------------------------------------------

    pub fn attach_request(&self) -> Bytes {
        self.attach_request_with(MobileIdentity::Imsi(self.imsi.clone()))
    }

    pub fn attach_request_with(&self, identity: MobileIdentity) -> Bytes {
        plain(&EmmMessage::AttachRequest(AttachRequest {
            attach_type: EpsAttachType::EpsAttach,
            ksi: KeySetIdentifier::none(),
            identity,
            ue_network_capability: self.capability.clone(),
            esm_container: Bytes::from_static(PDN_CONNECTIVITY),
        }))
    }

    pub fn authentication_response(&self) -> Bytes {
        plain(&EmmMessage::AuthenticationResponse(AuthenticationResponse {
            res: self.vector.xres.clone(),
        }))
    }

    pub fn detach_request(&mut self, switch_off: bool) -> Bytes {
        let identity = match self.guti {
            Some(guti) => MobileIdentity::Guti(guti),
            None => MobileIdentity::Imsi(self.imsi.clone()),
        };
        let message = EmmMessage::DetachRequestUe(DetachRequestUe {
            detach_type: DetachType { switch_off, value: 1 },
            ksi: self.ksi(),
            identity,
        });
        self.protect(SecurityHeaderType::IntegrityProtected, &message)
    }

    pub fn tau_request(&mut self, update_type: EpsUpdateType, active: bool) -> Bytes {
        let guti = self.guti.expect("registered UE has a GUTI");
        let message = EmmMessage::TrackingAreaUpdateRequest(TrackingAreaUpdateRequest {
            update_type,
            active,
            ksi: self.ksi(),
            old_guti: MobileIdentity::Guti(guti),
            ue_network_capability: Some(self.capability.clone()),
        });
        self.protect(SecurityHeaderType::IntegrityProtected, &message)
    }

    /// Service Request carrying the next uplink COUNT's short MAC
    pub fn service_request(&mut self) -> Bytes {
        let keys = self.keys.as_ref().expect("service request needs keys");
        let seq = (self.ul_count & 0x1f) as u8;
        let header = service_request_header(keys.ksi, seq);
        let mac = nas_mac(
            keys.integrity,
            &keys.knas_int,
            self.ul_count,
            BEARER,
            Direction::Uplink,
            &header,
        )
        .unwrap();
        self.ul_count += 1;
        build_service_request(keys.ksi, seq, [mac[2], mac[3]])
    }

    /// Integrity protect, and cipher if the header type says so
    pub fn protect(&mut self, header_type: SecurityHeaderType, message: &EmmMessage) -> Bytes {
        let keys = self.keys.as_ref().expect("protection needs keys");
        let count = self.ul_count;
        self.ul_count += 1;

        let mut covered = vec![(count & 0xff) as u8];
        covered.extend_from_slice(&plain(message));
        if header_type.is_ciphered() {
            nas_encrypt(
                keys.ciphering,
                &keys.knas_enc,
                count,
                BEARER,
                Direction::Uplink,
                &mut covered[1..],
            )
            .unwrap();
        }
        let mac = nas_mac(keys.integrity, &keys.knas_int, count, BEARER, Direction::Uplink, &covered).unwrap();
        build_protected_pdu(header_type, mac, &covered)
    }

    // ------------------------------------------------------------------------
    // Downlink
    // ------------------------------------------------------------------------

    /// Decode every NAS PDU sent to this UE
    pub fn receive(&mut self, out: &[Outbound]) -> Vec<EmmMessage> {
        nas_pdus(out, self.session)
            .iter()
            .map(|pdu| self.decode(pdu))
            .collect()
    }

    /// Decode the only NAS PDU sent to this UE
    pub fn receive_one(&mut self, out: &[Outbound]) -> EmmMessage {
        let mut messages = self.receive(out);
        assert_eq!(messages.len(), 1, "expected one NAS message, got {:?}", messages);
        messages.remove(0)
    }

    /// Decode a downlink PDU, checking its MAC. A Security Mode Command
    /// installs the keys it names first.
    pub fn decode(&mut self, raw: &Bytes) -> EmmMessage {
        let pdu = match split_pdu(raw).unwrap() {
            NasPdu::Plain(mut buf) => return parse_emm_message(&mut buf, Link::Downlink).unwrap(),
            NasPdu::Protected(pdu) => pdu,
            NasPdu::ServiceRequest(_) => panic!("service request on the downlink"),
        };
        let count = pdu.seq as u32;

        if pdu.header_type.is_new_context() {
            let mut inner = pdu.inner();
            if let EmmMessage::SecurityModeCommand(smc) = parse_emm_message(&mut inner, Link::Downlink).unwrap() {
                assert_eq!(smc.replayed_capability, self.capability);
                self.install_keys(smc.ksi.value, smc.algorithms.integrity, smc.algorithms.ciphering);
            }
        }

        let keys = self.keys.as_ref().expect("protected downlink needs keys");
        let mac = nas_mac(keys.integrity, &keys.knas_int, count, BEARER, Direction::Downlink, &pdu.covered).unwrap();
        assert_eq!(mac, pdu.mac, "downlink MAC mismatch");

        let mut body = pdu.inner().to_vec();
        if pdu.header_type.is_ciphered() {
            nas_encrypt(keys.ciphering, &keys.knas_enc, count, BEARER, Direction::Downlink, &mut body).unwrap();
        }
        parse_emm_message(&mut Bytes::from(body), Link::Downlink).unwrap()
    }

    fn install_keys(&mut self, ksi: u8, integrity: u8, ciphering: u8) {
        let kasme = self.vector.kasme;
        self.keys = Some(UeKeys {
            ksi,
            integrity: IntegrityAlgorithm::from_u8(integrity).unwrap(),
            ciphering: CipheringAlgorithm::from_u8(ciphering).unwrap(),
            knas_int: kdf_nas_eps(NasKeyType::Integrity, integrity, &kasme),
            knas_enc: kdf_nas_eps(NasKeyType::Encryption, ciphering, &kasme),
        });
        self.ul_count = 0;
    }
}

pub fn plain(message: &EmmMessage) -> Bytes {
    build_emm_message(message).unwrap()
}
