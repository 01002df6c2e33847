//! Collaborators of the EMM layer
//!
//! The EMM core talks to three peers: the lower layer carrying NAS PDUs
//! (S1AP towards the eNB), the identity service (S6a towards the HSS) and
//! session management (ESM). Requests go out through the traits below;
//! replies come back as [`Inbound`] events.
//!
//! [`ChannelPeer`] implements all three traits by forwarding [`Outbound`]
//! requests over a tokio channel, which is how the daemon wires them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use mme_crypt::SHA256_DIGEST_SIZE;
use mme_nas::message::AUTS_LEN;

use crate::context::{SessionId, UeId};
use crate::security::AuthVector;

// ============================================================================
// Collaborator traits
// ============================================================================

/// Lower-layer transport of NAS PDUs
pub trait LowerLayer {
    fn send(&mut self, session: SessionId, pdu: Bytes);
    /// Release the connection
    fn release(&mut self, session: SessionId);
    /// Install access-stratum keys for the connection
    fn set_as_security(&mut self, session: SessionId, kenb: [u8; SHA256_DIGEST_SIZE], ncc: u8);
}

/// Resynchronisation data from an Authentication Failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resync {
    pub rand: [u8; 16],
    pub auts: [u8; AUTS_LEN],
}

/// Subscriber identity and authentication service
pub trait IdentityService {
    fn get_auth_information(&mut self, ue: UeId, imsi: &str, resync: Option<Resync>);
    fn update_location(&mut self, ue: UeId, imsi: &str);
}

/// Session management
pub trait SessionManagement {
    /// Forward an ESM payload
    fn process_message(&mut self, ue: UeId, payload: Bytes);
    /// EPS bearer identities of the subscriber's active default bearers
    fn active_sessions(&self, ue: UeId) -> Vec<u8>;
    /// Tear down all sessions; completion is reported with
    /// [`EsmEvent::DetachComplete`]
    fn detach(&mut self, ue: UeId);
    /// Drop session state without signalling
    fn release_context(&mut self, ue: UeId);
}

/// The collaborators, boxed
pub struct Peers {
    pub lower: Box<dyn LowerLayer + Send>,
    pub hss: Box<dyn IdentityService + Send>,
    pub esm: Box<dyn SessionManagement + Send>,
}

impl Peers {
    pub fn new(
        lower: Box<dyn LowerLayer + Send>,
        hss: Box<dyn IdentityService + Send>,
        esm: Box<dyn SessionManagement + Send>,
    ) -> Self {
        Self { lower, hss, esm }
    }

    /// Peers that forward every request to `tx`. Active sessions are read
    /// from the returned registry, which the session side keeps current.
    pub fn channel(tx: mpsc::UnboundedSender<Outbound>) -> (Self, SessionRegistry) {
        let registry = SessionRegistry::default();
        let peer = ChannelPeer::new(tx, registry.clone());
        (
            Self::new(Box::new(peer.clone()), Box::new(peer.clone()), Box::new(peer)),
            registry,
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// Identity service failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HssError {
    #[error("Unknown subscription")]
    UserUnknown,
    #[error("Identity service unreachable")]
    Unreachable,
    #[error("Identity service error: {0}")]
    Other(String),
}

impl HssError {
    pub fn is_unknown_subscription(&self) -> bool {
        matches!(self, HssError::UserUnknown)
    }
}

/// Replies from session management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsmEvent {
    /// Default bearer ready; the container goes into the Attach Accept
    BearerReady { container: Bytes },
    /// Bearer setup failed; the container, if any, goes into the Attach Reject
    Failure { container: Option<Bytes> },
    /// All sessions torn down after a detach request
    DetachComplete,
}

/// Events delivered to the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Uplink NAS PDU on a connection
    Nas { session: SessionId, pdu: Bytes },
    AuthInfo {
        ue: UeId,
        result: Result<Vec<AuthVector>, HssError>,
    },
    UpdateLocation {
        ue: UeId,
        result: Result<(), HssError>,
    },
    Esm { ue: UeId, event: EsmEvent },
    ConnectionReleased { session: SessionId },
    LowerLayerError { session: SessionId },
}

/// Requests issued by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Nas { session: SessionId, pdu: Bytes },
    Release { session: SessionId },
    AsSecurity {
        session: SessionId,
        kenb: [u8; SHA256_DIGEST_SIZE],
        ncc: u8,
    },
    AuthInfoRequest {
        ue: UeId,
        imsi: String,
        resync: Option<Resync>,
    },
    UpdateLocationRequest { ue: UeId, imsi: String },
    EsmMessage { ue: UeId, payload: Bytes },
    EsmDetach { ue: UeId },
    EsmReleaseContext { ue: UeId },
}

// ============================================================================
// Channel peer
// ============================================================================

/// Active default bearers per subscriber, written by the session side
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<UeId, Vec<u8>>>>,
}

impl SessionRegistry {
    pub fn set(&self, ue: UeId, bearers: Vec<u8>) {
        if let Ok(mut map) = self.inner.write() {
            if bearers.is_empty() {
                map.remove(&ue);
            } else {
                map.insert(ue, bearers);
            }
        }
    }

    pub fn clear(&self, ue: UeId) {
        self.set(ue, Vec::new());
    }

    pub fn get(&self, ue: UeId) -> Vec<u8> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(&ue).cloned())
            .unwrap_or_default()
    }
}

/// Forwards collaborator requests over a channel
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<Outbound>,
    sessions: SessionRegistry,
}

impl ChannelPeer {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>, sessions: SessionRegistry) -> Self {
        Self { tx, sessions }
    }

    fn emit(&self, request: Outbound) {
        if let Err(e) = self.tx.send(request) {
            log::error!("Outbound channel closed, dropping {:?}", e.0);
        }
    }
}

impl LowerLayer for ChannelPeer {
    fn send(&mut self, session: SessionId, pdu: Bytes) {
        self.emit(Outbound::Nas { session, pdu });
    }

    fn release(&mut self, session: SessionId) {
        self.emit(Outbound::Release { session });
    }

    fn set_as_security(&mut self, session: SessionId, kenb: [u8; SHA256_DIGEST_SIZE], ncc: u8) {
        self.emit(Outbound::AsSecurity { session, kenb, ncc });
    }
}

impl IdentityService for ChannelPeer {
    fn get_auth_information(&mut self, ue: UeId, imsi: &str, resync: Option<Resync>) {
        self.emit(Outbound::AuthInfoRequest {
            ue,
            imsi: imsi.to_string(),
            resync,
        });
    }

    fn update_location(&mut self, ue: UeId, imsi: &str) {
        self.emit(Outbound::UpdateLocationRequest {
            ue,
            imsi: imsi.to_string(),
        });
    }
}

impl SessionManagement for ChannelPeer {
    fn process_message(&mut self, ue: UeId, payload: Bytes) {
        self.emit(Outbound::EsmMessage { ue, payload });
    }

    fn active_sessions(&self, ue: UeId) -> Vec<u8> {
        self.sessions.get(ue)
    }

    fn detach(&mut self, ue: UeId) {
        self.emit(Outbound::EsmDetach { ue });
    }

    fn release_context(&mut self, ue: UeId) {
        self.sessions.clear(ue);
        self.emit(Outbound::EsmReleaseContext { ue });
    }
}
