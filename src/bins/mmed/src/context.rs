//! MME UE contexts
//!
//! One [`EmmContext`] per subscriber, indexed by IMSI, GUTI and lower-layer
//! session. Contexts are owned by the [`UeTable`]; processes refer to them
//! by [`UeId`] only.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use mme_core::{ProcessId, TimerHandle};
use mme_nas::types::{DetachType, EpsAttachType, EpsUpdateType};
use mme_nas::{Guti, PlmnId, UeNetworkCapability};

use crate::emm_sm::EmmState;
use crate::security::SecurityContext;

// ============================================================================
// Identifiers
// ============================================================================

/// Subscriber context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UeId(pub u64);

impl fmt::Display for UeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ue#{}", self.0)
    }
}

/// Lower-layer (S1) connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Per-subscriber EMM timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Network-initiated detach
    T3422,
    /// Attach Accept / TAU Accept with a new GUTI
    T3450,
    /// Authentication Request / Security Mode Command
    T3460,
    /// Identity Request
    T3470,
    MobileReachable,
    ImplicitDetach,
}

impl TimerKind {
    pub const COUNT: usize = 6;

    pub const ALL: [TimerKind; Self::COUNT] = [
        TimerKind::T3422,
        TimerKind::T3450,
        TimerKind::T3460,
        TimerKind::T3470,
        TimerKind::MobileReachable,
        TimerKind::ImplicitDetach,
    ];

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::T3422 => write!(f, "T3422"),
            TimerKind::T3450 => write!(f, "T3450"),
            TimerKind::T3460 => write!(f, "T3460"),
            TimerKind::T3470 => write!(f, "T3470"),
            TimerKind::MobileReachable => write!(f, "MOBILE_REACHABLE"),
            TimerKind::ImplicitDetach => write!(f, "IMPLICIT_DETACH"),
        }
    }
}

/// An armed timer and the PDU it retransmits
#[derive(Debug, Clone)]
pub struct ArmedTimer {
    pub handle: TimerHandle,
    pub pdu: Option<Bytes>,
}

/// The timers currently armed for a subscriber, one slot per kind
#[derive(Debug, Clone, Default)]
pub struct TimerTable {
    slots: [Option<ArmedTimer>; TimerKind::COUNT],
}

impl TimerTable {
    pub fn get(&self, kind: TimerKind) -> Option<&ArmedTimer> {
        self.slots[kind.index()].as_ref()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Store a timer, returning the one it replaces
    pub fn set(&mut self, kind: TimerKind, timer: ArmedTimer) -> Option<ArmedTimer> {
        self.slots[kind.index()].replace(timer)
    }

    pub fn take(&mut self, kind: TimerKind) -> Option<ArmedTimer> {
        self.slots[kind.index()].take()
    }

    /// Whether `handle` is the current timer of `kind`
    pub fn is_current(&self, kind: TimerKind, handle: TimerHandle) -> bool {
        self.get(kind).map(|t| t.handle == handle).unwrap_or(false)
    }

    pub fn take_all(&mut self) -> Vec<(TimerKind, ArmedTimer)> {
        TimerKind::ALL
            .iter()
            .filter_map(|kind| self.take(*kind).map(|t| (*kind, t)))
            .collect()
    }
}

// ============================================================================
// Procedure state
// ============================================================================

/// Specific procedure in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    Attach {
        attach_type: EpsAttachType,
        /// ESM payload held until security is active
        esm_container: Bytes,
    },
    TrackingAreaUpdate {
        update_type: EpsUpdateType,
        active: bool,
    },
}

/// Who started a detach, and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachProcedure {
    Ue { detach_type: DetachType },
    Network,
}

/// Progress of default bearer setup during attach
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerSetup {
    pub location_updated: bool,
    /// ESM container for the Attach Accept, once the bearer is ready
    pub esm_container: Option<Bytes>,
}

impl BearerSetup {
    pub fn is_complete(&self) -> bool {
        self.location_updated && self.esm_container.is_some()
    }
}

// ============================================================================
// EMM context
// ============================================================================

/// Mobility management context of one subscriber
#[derive(Debug)]
pub struct EmmContext {
    pub id: UeId,
    pub state: EmmState,
    /// Main process of this subscriber
    pub main: ProcessId,
    /// Process that currently receives this subscriber's signals
    pub active: ProcessId,

    pub imsi: Option<String>,
    pub guti: Option<Guti>,
    /// GUTI sent in an accept and not yet confirmed by the UE
    pub next_guti: Option<Guti>,
    pub session: Option<SessionId>,

    pub security: Option<SecurityContext>,
    pub ue_network_capability: Option<UeNetworkCapability>,
    /// An authentication information request is outstanding
    pub auth_info_pending: bool,

    pub procedure: Option<Procedure>,
    pub detach: Option<DetachProcedure>,
    pub bearer_setup: BearerSetup,
    pub timers: TimerTable,

    /// Set when the context is torn down; it is dropped after the handler
    pub released: bool,
}

impl EmmContext {
    pub fn new(id: UeId, main: ProcessId) -> Self {
        Self {
            id,
            state: EmmState::Deregistered,
            main,
            active: main,
            imsi: None,
            guti: None,
            next_guti: None,
            session: None,
            security: None,
            ue_network_capability: None,
            auth_info_pending: false,
            procedure: None,
            detach: None,
            bearer_setup: BearerSetup::default(),
            timers: TimerTable::default(),
            released: false,
        }
    }

    /// Identity used in log lines
    pub fn label(&self) -> String {
        match &self.imsi {
            Some(imsi) => imsi.clone(),
            None => self.id.to_string(),
        }
    }

    pub fn security_valid(&self) -> bool {
        self.security.as_ref().map(|sc| sc.is_valid()).unwrap_or(false)
    }
}

// ============================================================================
// UE table
// ============================================================================

/// All subscriber contexts and their lookup indexes.
///
/// A context may be taken out while its handler runs; the indexes keep
/// pointing at its id until it is put back or forgotten.
#[derive(Debug, Default)]
pub struct UeTable {
    ues: HashMap<UeId, EmmContext>,
    by_imsi: HashMap<String, UeId>,
    by_guti: HashMap<Guti, UeId>,
    by_session: HashMap<SessionId, UeId>,
    next_id: u64,
}

impl UeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_id(&mut self) -> UeId {
        self.next_id += 1;
        UeId(self.next_id)
    }

    pub fn insert(&mut self, ctx: EmmContext) {
        self.ues.insert(ctx.id, ctx);
    }

    pub fn get(&self, id: UeId) -> Option<&EmmContext> {
        self.ues.get(&id)
    }

    pub fn get_mut(&mut self, id: UeId) -> Option<&mut EmmContext> {
        self.ues.get_mut(&id)
    }

    /// Take a context out for exclusive handling
    pub fn take(&mut self, id: UeId) -> Option<EmmContext> {
        self.ues.remove(&id)
    }

    /// Return a context taken with [`UeTable::take`]
    pub fn put(&mut self, ctx: EmmContext) {
        self.ues.insert(ctx.id, ctx);
    }

    /// Drop every index entry for `id` and the context itself, if present
    pub fn forget(&mut self, id: UeId) -> Option<EmmContext> {
        self.by_imsi.retain(|_, ue| *ue != id);
        self.by_guti.retain(|_, ue| *ue != id);
        self.by_session.retain(|_, ue| *ue != id);
        self.ues.remove(&id)
    }

    pub fn find_by_imsi(&self, imsi: &str) -> Option<UeId> {
        self.by_imsi.get(imsi).copied()
    }

    pub fn find_by_guti(&self, guti: &Guti) -> Option<UeId> {
        self.by_guti.get(guti).copied()
    }

    pub fn find_by_session(&self, session: SessionId) -> Option<UeId> {
        self.by_session.get(&session).copied()
    }

    /// Index `imsi` to `id`. Returns the context that held it before, if
    /// it was a different one.
    pub fn bind_imsi(&mut self, id: UeId, imsi: &str) -> Option<UeId> {
        match self.by_imsi.insert(imsi.to_string(), id) {
            Some(old) if old != id => Some(old),
            _ => None,
        }
    }

    pub fn bind_guti(&mut self, id: UeId, guti: Guti) {
        self.by_guti.retain(|_, ue| *ue != id);
        self.by_guti.insert(guti, id);
    }

    pub fn unbind_guti(&mut self, guti: &Guti) {
        self.by_guti.remove(guti);
    }

    pub fn bind_session(&mut self, id: UeId, session: SessionId) {
        self.by_session.insert(session, id);
    }

    pub fn unbind_session(&mut self, session: SessionId) {
        self.by_session.remove(&session);
    }

    /// A GUTI under `plmn_id`/`mme_gid`/`mme_code` whose M-TMSI is unused
    pub fn allocate_guti(&self, plmn_id: PlmnId, mme_gid: u16, mme_code: u8) -> Guti {
        loop {
            // top two bits of the M-TMSI are always set
            let m_tmsi = rand::random::<u32>() | 0xc000_0000;
            let guti = Guti {
                plmn_id,
                mme_gid,
                mme_code,
                m_tmsi,
            };
            if !self.by_guti.contains_key(&guti) {
                return guti;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ues.is_empty()
    }

    pub fn ids(&self) -> Vec<UeId> {
        let mut ids: Vec<UeId> = self.ues.keys().copied().collect();
        ids.sort();
        ids
    }
}
