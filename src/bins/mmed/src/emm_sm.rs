//! EMM state machine
//!
//! Each subscriber runs as a main process on the [`mme_core`] engine whose
//! state function is one of the [`EmmState`]s. Two short-lived child
//! processes take over while the main process waits: the identification
//! procedure and default bearer setup during attach. Both hand control back
//! with `run_parent`.
//!
//! Every state function goes through [`dispatch`]: the context is taken out
//! of the [`UeTable`], the signal is classified into an [`Input`], and the
//! state's operation set (`process_message`, `process_secured`, ...) runs
//! against an [`Emm`] handle.

use std::fmt;

use bytes::Bytes;

use mme_core::{CoreResult, Dispatch, Engine, Expiry, ProcessId, Scheduler, Signal, StateFn, Step, TimerHandle};
use mme_nas::{EmmMessage, PlmnId, SecurityHeaderType};

use crate::config::{MmeConfig, SecurityPolicy};
use crate::context::{ArmedTimer, EmmContext, TimerKind, UeId, UeTable};
use crate::emm_handler;
use crate::error::{EmmError, EmmResult};
use crate::nas_security::{nas_eps_security_decode, nas_eps_security_encode, Integrity, ServiceRequest, Uplink, UplinkPdu};
use crate::peers::{EsmEvent, HssError, Peers};
use crate::security::AuthVector;

// ============================================================================
// Events
// ============================================================================

/// Replies and requests from collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    AuthInfo(Result<Vec<AuthVector>, HssError>),
    UpdateLocation(Result<(), HssError>),
    Esm(EsmEvent),
    /// Operator-requested detach
    NetworkDetach,
}

/// Lower-layer connection events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerLayerEvent {
    ConnectionReleased,
    Error,
}

/// Signal payload of EMM processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Raw uplink NAS PDU
    Nas(Bytes),
    /// An uplink PDU already decoded. A deferred [`Event::Nas`] is replaced
    /// by this so a replay does not run the counters twice.
    Uplink(UplinkPdu),
    Peer(PeerEvent),
    Timer(TimerKind),
    LowerLayer(LowerLayerEvent),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Nas(_) | Event::Uplink(_) => "EMM_MESSAGE",
            Event::Peer(PeerEvent::AuthInfo(_)) => "S6A_AUTH_INFO",
            Event::Peer(PeerEvent::UpdateLocation(_)) => "S6A_UPDATE_LOCATION",
            Event::Peer(PeerEvent::Esm(_)) => "ESM_EVENT",
            Event::Peer(PeerEvent::NetworkDetach) => "NETWORK_DETACH",
            Event::Timer(_) => "EMM_TIMER",
            Event::LowerLayer(LowerLayerEvent::ConnectionReleased) => "S1_RELEASED",
            Event::LowerLayer(LowerLayerEvent::Error) => "S1_ERROR",
        }
    }
}

/// A signal after decoding, as the state handlers see it
#[derive(Debug, Clone)]
pub enum Input {
    Message(Uplink),
    ServiceRequest(ServiceRequest),
    Timer {
        kind: TimerKind,
        expiry: Expiry,
        handle: TimerHandle,
    },
    Peer(PeerEvent),
    LowerLayer(LowerLayerEvent),
}

// ============================================================================
// Environment
// ============================================================================

/// Shared state every EMM process runs against
pub struct EmmEnv {
    pub ues: UeTable,
    pub peers: Peers,
    pub config: MmeConfig,
    pub policy: SecurityPolicy,
    pub plmn_id: PlmnId,
}

impl EmmEnv {
    pub fn new(config: MmeConfig, peers: Peers) -> EmmResult<Self> {
        config.validate()?;
        let policy = config.security_policy()?;
        let plmn_id = config.plmn_id()?;
        Ok(Self {
            ues: UeTable::new(),
            peers,
            config,
            policy,
            plmn_id,
        })
    }
}

pub type EmmEngine = Engine<UeId, Event, EmmEnv>;
pub type EmmStep<'a> = Step<'a, UeId, Event, EmmEnv>;
pub type EmmScheduler<'a> = Scheduler<'a, UeId, Event, EmmEnv>;
pub type EmmStateFn = StateFn<UeId, Event, EmmEnv>;

// ============================================================================
// States
// ============================================================================

/// EMM states (TS 24.301 clause 5.1.3.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmmState {
    Deregistered,
    CommonProcedureInitiated,
    SpecificProcedureInitiated,
    Registered,
    DeregisteredInitiated,
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Deregistered => write!(f, "DE_REGISTERED"),
            EmmState::CommonProcedureInitiated => write!(f, "COMMON_PROCEDURE_INITIATED"),
            EmmState::SpecificProcedureInitiated => write!(f, "SPECIFIC_PROCEDURE_INITIATED"),
            EmmState::Registered => write!(f, "REGISTERED"),
            EmmState::DeregisteredInitiated => write!(f, "DE_REGISTERED_INITIATED"),
        }
    }
}

/// Plain messages accepted while a valid security context exists
/// (TS 24.301 clause 4.4.4.3)
fn allowed_in_plain(message: &EmmMessage) -> bool {
    matches!(
        message,
        EmmMessage::AttachRequest(_)
            | EmmMessage::IdentityResponse(_)
            | EmmMessage::AuthenticationResponse(_)
            | EmmMessage::AuthenticationFailure(_)
            | EmmMessage::SecurityModeReject(_)
            | EmmMessage::DetachRequestUe(_)
            | EmmMessage::TrackingAreaUpdateRequest(_)
    )
}

/// Messages that may start a procedure even when their integrity check
/// failed; the procedure then re-authenticates
fn is_initial(message: &EmmMessage) -> bool {
    matches!(
        message,
        EmmMessage::AttachRequest(_)
            | EmmMessage::TrackingAreaUpdateRequest(_)
            | EmmMessage::DetachRequestUe(_)
    )
}

impl EmmState {
    /// Engine state function of the main process in this state
    pub fn state_fn(&self) -> EmmStateFn {
        match self {
            EmmState::Deregistered => deregistered,
            EmmState::CommonProcedureInitiated => common_procedure_initiated,
            EmmState::SpecificProcedureInitiated => specific_procedure_initiated,
            EmmState::Registered => registered,
            EmmState::DeregisteredInitiated => deregistered_initiated,
        }
    }

    /// A message that arrived without protection
    pub fn process_message(self, emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
        if emm.ue.security_valid() && !allowed_in_plain(&up.message) {
            log::warn!(
                "[{}] Plain {} with a security context in {}, dropping",
                emm.ue.label(),
                up.message.name(),
                self
            );
            return Ok(Dispatch::Consumed);
        }
        self.on_message(emm, up)
    }

    /// A message that arrived integrity protected, verified or not
    pub fn process_secured(self, emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
        if up.integrity == Integrity::Failed
            && (self == EmmState::CommonProcedureInitiated || !is_initial(&up.message))
        {
            log::warn!(
                "[{}] {} failed integrity check in {}, dropping",
                emm.ue.label(),
                up.message.name(),
                self
            );
            return Ok(Dispatch::Consumed);
        }
        self.on_message(emm, up)
    }

    fn on_message(self, emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
        log::debug!("[{}] {} in {}", emm.ue.label(), up.message.name(), self);
        emm_handler::ue_reachable(emm);

        match self {
            EmmState::Deregistered => emm_handler::deregistered_message(emm, up),
            EmmState::CommonProcedureInitiated => emm_handler::common_procedure_message(emm, up),
            EmmState::SpecificProcedureInitiated => emm_handler::specific_procedure_message(emm, up),
            EmmState::Registered => emm_handler::registered_message(emm, up),
            EmmState::DeregisteredInitiated => emm_handler::deregistered_initiated_message(emm, up),
        }
    }

    pub fn process_service_request(self, emm: &mut Emm<'_, '_>, sr: ServiceRequest) -> EmmResult<Dispatch> {
        match self {
            EmmState::Registered => emm_handler::handle_service_request(emm, sr),
            EmmState::Deregistered => {
                emm_handler::reject_service_request(emm)?;
                Ok(Dispatch::Consumed)
            }
            _ => {
                log::warn!("[{}] Service request in {}, dropping", emm.ue.label(), self);
                Ok(Dispatch::Consumed)
            }
        }
    }

    pub fn process_timeout(
        self,
        emm: &mut Emm<'_, '_>,
        kind: TimerKind,
        expiry: Expiry,
        handle: TimerHandle,
    ) -> EmmResult<Dispatch> {
        if !emm.ue.timers.is_current(kind, handle) {
            log::debug!("[{}] Stale {} expiry ignored", emm.ue.label(), kind);
            return Ok(Dispatch::Consumed);
        }
        emm_handler::handle_timer_expiry(emm, kind, expiry)?;
        Ok(Dispatch::Consumed)
    }

    pub fn process_error(self, emm: &mut Emm<'_, '_>, event: LowerLayerEvent) -> EmmResult<Dispatch> {
        log::info!("[{}] Lower layer {:?} in {}", emm.ue.label(), event, self);
        match self {
            EmmState::Deregistered
            | EmmState::CommonProcedureInitiated
            | EmmState::SpecificProcedureInitiated => {
                emm.teardown(event == LowerLayerEvent::Error);
            }
            EmmState::Registered => emm_handler::connection_lost(emm, event)?,
            EmmState::DeregisteredInitiated => {
                emm_handler::finish_detach(emm);
                emm.teardown(false);
            }
        }
        Ok(Dispatch::Consumed)
    }

    pub fn process_event(self, emm: &mut Emm<'_, '_>, event: PeerEvent) -> EmmResult<Dispatch> {
        match event {
            PeerEvent::AuthInfo(result) => emm_handler::handle_auth_info(emm, self, result),
            PeerEvent::NetworkDetach => emm_handler::handle_network_detach(emm, self),
            PeerEvent::Esm(EsmEvent::DetachComplete) if self == EmmState::DeregisteredInitiated => {
                emm_handler::handle_esm_detach_complete(emm)
            }
            other => {
                log::debug!("[{}] {:?} in {}, ignored", emm.ue.label(), other, self);
                Ok(Dispatch::Consumed)
            }
        }
    }

    fn handle(self, emm: &mut Emm<'_, '_>, input: Input) -> EmmResult<Dispatch> {
        match input {
            Input::Message(up) if up.integrity == Integrity::Plain => self.process_message(emm, up),
            Input::Message(up) => self.process_secured(emm, up),
            Input::ServiceRequest(sr) => self.process_service_request(emm, sr),
            Input::Timer { kind, expiry, handle } => self.process_timeout(emm, kind, expiry, handle),
            Input::Peer(event) => self.process_event(emm, event),
            Input::LowerLayer(event) => self.process_error(emm, event),
        }
    }
}

// ============================================================================
// Handler context
// ============================================================================

/// What a handler works with: the subscriber, the environment and the
/// scheduler of the running process
pub struct Emm<'s, 'a> {
    pub ue: &'s mut EmmContext,
    pub env: &'s mut EmmEnv,
    pub sched: &'s mut EmmScheduler<'a>,
    pub pid: ProcessId,
}

impl<'s, 'a> Emm<'s, 'a> {
    pub fn is_main(&self) -> bool {
        self.pid == self.ue.main
    }

    /// Move the main process to `state`
    pub fn set_state(&mut self, state: EmmState) {
        if !self.is_main() {
            log::error!(
                "[{}] {} is not the main process, cannot enter {}",
                self.ue.label(),
                self.pid,
                state
            );
            return;
        }
        log::debug!("[{}] EMM state: {} -> {}", self.ue.label(), self.ue.state, state);
        self.ue.state = state;
        self.sched.transition(state.state_fn());
    }

    /// Send a message protected with the current security context, or in
    /// plain if there is none. Returns the PDU sent.
    pub fn send_message(&mut self, message: EmmMessage) -> EmmResult<Option<Bytes>> {
        let header_type = if self.ue.security_valid() {
            SecurityHeaderType::IntegrityProtectedAndCiphered
        } else {
            SecurityHeaderType::Plain
        };
        self.send_with(header_type, message)
    }

    pub fn send_with(&mut self, header_type: SecurityHeaderType, message: EmmMessage) -> EmmResult<Option<Bytes>> {
        let pdu = nas_eps_security_encode(self.ue.security.as_mut(), header_type, &message)?;
        match self.ue.session {
            Some(session) => {
                log::debug!("[{}] {} -> {}", self.ue.label(), message.name(), session);
                self.env.peers.lower.send(session, pdu.clone());
                Ok(Some(pdu))
            }
            None => {
                log::warn!("[{}] No connection, {} not sent", self.ue.label(), message.name());
                Ok(None)
            }
        }
    }

    /// Arm `kind` for `target`. The expiry retransmits `pdu` if given.
    pub fn arm_timer(&mut self, kind: TimerKind, target: ProcessId, pdu: Option<Bytes>) -> EmmResult<()> {
        if let Some(stale) = self.ue.timers.take(kind) {
            log::warn!("[{}] {} already running, stopping stale timer", self.ue.label(), kind);
            self.sched.stop_timeout(stale.handle);
        }

        let value = self.env.config.timers.get(kind);
        let signal = self.sched.new_signal(target, "EMM_TIMER").with_payload(Event::Timer(kind));
        let handle = self.sched.set_timeout(value.interval(), value.max_retries, signal)?;
        self.ue.timers.set(kind, ArmedTimer { handle, pdu });
        log::trace!("[{}] {} armed ({})", self.ue.label(), kind, handle);
        Ok(())
    }

    pub fn stop_timer(&mut self, kind: TimerKind) -> bool {
        match self.ue.timers.take(kind) {
            Some(timer) => {
                self.sched.stop_timeout(timer.handle);
                true
            }
            None => false,
        }
    }

    pub fn stop_all_timers(&mut self) {
        for (_, timer) in self.ue.timers.take_all() {
            self.sched.stop_timeout(timer.handle);
        }
    }

    /// Resend the PDU stored with `kind`
    pub fn retransmit(&mut self, kind: TimerKind) {
        let pdu = self.ue.timers.get(kind).and_then(|t| t.pdu.clone());
        match (pdu, self.ue.session) {
            (Some(pdu), Some(session)) => self.env.peers.lower.send(session, pdu),
            _ => log::warn!("[{}] Nothing to retransmit on {}", self.ue.label(), kind),
        }
    }

    pub fn release_connection(&mut self) {
        if let Some(session) = self.ue.session {
            self.env.peers.lower.release(session);
        }
    }

    /// Abort everything for this subscriber. The context is dropped once
    /// the handler returns.
    pub fn teardown(&mut self, release_connection: bool) {
        log::info!("[{}] EMM context removed in {}", self.ue.label(), self.ue.state);
        self.stop_all_timers();
        if self.ue.active != self.ue.main {
            self.sched.stop(self.ue.active);
        }
        self.sched.stop(self.ue.main);
        if release_connection {
            self.release_connection();
        }
        self.env.peers.esm.release_context(self.ue.id);
        self.ue.security = None;
        self.ue.released = true;
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn classify(emm: &mut Emm<'_, '_>, signal: &mut Signal<Event>) -> Option<Input> {
    let timer = signal.timer;
    let expiry = signal.expiry;
    let event = signal.payload_mut()?;

    let pdu = match event {
        Event::Nas(raw) => match nas_eps_security_decode(emm.ue.security.as_mut(), raw) {
            Ok(pdu) => {
                *event = Event::Uplink(pdu.clone());
                pdu
            }
            Err(e) => {
                log::warn!("[{}] Undecodable NAS PDU dropped: {}", emm.ue.label(), e);
                return None;
            }
        },
        Event::Uplink(pdu) => pdu.clone(),
        Event::Timer(kind) => {
            return match (timer, expiry) {
                (Some(handle), Some(expiry)) => Some(Input::Timer {
                    kind: *kind,
                    expiry,
                    handle,
                }),
                _ => {
                    log::error!("[{}] {} signal without a timer", emm.ue.label(), kind);
                    None
                }
            };
        }
        Event::Peer(peer) => return Some(Input::Peer(peer.clone())),
        Event::LowerLayer(ev) => return Some(Input::LowerLayer(*ev)),
    };

    Some(match pdu {
        UplinkPdu::Message(up) => Input::Message(up),
        UplinkPdu::ServiceRequest(sr) => Input::ServiceRequest(sr),
    })
}

/// Which procedure a process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Main(EmmState),
    Identification,
    BearerSetup,
}

fn dispatch(role: Role, step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    let id = *step.data;
    let Some(mut ue) = step.env.ues.take(id) else {
        log::debug!("{} gone, dropping [{}]", id, signal.name);
        return Ok(Dispatch::Consumed);
    };

    let result = {
        let mut emm = Emm {
            ue: &mut ue,
            env: &mut *step.env,
            sched: &mut step.sched,
            pid: step.pid,
        };
        match classify(&mut emm, signal) {
            None => Ok(Dispatch::Consumed),
            Some(input) => match role {
                Role::Main(state) => state.handle(&mut emm, input),
                Role::Identification => emm_handler::identification(&mut emm, input),
                Role::BearerSetup => emm_handler::bearer_setup(&mut emm, input),
            },
        }
    };

    if ue.released {
        step.env.ues.forget(id);
    } else {
        step.env.ues.put(ue);
    }

    match result {
        Ok(dispatch) => Ok(dispatch),
        Err(EmmError::Core(e)) => Err(e),
        Err(e) => {
            log::warn!("{} [{}] handling failed: {}", id, signal.name, e);
            Ok(Dispatch::Consumed)
        }
    }
}

pub fn deregistered(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Main(EmmState::Deregistered), step, signal)
}

pub fn common_procedure_initiated(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Main(EmmState::CommonProcedureInitiated), step, signal)
}

pub fn specific_procedure_initiated(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Main(EmmState::SpecificProcedureInitiated), step, signal)
}

pub fn registered(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Main(EmmState::Registered), step, signal)
}

pub fn deregistered_initiated(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Main(EmmState::DeregisteredInitiated), step, signal)
}

/// Child process waiting for an Identity Response
pub fn identity_procedure(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::Identification, step, signal)
}

/// Child process waiting for the location update and the default bearer
pub fn attach_bearer_setup(step: &mut EmmStep<'_>, signal: &mut Signal<Event>) -> CoreResult<Dispatch> {
    dispatch(Role::BearerSetup, step, signal)
}
