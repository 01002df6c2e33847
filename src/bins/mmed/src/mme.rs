//! MME EMM service
//!
//! Owns the engine and the shared environment, turns inbound events into
//! signals for the right subscriber process and drives the timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use mme_crypt::SHA256_DIGEST_SIZE;
use mme_nas::{get_guti_from_message, Guti};

use crate::config::MmeConfig;
use crate::context::{EmmContext, SessionId, UeId};
use crate::emm_sm::{self, EmmEngine, EmmEnv, EmmState, Event, LowerLayerEvent, PeerEvent};
use crate::error::{EmmError, EmmResult};
use crate::peers::{Inbound, Peers};
use crate::security::SecurityContext;

/// Idle poll interval of [`Mme::run`]
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The EMM layer of an MME
pub struct Mme {
    engine: EmmEngine,
    env: EmmEnv,
}

impl Mme {
    pub fn new(config: MmeConfig, peers: Peers) -> EmmResult<Self> {
        Self::with_clock(config, peers, Instant::now())
    }

    /// MME whose timers count from `now`
    pub fn with_clock(config: MmeConfig, peers: Peers, now: Instant) -> EmmResult<Self> {
        let env = EmmEnv::new(config, peers)?;
        log::info!(
            "MME [{}] serving PLMN {} (MME GID {}, MME code {})",
            env.config.mme_name,
            env.plmn_id,
            env.config.gummei.mme_gid,
            env.config.gummei.mme_code
        );
        Ok(Self {
            engine: EmmEngine::with_clock(now),
            env,
        })
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Uplink NAS on an established connection
    pub fn process_message(&mut self, session: SessionId, pdu: Bytes) {
        self.process_initial_message(session, pdu, None);
    }

    /// Uplink NAS, possibly the first on a new connection. `s_tmsi` is the
    /// temporary identity the lower layer saw, if any.
    pub fn process_initial_message(&mut self, session: SessionId, pdu: Bytes, s_tmsi: Option<Guti>) {
        let ue = match self.env.ues.find_by_session(session) {
            Some(ue) => ue,
            None => self.attach_session(session, &pdu, s_tmsi),
        };
        self.signal(ue, "EMM_MESSAGE", Event::Nas(pdu));
    }

    /// Find the context of a new connection by temporary identity, or
    /// create one
    fn attach_session(&mut self, session: SessionId, pdu: &Bytes, s_tmsi: Option<Guti>) -> UeId {
        let known = s_tmsi
            .or_else(|| get_guti_from_message(pdu))
            .and_then(|guti| self.env.ues.find_by_guti(&guti));

        if let Some(id) = known {
            if let Some(ctx) = self.env.ues.get_mut(id) {
                let previous = ctx.session.replace(session);
                log::debug!("[{}] New connection {} (was {:?})", ctx.label(), session, previous);
                if let Some(previous) = previous.filter(|p| *p != session) {
                    self.env.ues.unbind_session(previous);
                }
                self.env.ues.bind_session(id, session);
                return id;
            }
        }

        let id = self.env.ues.alloc_id();
        let main = self.engine.spawn("emm", emm_sm::deregistered, id, None);
        let mut ctx = EmmContext::new(id, main);
        ctx.session = Some(session);
        self.env.ues.insert(ctx);
        self.env.ues.bind_session(id, session);
        log::debug!("[{}] EMM context created on {}", id, session);
        id
    }

    /// Deliver a collaborator event
    pub fn deliver(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Nas { session, pdu } => self.process_message(session, pdu),
            Inbound::AuthInfo { ue, result } => self.signal(ue, "S6A_AUTH_INFO", Event::Peer(PeerEvent::AuthInfo(result))),
            Inbound::UpdateLocation { ue, result } => {
                self.signal(ue, "S6A_UPDATE_LOCATION", Event::Peer(PeerEvent::UpdateLocation(result)))
            }
            Inbound::Esm { ue, event } => self.signal(ue, "ESM_EVENT", Event::Peer(PeerEvent::Esm(event))),
            Inbound::ConnectionReleased { session } => self.ue_context_released(session),
            Inbound::LowerLayerError { session } => self.lower_layer_error(session),
        }
    }

    /// The lower layer released the connection of `session`
    pub fn ue_context_released(&mut self, session: SessionId) {
        self.lower_layer(session, LowerLayerEvent::ConnectionReleased);
    }

    pub fn lower_layer_error(&mut self, session: SessionId) {
        self.lower_layer(session, LowerLayerEvent::Error);
    }

    fn lower_layer(&mut self, session: SessionId, event: LowerLayerEvent) {
        match self.env.ues.find_by_session(session) {
            Some(ue) => self.signal(ue, "S1_EVENT", Event::LowerLayer(event)),
            None => log::debug!("{:?} on unknown {}", event, session),
        }
    }

    /// Start a network-initiated detach
    pub fn detach(&mut self, ue: UeId) -> EmmResult<()> {
        let main = self.env.ues.get(ue).map(|ctx| ctx.main).ok_or(EmmError::UnknownUe(ue))?;
        let signal = self
            .engine
            .new_signal(main, "NETWORK_DETACH")
            .with_payload(Event::Peer(PeerEvent::NetworkDetach));
        self.engine.send(signal);
        Ok(())
    }

    /// Queue an event for the process currently serving `ue`
    fn signal(&mut self, ue: UeId, name: &'static str, event: Event) {
        match self.env.ues.get(ue) {
            Some(ctx) => {
                let signal = self.engine.new_signal(ctx.active, name).with_payload(event);
                self.engine.send(signal);
            }
            None => log::debug!("{} gone, dropping [{}]", ue, name),
        }
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Dispatch everything queued. Returns the number of signals handled.
    pub fn run_until_idle(&mut self) -> usize {
        self.engine.run(&mut self.env)
    }

    /// Fire timers due by `now` and dispatch the result
    pub fn tick(&mut self, now: Instant) -> usize {
        self.engine.advance(now);
        self.run_until_idle()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.engine.next_expiry()
    }

    /// Serve `inbound` until it closes or `running` drops
    pub async fn run(&mut self, mut inbound: mpsc::UnboundedReceiver<Inbound>, running: Arc<AtomicBool>) {
        log::info!("EMM loop started");
        let mut poll = tokio::time::interval(POLL_INTERVAL);

        while running.load(Ordering::SeqCst) {
            let deadline = self.next_expiry().map(tokio::time::Instant::from_std);
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.deliver(event),
                    None => {
                        log::info!("Inbound channel closed");
                        break;
                    }
                },
                _ = sleep_until(deadline) => {}
                _ = poll.tick() => {}
            }
            self.tick(Instant::now());
        }

        log::info!("EMM loop stopped ({} contexts)", self.ue_count());
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self, ue: UeId) -> Option<EmmState> {
        self.env.ues.get(ue).map(|ctx| ctx.state)
    }

    pub fn context(&self, ue: UeId) -> Option<&EmmContext> {
        self.env.ues.get(ue)
    }

    pub fn security(&self, ue: UeId) -> Option<&SecurityContext> {
        self.env.ues.get(ue).and_then(|ctx| ctx.security.as_ref())
    }

    pub fn find_by_imsi(&self, imsi: &str) -> Option<UeId> {
        self.env.ues.find_by_imsi(imsi)
    }

    pub fn find_by_session(&self, session: SessionId) -> Option<UeId> {
        self.env.ues.find_by_session(session)
    }

    pub fn ue_count(&self) -> usize {
        self.env.ues.len()
    }

    pub fn process_count(&self) -> usize {
        self.engine.process_count()
    }

    pub fn timer_count(&self) -> usize {
        self.engine.timer_count()
    }

    /// Next NH and its chaining counter for a handover of `ue`
    pub fn handover_keys(&mut self, ue: UeId) -> EmmResult<([u8; SHA256_DIGEST_SIZE], u8)> {
        let ctx = self.env.ues.get_mut(ue).ok_or(EmmError::UnknownUe(ue))?;
        let label = ctx.label();
        let sc = ctx
            .security
            .as_mut()
            .filter(|sc| sc.is_valid())
            .ok_or(EmmError::NoSecurityContext)?;
        let (nh, ncc) = sc.next_nh().ok_or(EmmError::NoSecurityContext)?;
        log::debug!("[{}] NH derived (NCC {})", label, ncc);
        Ok((nh, ncc))
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Outbound;

    fn mme() -> (Mme, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (peers, _) = Peers::channel(tx);
        (Mme::new(MmeConfig::default(), peers).unwrap(), rx)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (peers, _) = Peers::channel(tx);
        let mut config = MmeConfig::default();
        config.gummei.mcc = "1".to_string();
        assert!(Mme::new(config, peers).is_err());
    }

    #[test]
    fn test_garbage_pdu_keeps_context_until_release() {
        let (mut mme, mut rx) = mme();
        mme.process_initial_message(SessionId(1), Bytes::from_static(&[0x07]), None);
        mme.run_until_idle();

        let ue = mme.find_by_session(SessionId(1)).unwrap();
        assert_eq!(mme.state(ue), Some(EmmState::Deregistered));
        assert!(rx.try_recv().is_err());

        mme.deliver(Inbound::ConnectionReleased { session: SessionId(1) });
        mme.run_until_idle();
        assert_eq!(mme.ue_count(), 0);
        assert_eq!(mme.process_count(), 0);
    }

    #[test]
    fn test_detach_unknown_ue() {
        let (mut mme, _rx) = mme();
        assert_eq!(mme.detach(UeId(42)), Err(EmmError::UnknownUe(UeId(42))));
        assert!(mme.handover_keys(UeId(42)).is_err());
    }
}
