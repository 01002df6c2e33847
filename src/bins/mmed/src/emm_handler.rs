//! EMM procedure handlers
//!
//! Message and event handling behind each [`EmmState`]: attach,
//! identification, authentication, security mode control, tracking area
//! update, service request and both detach directions (TS 24.301 clause 5).

use bytes::Bytes;

use mme_core::{Dispatch, Expiry};
use mme_nas::message::{
    AttachComplete, AttachRequest, AuthenticationFailure, DetachRequestUe, TrackingAreaUpdateRequest,
};
use mme_nas::types::EpsUpdateType;
use mme_nas::{EmmCause, EmmMessage, MobileIdentity, SecurityHeaderType};

use crate::context::{BearerSetup, DetachProcedure, Procedure, TimerKind};
use crate::emm_build;
use crate::emm_sm::{attach_bearer_setup, identity_procedure, Emm, EmmState, Input, LowerLayerEvent, PeerEvent};
use crate::error::{EmmError, EmmResult};
use crate::nas_security::{Integrity, ServiceRequest, Uplink};
use crate::peers::{EsmEvent, HssError, Resync};
use crate::security::{AuthVector, SecurityContext};

/// Any uplink NAS shows the UE is reachable
pub fn ue_reachable(emm: &mut Emm<'_, '_>) {
    emm.stop_timer(TimerKind::MobileReachable);
    emm.stop_timer(TimerKind::ImplicitDetach);
}

fn unexpected(emm: &Emm<'_, '_>, message: &EmmMessage) -> EmmResult<Dispatch> {
    log::warn!("[{}] Unexpected {} in {}", emm.ue.label(), message.name(), emm.ue.state);
    Ok(Dispatch::Consumed)
}

/// Whether the UE's KSI names our current, activated context
fn ksi_matches(emm: &Emm<'_, '_>, ksi: mme_nas::KeySetIdentifier) -> bool {
    emm.ue
        .security
        .as_ref()
        .map(|sc| sc.is_valid() && sc.matches_ksi(ksi))
        .unwrap_or(false)
}

// ============================================================================
// DE_REGISTERED
// ============================================================================

pub fn deregistered_message(emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
    match up.message {
        EmmMessage::AttachRequest(req) => handle_attach_request(emm, req, up.integrity, up.count),
        EmmMessage::TrackingAreaUpdateRequest(_) => {
            log::warn!("[{}] TAU request while deregistered, rejecting", emm.ue.label());
            emm.send_message(emm_build::tracking_area_update_reject(EmmCause::ImplicitlyDetached))?;
            Ok(Dispatch::Consumed)
        }
        EmmMessage::DetachRequestUe(_) => {
            log::warn!("[{}] Detach request while deregistered", emm.ue.label());
            emm.send_message(emm_build::emm_status(EmmCause::MessageTypeNotCompatible))?;
            Ok(Dispatch::Consumed)
        }
        other => unexpected(emm, &other),
    }
}

fn handle_attach_request(
    emm: &mut Emm<'_, '_>,
    req: AttachRequest,
    integrity: Integrity,
    count: Option<u32>,
) -> EmmResult<Dispatch> {
    log::info!(
        "[{}] Attach request ({:?}, KSI {}, integrity {:?})",
        emm.ue.label(),
        req.attach_type,
        req.ksi.value,
        integrity
    );

    emm.ue.ue_network_capability = Some(req.ue_network_capability.clone());
    emm.ue.procedure = Some(Procedure::Attach {
        attach_type: req.attach_type,
        esm_container: req.esm_container.clone(),
    });
    emm.ue.bearer_setup = BearerSetup::default();
    emm.ue.next_guti = None;

    match &req.identity {
        MobileIdentity::Imsi(imsi) => bind_imsi(emm, imsi),
        MobileIdentity::Guti(guti) if emm.ue.guti != Some(*guti) => {
            log::debug!("[{}] GUTI {} not known here", emm.ue.label(), guti);
        }
        MobileIdentity::Guti(_) | MobileIdentity::Imei(_) | MobileIdentity::Imeisv(_) => {}
    }

    if emm.ue.imsi.is_none() {
        return start_identification(emm);
    }

    if let (Integrity::Verified, Some(count)) = (integrity, count) {
        if ksi_matches(emm, req.ksi) {
            log::info!("[{}] Attach with a current security context, skipping authentication", emm.ue.label());
            if let Some(sc) = emm.ue.security.as_mut() {
                sc.derive_kenb(count);
            }
            emm.set_state(EmmState::SpecificProcedureInitiated);
            start_bearer_setup(emm);
            return Ok(Dispatch::Consumed);
        }
    }

    start_authentication(emm)
}

/// Index the IMSI to this context, dropping any older context that held it
fn bind_imsi(emm: &mut Emm<'_, '_>, imsi: &str) {
    if let Some(old) = emm.env.ues.bind_imsi(emm.ue.id, imsi) {
        if let Some(mut stale) = emm.env.ues.take(old) {
            log::info!("[{}] Replacing older context {}", imsi, stale.id);
            for (_, timer) in stale.timers.take_all() {
                emm.sched.stop_timeout(timer.handle);
            }
            if stale.active != stale.main {
                emm.sched.stop(stale.active);
            }
            emm.sched.stop(stale.main);
            if let Some(session) = stale.session.filter(|s| Some(*s) != emm.ue.session) {
                emm.env.peers.lower.release(session);
            }
            emm.env.peers.esm.release_context(stale.id);
            // keeps the IMSI entry, which now names this context
            emm.env.ues.forget(stale.id);
        }
    }
    emm.ue.imsi = Some(imsi.to_string());
}

// ============================================================================
// Identification
// ============================================================================

/// Ask the UE for its IMSI. The attach request is deferred in the main
/// process until the identification child finishes.
fn start_identification(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    log::info!("[{}] Unknown identity, starting identification", emm.ue.label());
    let child = emm.sched.spawn("emm-identity", identity_procedure, emm.ue.id);
    emm.ue.active = child;
    let pdu = emm.send_message(emm_build::identity_request())?;
    emm.arm_timer(TimerKind::T3470, child, pdu)?;
    Ok(Dispatch::Deferred)
}

/// Identification child
pub fn identification(emm: &mut Emm<'_, '_>, input: Input) -> EmmResult<Dispatch> {
    match input {
        Input::Message(up) => match up.message {
            EmmMessage::IdentityResponse(MobileIdentity::Imsi(imsi)) => {
                emm.stop_timer(TimerKind::T3470);
                log::info!("[{}] Identity response: IMSI[{}]", emm.ue.label(), imsi);
                bind_imsi(emm, &imsi);
                emm.ue.active = emm.ue.main;
                emm.sched.run_parent();
                Ok(Dispatch::Consumed)
            }
            EmmMessage::IdentityResponse(other) => {
                log::warn!("[{}] Identity response without IMSI: {:?}", emm.ue.label(), other);
                Ok(Dispatch::Consumed)
            }
            _ => Ok(Dispatch::Deferred),
        },
        Input::ServiceRequest(_) | Input::Peer(_) => Ok(Dispatch::Deferred),
        Input::Timer { kind, expiry, handle } => {
            if kind == TimerKind::T3470 && emm.ue.timers.is_current(kind, handle) {
                handle_timer_expiry(emm, kind, expiry)?;
            }
            Ok(Dispatch::Consumed)
        }
        Input::LowerLayer(event) => {
            log::info!("[{}] Lower layer {:?} during identification", emm.ue.label(), event);
            emm.teardown(event == LowerLayerEvent::Error);
            Ok(Dispatch::Consumed)
        }
    }
}

// ============================================================================
// Authentication and security mode control
// ============================================================================

/// Challenge the UE, fetching vectors first if none are left
fn start_authentication(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    let has_vectors = emm
        .ue
        .security
        .get_or_insert_with(SecurityContext::new)
        .has_vectors();

    if has_vectors {
        send_authentication_request(emm)?;
    } else if emm.ue.auth_info_pending {
        log::debug!("[{}] Authentication information already requested", emm.ue.label());
    } else {
        request_auth_info(emm, None);
    }

    if emm.ue.state != EmmState::CommonProcedureInitiated {
        emm.set_state(EmmState::CommonProcedureInitiated);
    }
    Ok(Dispatch::Consumed)
}

fn request_auth_info(emm: &mut Emm<'_, '_>, resync: Option<Resync>) {
    let Some(imsi) = emm.ue.imsi.clone() else {
        log::error!("[{}] No IMSI to request authentication information for", emm.ue.label());
        return;
    };
    emm.ue.auth_info_pending = true;
    emm.env.peers.hss.get_auth_information(emm.ue.id, &imsi, resync);
}

fn send_authentication_request(emm: &mut Emm<'_, '_>) -> EmmResult<()> {
    let sc = emm.ue.security.as_mut().ok_or(EmmError::NoSecurityContext)?;
    let Some((ksi, vector)) = sc.start_challenge() else {
        return Err(EmmError::NoSecurityContext);
    };
    let message = emm_build::authentication_request(ksi, vector);
    log::info!("[{}] Authentication request (KSI {})", emm.ue.label(), ksi.value);

    let pdu = emm.send_message(message)?;
    emm.arm_timer(TimerKind::T3460, emm.ue.main, pdu)?;
    Ok(())
}

pub fn handle_auth_info(
    emm: &mut Emm<'_, '_>,
    state: EmmState,
    result: Result<Vec<AuthVector>, HssError>,
) -> EmmResult<Dispatch> {
    emm.ue.auth_info_pending = false;
    if state != EmmState::CommonProcedureInitiated {
        log::debug!("[{}] Authentication information in {}, ignored", emm.ue.label(), state);
        return Ok(Dispatch::Consumed);
    }

    match result {
        Ok(vectors) if !vectors.is_empty() => {
            log::debug!("[{}] {} authentication vectors received", emm.ue.label(), vectors.len());
            emm.ue
                .security
                .get_or_insert_with(SecurityContext::new)
                .push_vectors(vectors);
            send_authentication_request(emm)?;
        }
        Ok(_) => {
            log::error!("[{}] Identity service returned no vectors", emm.ue.label());
            reject_procedure(emm, EmmCause::NetworkFailure)?;
            emm.teardown(true);
        }
        Err(e) => {
            log::warn!("[{}] Authentication information failed: {}", emm.ue.label(), e);
            if e.is_unknown_subscription() {
                reject_procedure(emm, EmmCause::ImsiUnknownInHss)?;
            }
            emm.teardown(true);
        }
    }
    Ok(Dispatch::Consumed)
}

/// Send the reject matching the procedure in progress
fn reject_procedure(emm: &mut Emm<'_, '_>, cause: EmmCause) -> EmmResult<()> {
    let message = match emm.ue.procedure.take() {
        Some(Procedure::Attach { .. }) => emm_build::attach_reject(cause, None),
        Some(Procedure::TrackingAreaUpdate { .. }) => emm_build::tracking_area_update_reject(cause),
        None => return Ok(()),
    };
    log::info!("[{}] {} ({:?})", emm.ue.label(), message.name(), cause);
    emm.send_message(message)?;
    Ok(())
}

pub fn common_procedure_message(emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
    match up.message {
        EmmMessage::AuthenticationResponse(resp) => handle_authentication_response(emm, &resp.res),
        EmmMessage::AuthenticationFailure(failure) => handle_authentication_failure(emm, failure),
        EmmMessage::SecurityModeComplete => match (up.integrity, up.count) {
            (Integrity::Verified, Some(count)) => handle_security_mode_complete(emm, count),
            _ => {
                log::warn!("[{}] Security mode complete not integrity protected", emm.ue.label());
                Ok(Dispatch::Consumed)
            }
        },
        EmmMessage::SecurityModeReject(cause) => {
            emm.stop_timer(TimerKind::T3460);
            log::warn!("[{}] Security mode reject ({:?})", emm.ue.label(), cause);
            emm.teardown(true);
            Ok(Dispatch::Consumed)
        }
        EmmMessage::AttachRequest(_) => restart_attach(emm),
        EmmMessage::DetachRequestUe(req) => detach_during_procedure(emm, req),
        other => unexpected(emm, &other),
    }
}

/// The UE failed authentication: reject, forget the keys and go back to
/// DE_REGISTERED
fn authentication_rejected(emm: &mut Emm<'_, '_>) -> EmmResult<()> {
    emm.send_with(SecurityHeaderType::Plain, emm_build::authentication_reject())?;
    emm.ue.security = None;
    emm.ue.procedure = None;
    emm.set_state(EmmState::Deregistered);
    emm.release_connection();
    Ok(())
}

fn handle_authentication_response(emm: &mut Emm<'_, '_>, res: &Bytes) -> EmmResult<Dispatch> {
    emm.stop_timer(TimerKind::T3460);

    let matched = emm
        .ue
        .security
        .as_ref()
        .map(|sc| sc.verify_res(res))
        .unwrap_or(false);
    if !matched {
        log::warn!("[{}] Authentication response mismatch", emm.ue.label());
        log::debug!("  RES: {:02x?}", res.as_ref());
        authentication_rejected(emm)?;
        return Ok(Dispatch::Consumed);
    }
    log::info!("[{}] Authentication successful", emm.ue.label());

    let capability = emm.ue.ue_network_capability.clone().unwrap_or_default();
    let Some((integrity, ciphering)) = emm.env.policy.select(&capability) else {
        log::warn!("[{}] No common NAS security algorithms", emm.ue.label());
        reject_procedure(emm, EmmCause::UeSecurityCapabilitiesMismatch)?;
        emm.teardown(true);
        return Ok(Dispatch::Consumed);
    };

    let sc = emm.ue.security.as_mut().ok_or(EmmError::NoSecurityContext)?;
    if !sc.establish(integrity, ciphering) {
        return Err(EmmError::NoSecurityContext);
    }
    let message = emm_build::security_mode_command(sc, &capability);
    let ksi = sc.ksi().value;
    log::info!(
        "[{}] Security mode command ({}/{}, KSI {})",
        emm.ue.label(),
        integrity,
        ciphering,
        ksi
    );

    let pdu = emm.send_with(SecurityHeaderType::IntegrityProtectedWithNewContext, message)?;
    emm.arm_timer(TimerKind::T3460, emm.ue.main, pdu)?;
    Ok(Dispatch::Consumed)
}

fn handle_authentication_failure(emm: &mut Emm<'_, '_>, failure: AuthenticationFailure) -> EmmResult<Dispatch> {
    emm.stop_timer(TimerKind::T3460);

    match (failure.cause, failure.auts) {
        (EmmCause::SynchFailure, Some(auts)) => {
            let rand = emm
                .ue
                .security
                .as_ref()
                .and_then(|sc| sc.challenge().map(|(_, vector)| vector.rand));
            let Some(rand) = rand else {
                log::warn!("[{}] Synch failure without a challenge", emm.ue.label());
                authentication_rejected(emm)?;
                return Ok(Dispatch::Consumed);
            };
            log::warn!("[{}] Authentication failure: synch failure, resynchronising", emm.ue.label());
            if let Some(sc) = emm.ue.security.as_mut() {
                sc.clear_vectors();
            }
            request_auth_info(emm, Some(Resync { rand, auts }));
        }
        (cause, _) => {
            log::warn!("[{}] Authentication failure ({:?})", emm.ue.label(), cause);
            authentication_rejected(emm)?;
        }
    }
    Ok(Dispatch::Consumed)
}

fn handle_security_mode_complete(emm: &mut Emm<'_, '_>, count: u32) -> EmmResult<Dispatch> {
    emm.stop_timer(TimerKind::T3460);
    let sc = emm.ue.security.as_mut().ok_or(EmmError::NoSecurityContext)?;
    sc.activate(count);
    log::info!("[{}] Security mode complete, NAS security active at UL COUNT {}", emm.ue.label(), count);

    emm.set_state(EmmState::SpecificProcedureInitiated);
    match emm.ue.procedure.clone() {
        Some(Procedure::Attach { .. }) => start_bearer_setup(emm),
        Some(Procedure::TrackingAreaUpdate { update_type, active }) => {
            accept_tracking_area_update(emm, update_type, active)?;
            emm.set_state(EmmState::Registered);
        }
        None => emm.set_state(EmmState::Registered),
    }
    Ok(Dispatch::Consumed)
}

// ============================================================================
// Attach
// ============================================================================

/// Hand over to the bearer setup child: update location towards the
/// identity service and pass the held ESM payload on
fn start_bearer_setup(emm: &mut Emm<'_, '_>) {
    let child = emm.sched.spawn("emm-attach", attach_bearer_setup, emm.ue.id);
    emm.ue.active = child;
    emm.ue.bearer_setup = BearerSetup::default();

    if let Some(imsi) = emm.ue.imsi.clone() {
        emm.env.peers.hss.update_location(emm.ue.id, &imsi);
    }
    if let Some(Procedure::Attach { esm_container, .. }) = emm.ue.procedure.clone() {
        emm.env.peers.esm.process_message(emm.ue.id, esm_container);
    }
}

/// Bearer setup child
pub fn bearer_setup(emm: &mut Emm<'_, '_>, input: Input) -> EmmResult<Dispatch> {
    match input {
        Input::Peer(PeerEvent::UpdateLocation(Ok(()))) => {
            log::debug!("[{}] Location updated", emm.ue.label());
            emm.ue.bearer_setup.location_updated = true;
            complete_bearer_setup(emm)
        }
        Input::Peer(PeerEvent::UpdateLocation(Err(e))) => {
            log::warn!("[{}] Update location failed: {}", emm.ue.label(), e);
            let cause = if e.is_unknown_subscription() {
                EmmCause::ImsiUnknownInHss
            } else {
                EmmCause::NetworkFailure
            };
            reject_procedure(emm, cause)?;
            emm.teardown(true);
            Ok(Dispatch::Consumed)
        }
        Input::Peer(PeerEvent::Esm(EsmEvent::BearerReady { container })) => {
            log::debug!("[{}] Default bearer ready", emm.ue.label());
            emm.ue.bearer_setup.esm_container = Some(container);
            complete_bearer_setup(emm)
        }
        Input::Peer(PeerEvent::Esm(EsmEvent::Failure { container })) => {
            log::warn!("[{}] Default bearer setup failed", emm.ue.label());
            emm.ue.procedure = None;
            emm.send_message(emm_build::attach_reject(EmmCause::EsmFailure, container))?;
            emm.teardown(true);
            Ok(Dispatch::Consumed)
        }
        Input::Peer(PeerEvent::AuthInfo(_)) | Input::Peer(PeerEvent::Esm(EsmEvent::DetachComplete)) => {
            Ok(Dispatch::Consumed)
        }
        Input::Message(_) | Input::ServiceRequest(_) | Input::Peer(PeerEvent::NetworkDetach) => {
            Ok(Dispatch::Deferred)
        }
        Input::Timer { kind, .. } => {
            log::debug!("[{}] {} expiry during bearer setup, ignored", emm.ue.label(), kind);
            Ok(Dispatch::Consumed)
        }
        Input::LowerLayer(event) => {
            log::info!("[{}] Lower layer {:?} during bearer setup", emm.ue.label(), event);
            emm.teardown(event == LowerLayerEvent::Error);
            Ok(Dispatch::Consumed)
        }
    }
}

/// Once both the location update and the bearer are done: allocate a GUTI,
/// send the Attach Accept and install the access-stratum keys
fn complete_bearer_setup(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    if !emm.ue.bearer_setup.is_complete() {
        return Ok(Dispatch::Consumed);
    }
    let container = emm.ue.bearer_setup.esm_container.take().unwrap_or_default();

    let gummei = &emm.env.config.gummei;
    let guti = emm.env.ues.allocate_guti(emm.env.plmn_id, gummei.mme_gid, gummei.mme_code);
    emm.ue.next_guti = Some(guti);

    let message = emm_build::attach_accept(&emm.env.config, &emm.env.plmn_id, guti, container);
    log::info!("[{}] Attach accept (GUTI {})", emm.ue.label(), guti);
    let pdu = emm.send_message(message)?;
    emm.arm_timer(TimerKind::T3450, emm.ue.main, pdu)?;
    install_as_security(emm);

    emm.ue.active = emm.ue.main;
    emm.sched.run_parent();
    Ok(Dispatch::Consumed)
}

fn install_as_security(emm: &mut Emm<'_, '_>) {
    let keys = emm
        .ue
        .security
        .as_ref()
        .and_then(|sc| sc.kenb().map(|kenb| (kenb, sc.ncc_bits())));
    match (emm.ue.session, keys) {
        (Some(session), Some((kenb, ncc))) => emm.env.peers.lower.set_as_security(session, kenb, ncc),
        _ => log::warn!("[{}] No KeNB or connection for AS security", emm.ue.label()),
    }
}

pub fn specific_procedure_message(emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
    match up.message {
        EmmMessage::AttachComplete(complete) => handle_attach_complete(emm, complete),
        EmmMessage::AttachRequest(_) => restart_attach(emm),
        EmmMessage::DetachRequestUe(req) => detach_during_procedure(emm, req),
        other => unexpected(emm, &other),
    }
}

fn handle_attach_complete(emm: &mut Emm<'_, '_>, complete: AttachComplete) -> EmmResult<Dispatch> {
    let expected = matches!(emm.ue.procedure, Some(Procedure::Attach { .. }))
        && emm.ue.next_guti.is_some()
        && emm.ue.timers.is_armed(TimerKind::T3450);
    if !expected {
        log::warn!("[{}] Attach complete without a pending Attach Accept, dropping", emm.ue.label());
        return Ok(Dispatch::Consumed);
    }

    emm.env.peers.esm.process_message(emm.ue.id, complete.esm_container);
    if emm.env.peers.esm.active_sessions(emm.ue.id).is_empty() {
        log::warn!("[{}] Attach complete with no active session, dropping", emm.ue.label());
        return Ok(Dispatch::Consumed);
    }

    emm.stop_timer(TimerKind::T3450);
    commit_guti(emm);
    emm.ue.procedure = None;
    log::info!("[{}] Attach complete", emm.ue.label());
    emm.set_state(EmmState::Registered);
    Ok(Dispatch::Consumed)
}

fn commit_guti(emm: &mut Emm<'_, '_>) {
    if let Some(guti) = emm.ue.next_guti.take() {
        emm.env.ues.bind_guti(emm.ue.id, guti);
        emm.ue.guti = Some(guti);
    }
}

/// A new Attach Request while another procedure runs: abort it and let
/// DE_REGISTERED handle the request
fn restart_attach(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    log::info!("[{}] Attach request in {}, restarting", emm.ue.label(), emm.ue.state);
    emm.stop_all_timers();
    if emm.ue.active != emm.ue.main {
        emm.sched.stop(emm.ue.active);
        emm.ue.active = emm.ue.main;
    }
    if emm.ue.state != EmmState::CommonProcedureInitiated {
        emm.env.peers.esm.release_context(emm.ue.id);
    }
    emm.ue.procedure = None;
    emm.ue.detach = None;
    emm.ue.next_guti = None;
    emm.set_state(EmmState::Deregistered);
    Ok(Dispatch::Deferred)
}

fn detach_during_procedure(emm: &mut Emm<'_, '_>, req: DetachRequestUe) -> EmmResult<Dispatch> {
    log::info!(
        "[{}] Detach request in {} (switch off: {})",
        emm.ue.label(),
        emm.ue.state,
        req.detach_type.switch_off
    );
    if !req.detach_type.switch_off {
        emm.send_message(emm_build::detach_accept())?;
    }
    emm.teardown(true);
    Ok(Dispatch::Consumed)
}

// ============================================================================
// REGISTERED
// ============================================================================

pub fn registered_message(emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
    match up.message {
        EmmMessage::DetachRequestUe(req) => handle_detach_request(emm, req, up.integrity),
        EmmMessage::TrackingAreaUpdateRequest(req) => handle_tau_request(emm, req, up.integrity, up.count),
        EmmMessage::TrackingAreaUpdateComplete => handle_tau_complete(emm),
        EmmMessage::AttachRequest(_) => restart_attach(emm),
        EmmMessage::EmmStatus(cause) => {
            log::warn!("[{}] EMM status ({:?})", emm.ue.label(), cause);
            Ok(Dispatch::Consumed)
        }
        other => unexpected(emm, &other),
    }
}

fn handle_detach_request(emm: &mut Emm<'_, '_>, req: DetachRequestUe, integrity: Integrity) -> EmmResult<Dispatch> {
    if integrity != Integrity::Verified || !ksi_matches(emm, req.ksi) {
        log::warn!(
            "[{}] Detach request failed security check (integrity {:?}, KSI {})",
            emm.ue.label(),
            integrity,
            req.ksi.value
        );
        return Ok(Dispatch::Consumed);
    }

    log::info!(
        "[{}] Detach request (type {}, switch off: {})",
        emm.ue.label(),
        req.detach_type.value,
        req.detach_type.switch_off
    );
    emm.stop_all_timers();
    emm.ue.procedure = None;
    emm.ue.detach = Some(DetachProcedure::Ue {
        detach_type: req.detach_type,
    });
    emm.env.peers.esm.detach(emm.ue.id);
    emm.set_state(EmmState::DeregisteredInitiated);
    Ok(Dispatch::Consumed)
}

fn handle_tau_request(
    emm: &mut Emm<'_, '_>,
    req: TrackingAreaUpdateRequest,
    integrity: Integrity,
    count: Option<u32>,
) -> EmmResult<Dispatch> {
    log::info!(
        "[{}] TAU request ({:?}, active: {}, KSI {})",
        emm.ue.label(),
        req.update_type,
        req.active,
        req.ksi.value
    );
    if let Some(capability) = req.ue_network_capability.clone() {
        emm.ue.ue_network_capability = Some(capability);
    }
    emm.ue.procedure = Some(Procedure::TrackingAreaUpdate {
        update_type: req.update_type,
        active: req.active,
    });

    let count = match count {
        Some(count) if integrity == Integrity::Verified && ksi_matches(emm, req.ksi) => count,
        _ => {
            log::warn!(
                "[{}] TAU request failed security check (integrity {:?}), re-authenticating",
                emm.ue.label(),
                integrity
            );
            return start_authentication(emm);
        }
    };

    if req.active {
        if let Some(sc) = emm.ue.security.as_mut() {
            sc.derive_kenb(count);
        }
    }
    accept_tracking_area_update(emm, req.update_type, req.active)?;
    Ok(Dispatch::Consumed)
}

/// Send the TAU Accept. A periodic update keeps the GUTI and completes at
/// once; otherwise a new GUTI goes out under T3450.
fn accept_tracking_area_update(emm: &mut Emm<'_, '_>, update_type: EpsUpdateType, active: bool) -> EmmResult<()> {
    let guti = if update_type == EpsUpdateType::PeriodicUpdating {
        None
    } else {
        let gummei = &emm.env.config.gummei;
        Some(emm.env.ues.allocate_guti(emm.env.plmn_id, gummei.mme_gid, gummei.mme_code))
    };
    emm.ue.next_guti = guti;

    let message = emm_build::tracking_area_update_accept(
        &emm.env.config,
        &emm.env.plmn_id,
        update_type.accept_result(),
        guti,
    );
    log::info!("[{}] TAU accept (new GUTI: {})", emm.ue.label(), guti.is_some());
    let pdu = emm.send_message(message)?;

    if guti.is_some() {
        emm.arm_timer(TimerKind::T3450, emm.ue.main, pdu)?;
    } else {
        emm.ue.procedure = None;
    }
    if active {
        install_as_security(emm);
    }
    Ok(())
}

fn handle_tau_complete(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    let expected = matches!(emm.ue.procedure, Some(Procedure::TrackingAreaUpdate { .. }))
        && emm.ue.next_guti.is_some()
        && emm.ue.timers.is_armed(TimerKind::T3450);
    if !expected {
        log::warn!("[{}] TAU complete without a pending TAU Accept, dropping", emm.ue.label());
        return Ok(Dispatch::Consumed);
    }
    emm.stop_timer(TimerKind::T3450);
    commit_guti(emm);
    emm.ue.procedure = None;
    log::info!("[{}] TAU complete", emm.ue.label());
    Ok(Dispatch::Consumed)
}

/// Service request in REGISTERED. Without a context matching its KSI the
/// UE is rejected and must authenticate again; a replayed or forged one is
/// dropped.
pub fn handle_service_request(emm: &mut Emm<'_, '_>, sr: ServiceRequest) -> EmmResult<Dispatch> {
    if !sr.known_ksi {
        reject_service_request(emm)?;
        emm.ue.security = None;
        emm.set_state(EmmState::Deregistered);
        return Ok(Dispatch::Consumed);
    }
    let count = match (sr.integrity, sr.count) {
        (Integrity::Verified, Some(count)) => count,
        _ => {
            log::warn!(
                "[{}] Service request (KSI {}) failed integrity check, dropping",
                emm.ue.label(),
                sr.ksi.value
            );
            return Ok(Dispatch::Consumed);
        }
    };

    ue_reachable(emm);
    log::info!("[{}] Service request (KSI {}, UL COUNT {})", emm.ue.label(), sr.ksi.value, count);
    if let Some(sc) = emm.ue.security.as_mut() {
        sc.derive_kenb(count);
    }
    install_as_security(emm);
    Ok(Dispatch::Consumed)
}

pub fn reject_service_request(emm: &mut Emm<'_, '_>) -> EmmResult<()> {
    log::warn!("[{}] Service request cannot be verified, rejecting", emm.ue.label());
    emm.send_with(
        SecurityHeaderType::Plain,
        emm_build::service_reject(EmmCause::UeIdentityCannotBeDerived),
    )?;
    Ok(())
}

/// Connection lost while registered: the UE goes idle and the reachability
/// timers start
pub fn connection_lost(emm: &mut Emm<'_, '_>, event: LowerLayerEvent) -> EmmResult<()> {
    if emm.stop_timer(TimerKind::T3450) {
        log::info!("[{}] Connection lost before TAU complete", emm.ue.label());
        emm.ue.procedure = None;
        emm.ue.next_guti = None;
    }
    if event == LowerLayerEvent::Error {
        emm.release_connection();
    }
    if let Some(session) = emm.ue.session.take() {
        emm.env.ues.unbind_session(session);
    }
    if !emm.ue.timers.is_armed(TimerKind::MobileReachable) {
        emm.arm_timer(TimerKind::MobileReachable, emm.ue.main, None)?;
    }
    Ok(())
}

// ============================================================================
// Detach
// ============================================================================

pub fn handle_network_detach(emm: &mut Emm<'_, '_>, state: EmmState) -> EmmResult<Dispatch> {
    match state {
        EmmState::Registered => {}
        EmmState::Deregistered | EmmState::DeregisteredInitiated => {
            log::debug!("[{}] Network detach in {}, nothing to do", emm.ue.label(), state);
            return Ok(Dispatch::Consumed);
        }
        EmmState::CommonProcedureInitiated | EmmState::SpecificProcedureInitiated => {
            log::info!("[{}] Network detach in {}, aborting", emm.ue.label(), state);
            emm.teardown(true);
            return Ok(Dispatch::Consumed);
        }
    }

    emm.stop_all_timers();
    emm.ue.procedure = None;
    emm.env.peers.esm.detach(emm.ue.id);

    if emm.ue.session.is_none() {
        log::info!("[{}] Network detach of an idle UE, detaching locally", emm.ue.label());
        finish_detach(emm);
        emm.teardown(false);
        return Ok(Dispatch::Consumed);
    }

    log::info!("[{}] Network initiated detach", emm.ue.label());
    let pdu = emm.send_message(emm_build::detach_request(false, None))?;
    emm.arm_timer(TimerKind::T3422, emm.ue.main, pdu)?;
    emm.ue.detach = Some(DetachProcedure::Network);
    emm.set_state(EmmState::DeregisteredInitiated);
    Ok(Dispatch::Consumed)
}

pub fn deregistered_initiated_message(emm: &mut Emm<'_, '_>, up: Uplink) -> EmmResult<Dispatch> {
    match (up.message, emm.ue.detach) {
        (EmmMessage::DetachAccept, Some(DetachProcedure::Network)) => {
            log::info!("[{}] Detach accept", emm.ue.label());
            finish_detach(emm);
            Ok(Dispatch::Consumed)
        }
        (EmmMessage::DetachRequestUe(req), Some(DetachProcedure::Network)) => {
            // both sides detaching at once
            if !req.detach_type.switch_off {
                emm.send_message(emm_build::detach_accept())?;
            }
            finish_detach(emm);
            Ok(Dispatch::Consumed)
        }
        (EmmMessage::AttachRequest(_), _) => restart_attach(emm),
        (other, _) => unexpected(emm, &other),
    }
}

pub fn handle_esm_detach_complete(emm: &mut Emm<'_, '_>) -> EmmResult<Dispatch> {
    match emm.ue.detach {
        Some(DetachProcedure::Ue { detach_type }) => {
            if !detach_type.switch_off {
                emm.send_message(emm_build::detach_accept())?;
            }
            finish_detach(emm);
        }
        Some(DetachProcedure::Network) => {
            log::debug!("[{}] Sessions released, waiting for Detach Accept", emm.ue.label());
        }
        None => log::warn!("[{}] Sessions released without a detach", emm.ue.label()),
    }
    Ok(Dispatch::Consumed)
}

/// Detach done: DE_REGISTERED with the security context destroyed. The
/// context itself stays until the connection goes.
pub fn finish_detach(emm: &mut Emm<'_, '_>) {
    log::info!("[{}] Detached", emm.ue.label());
    emm.stop_all_timers();
    emm.ue.security = None;
    emm.ue.detach = None;
    emm.ue.procedure = None;
    emm.ue.next_guti = None;
    emm.set_state(EmmState::Deregistered);
    emm.release_connection();
}

// ============================================================================
// Timers
// ============================================================================

/// Expiry of a current timer
pub fn handle_timer_expiry(emm: &mut Emm<'_, '_>, kind: TimerKind, expiry: Expiry) -> EmmResult<()> {
    match (kind, expiry) {
        (TimerKind::MobileReachable, _) => {
            log::info!("[{}] Mobile reachable timer expired", emm.ue.label());
            emm.stop_timer(kind);
            emm.arm_timer(TimerKind::ImplicitDetach, emm.ue.main, None)?;
        }
        (TimerKind::ImplicitDetach, _) => {
            log::info!("[{}] Implicit detach timer expired", emm.ue.label());
            emm.stop_timer(kind);
            emm.teardown(false);
        }
        (_, Expiry::Retry(n)) => {
            log::warn!("[{}] {} expired, retransmission #{}", emm.ue.label(), kind, n);
            emm.retransmit(kind);
        }
        (TimerKind::T3422, Expiry::Exhausted) => {
            emm.ue.timers.take(kind);
            log::warn!("[{}] T3422 retries exhausted, detaching locally", emm.ue.label());
            finish_detach(emm);
        }
        (_, Expiry::Exhausted) => {
            emm.ue.timers.take(kind);
            log::warn!("[{}] {} retries exhausted, aborting", emm.ue.label(), kind);
            emm.teardown(true);
        }
    }
    Ok(())
}
