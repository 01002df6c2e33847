//! MME EPS mobility management
//!
//! The EMM layer of an MME: per-subscriber state machines for attach,
//! identification, authentication, security mode control, tracking area
//! update, service request and detach, with NAS security on top of the
//! [`mme_core`] engine.

pub mod config;
pub mod context;
pub mod emm_build;
pub mod emm_handler;
pub mod emm_sm;
pub mod error;
pub mod mme;
pub mod nas_security;
pub mod peers;
pub mod security;

#[cfg(test)]
mod property_tests;

pub use config::{ConfigError, MmeConfig, SecurityPolicy};
pub use context::{SessionId, TimerKind, UeId};
pub use emm_sm::EmmState;
pub use error::{EmmError, EmmResult};
pub use mme::Mme;
pub use peers::{EsmEvent, HssError, Inbound, Outbound, Peers, SessionRegistry};
pub use security::{AuthVector, SecurityContext};
