//! EPS NAS mobility management
//!
//! EMM message model and codec (TS 24.301), plus the security header
//! framing the MME needs to classify and protect NAS PDUs.

pub mod error;
pub mod message;
pub mod security;
pub mod types;


pub use error::{NasError, NasResult};
pub use message::{build_emm_message, parse_emm_message, EmmMessage, EmmMessageType, Link};
pub use security::{get_guti_from_message, split_pdu, NasPdu, SecurityHeaderType};
pub use types::{EmmCause, Guti, KeySetIdentifier, MobileIdentity, PlmnId, UeNetworkCapability};
