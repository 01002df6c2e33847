//! MME core runtime
//!
//! Protocol-agnostic building blocks for the MME control plane:
//! - [`timer`]: retransmission timers with bounded retries
//! - [`engine`]: single-threaded signal/process dispatch loop

pub mod engine;
pub mod error;
pub mod timer;

pub use engine::{
    priority_band, Dispatch, Engine, Expiry, ProcessId, Scheduler, Signal, SignalQueue, StateFn,
    Step, PRIORITY_BANDS, PRIORITY_DIVISOR, PRIORITY_HIGH, PRIORITY_NORMAL,
};
pub use error::{CoreError, CoreResult};
pub use timer::{TimerCallbacks, TimerHandle, TimerService};

#[cfg(test)]
mod property_tests;
