//! Shared message pipeline (C7) — channel-agnostic drain/batch/dispatch.
//!
//! Channel adapters (gateway, discord, telegram) enqueue inbound messages
//! into `skynet-queue` and call `DrainCoordinator::spawn_if_idle` to make
//! sure exactly one drain loop runs per chat; everything from batch claim
//! through sandbox dispatch to delivery lives here, once.

pub mod compact;
pub mod context;
pub mod process;
pub mod slash;

pub use compact::compact_session_if_needed;
pub use context::MessageContext;
pub use process::{DrainCoordinator, ProcessedMessage};
