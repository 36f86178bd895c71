//! Shutdown coordination
//!
//! - Graduated three-phase shutdown with single-flight guarantee
//! - Participants notified at each phase
//! - Trigger sources polled alongside host health

pub mod shutdown;
pub mod triggers;

pub use shutdown::{
    NoopParticipant, ShutdownConfig, ShutdownController, ShutdownOutcome, ShutdownParticipant,
    ShutdownStatus,
};
pub use triggers::{ExtremeMarketSource, TriggerSource};
