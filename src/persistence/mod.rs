//! Persistence Layer for Run State and Audit Trail
//!
//! This module provides the durable state shared across processes:
//! - Advisory file locks for cross-process critical sections
//! - Status file rewritten atomically on every transition
//! - Append-only JSON-lines event and protection logs

pub mod file_lock;
pub mod state_store;
pub mod status;

pub use file_lock::FileLock;
pub use state_store::StateStore;
pub use status::{PersistedStatus, PhaseRecord};
