pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod detection;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod services;

pub use adapters::{MarketDataFeed, ReplayFeed};
pub use config::AppConfig;
pub use coordination::{
    ExtremeMarketSource, NoopParticipant, ShutdownConfig, ShutdownController, ShutdownOutcome,
    ShutdownParticipant, ShutdownStatus, TriggerSource,
};
pub use detection::{AnomalyDetector, DetectorConfig, ProtectionRegistry, ProtectionStatus};
pub use error::{Result, TripwireError};
pub use persistence::{FileLock, PersistedStatus, StateStore};
pub use services::{HealthMonitor, HostMetrics, ProcHostMetrics, RecoveryAssessment};
