//! Market anomaly detection and protection windows

pub mod detector;
pub mod history;
pub mod protection;
pub mod rules;

pub use detector::{AnomalyDetector, DetectorConfig, ProtectionStatus};
pub use history::SymbolHistory;
pub use protection::{ProtectionRegistry, ProtectionScope, ProtectionWindow};
pub use rules::default_rules;
