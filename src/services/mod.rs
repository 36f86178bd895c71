//! Host health services

pub mod health;
pub mod host_metrics;

pub use health::{HealthCheck, HealthConfig, HealthMonitor, RecoveryAssessment};
pub use host_metrics::{HostMetrics, ProcHostMetrics};
