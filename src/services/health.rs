//! Host health monitoring for shutdown decisions
//!
//! Samples host resources, scores them, and derives shutdown triggers.
//! Sampling failures never propagate: they produce a zero-score snapshot.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::host_metrics::HostMetrics;
use crate::domain::{HealthSnapshot, ShutdownReason, ShutdownTrigger, TriggerSeverity};

/// Thresholds for triggers and recovery assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Memory usage above this is a critical trigger
    pub memory_critical_pct: f64,
    /// Free disk below this is a critical trigger
    pub disk_min_free_gb: f64,
    /// CPU usage above this is an emergency trigger
    pub cpu_emergency_pct: f64,
    /// Score a stopped system must exceed to be restartable
    pub recovery_min_score: f64,
    pub memory_warn_pct: f64,
    pub disk_warn_free_gb: f64,
    pub cpu_warn_pct: f64,
    /// Filesystem whose free space is measured
    pub disk_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_critical_pct: 90.0,
            disk_min_free_gb: 1.0,
            cpu_emergency_pct: 95.0,
            recovery_min_score: 70.0,
            memory_warn_pct: 80.0,
            disk_warn_free_gb: 2.0,
            cpu_warn_pct: 80.0,
            disk_path: "/".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("health.memory_critical_pct", self.memory_critical_pct),
            ("health.cpu_emergency_pct", self.cpu_emergency_pct),
            ("health.memory_warn_pct", self.memory_warn_pct),
            ("health.cpu_warn_pct", self.cpu_warn_pct),
            ("health.recovery_min_score", self.recovery_min_score),
        ] {
            if value <= 0.0 || value > 100.0 {
                errors.push(format!("{} must be in (0, 100], got {}", name, value));
            }
        }
        if self.disk_min_free_gb <= 0.0 {
            errors.push("health.disk_min_free_gb must be positive".to_string());
        }
        if self.disk_warn_free_gb <= 0.0 {
            errors.push("health.disk_warn_free_gb must be positive".to_string());
        }
        if self.disk_path.is_empty() {
            errors.push("health.disk_path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub snapshot: HealthSnapshot,
    /// In evaluation order: memory, disk, CPU
    pub triggers: Vec<ShutdownTrigger>,
}

/// Whether a stopped system may be restarted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAssessment {
    pub can_recover: bool,
    /// `None` when the system is running and health was not sampled
    pub health_score: Option<f64>,
    pub recommendations: Vec<String>,
}

/// Health monitor
pub struct HealthMonitor {
    metrics: Arc<dyn HostMetrics>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<dyn HostMetrics>, config: HealthConfig) -> Self {
        Self { metrics, config }
    }

    /// Sample the host on the blocking pool
    pub async fn snapshot(&self) -> HealthSnapshot {
        let metrics = self.metrics.clone();
        match tokio::task::spawn_blocking(move || metrics.sample()).await {
            Ok(Ok(sample)) => HealthSnapshot::from_sample(sample),
            Ok(Err(e)) => {
                warn!("Host metrics unavailable: {}", e);
                HealthSnapshot::unavailable(e.to_string())
            }
            Err(e) => {
                warn!("Host metrics task failed: {}", e);
                HealthSnapshot::unavailable(e.to_string())
            }
        }
    }

    /// Sample the host and derive shutdown triggers
    pub async fn check(&self) -> HealthCheck {
        let snapshot = self.snapshot().await;
        let triggers = self.evaluate(&snapshot);

        debug!(
            "Health check: score {:.1}, {} triggers",
            snapshot.health_score,
            triggers.len()
        );
        HealthCheck { snapshot, triggers }
    }

    /// Triggers for a snapshot; a synthetic snapshot raises none
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> Vec<ShutdownTrigger> {
        let mut triggers = Vec::new();
        if !snapshot.is_available() {
            return triggers;
        }

        if snapshot.memory_pct > self.config.memory_critical_pct {
            triggers.push(ShutdownTrigger::new(
                ShutdownReason::ResourceExhaustion,
                TriggerSeverity::Critical,
                format!(
                    "memory usage {:.1}% above {:.1}%",
                    snapshot.memory_pct, self.config.memory_critical_pct
                ),
            ));
        }

        if snapshot.disk_free_gb < self.config.disk_min_free_gb {
            triggers.push(ShutdownTrigger::new(
                ShutdownReason::ResourceExhaustion,
                TriggerSeverity::Critical,
                format!(
                    "free disk {:.2}GB below {:.2}GB",
                    snapshot.disk_free_gb, self.config.disk_min_free_gb
                ),
            ));
        }

        if snapshot.cpu_pct > self.config.cpu_emergency_pct {
            triggers.push(ShutdownTrigger::new(
                ShutdownReason::SystemFailure,
                TriggerSeverity::Emergency,
                format!(
                    "CPU usage {:.1}% above {:.1}%",
                    snapshot.cpu_pct, self.config.cpu_emergency_pct
                ),
            ));
        }

        triggers
    }

    /// Score gate plus independent recommendations
    pub fn assess_recovery(&self, snapshot: &HealthSnapshot) -> RecoveryAssessment {
        let mut recommendations = Vec::new();

        if snapshot.is_available() {
            if snapshot.memory_pct > self.config.memory_warn_pct {
                recommendations.push("free memory".to_string());
            }
            if snapshot.disk_free_gb < self.config.disk_warn_free_gb {
                recommendations.push("free disk".to_string());
            }
            if snapshot.cpu_pct > self.config.cpu_warn_pct {
                recommendations.push("reduce CPU load".to_string());
            }
        } else {
            recommendations.push("restore host metrics collection".to_string());
        }

        RecoveryAssessment {
            can_recover: snapshot.health_score > self.config.recovery_min_score,
            health_score: Some(snapshot.health_score),
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HostSample;
    use crate::services::host_metrics::MockHostMetrics;
    use crate::TripwireError;

    fn monitor_returning(sample: HostSample) -> HealthMonitor {
        let mut mock = MockHostMetrics::new();
        mock.expect_sample().returning(move || Ok(sample));
        HealthMonitor::new(Arc::new(mock), HealthConfig::default())
    }

    fn healthy() -> HostSample {
        HostSample {
            cpu_pct: 20.0,
            memory_pct: 40.0,
            memory_available_gb: 8.0,
            disk_free_gb: 50.0,
            disk_used_pct: 30.0,
            network_connections: 12,
        }
    }

    #[tokio::test]
    async fn test_healthy_host_has_no_triggers() {
        let monitor = monitor_returning(healthy());
        let check = monitor.check().await;
        assert!(check.triggers.is_empty());
        assert!(ShutdownTrigger::select(&check.triggers).is_none());
        assert!(check.snapshot.health_score > 70.0);
    }

    #[tokio::test]
    async fn test_all_triggers_fire_and_critical_wins() {
        let monitor = monitor_returning(HostSample {
            cpu_pct: 99.0,
            memory_pct: 95.0,
            disk_free_gb: 0.5,
            ..healthy()
        });

        let check = monitor.check().await;
        assert_eq!(check.triggers.len(), 3);
        let selected = ShutdownTrigger::select(&check.triggers).unwrap();
        assert_eq!(selected.reason, ShutdownReason::ResourceExhaustion);
        assert_eq!(selected.severity, TriggerSeverity::Critical);
        assert!(selected.detail.contains("memory"));
    }

    #[tokio::test]
    async fn test_cpu_only_is_emergency() {
        let monitor = monitor_returning(HostSample {
            cpu_pct: 97.0,
            ..healthy()
        });

        let check = monitor.check().await;
        let selected = ShutdownTrigger::select(&check.triggers).unwrap();
        assert_eq!(selected.reason, ShutdownReason::SystemFailure);
        assert_eq!(selected.severity, TriggerSeverity::Emergency);
    }

    #[tokio::test]
    async fn test_sampling_failure_yields_zero_score() {
        let mut mock = MockHostMetrics::new();
        mock.expect_sample()
            .returning(|| Err(TripwireError::HostMetrics("procfs missing".to_string())));
        let monitor = HealthMonitor::new(Arc::new(mock), HealthConfig::default());

        let check = monitor.check().await;
        assert_eq!(check.snapshot.health_score, 0.0);
        assert!(!check.snapshot.is_available());
        assert!(check.triggers.is_empty());

        let recovery = monitor.assess_recovery(&check.snapshot);
        assert!(!recovery.can_recover);
    }

    #[test]
    fn test_recovery_thresholds_are_independent() {
        let monitor = HealthMonitor::new(Arc::new(MockHostMetrics::new()), HealthConfig::default());

        // Score (100 - 10 + 100 - 85 + 100) / 3 = 68.3 with memory warning
        let low = HealthSnapshot::from_sample(HostSample {
            cpu_pct: 10.0,
            memory_pct: 85.0,
            disk_free_gb: 20.0,
            ..Default::default()
        });
        let assessment = monitor.assess_recovery(&low);
        assert!(!assessment.can_recover);
        assert_eq!(assessment.recommendations, vec!["free memory".to_string()]);

        // Score above 70 while the disk warning still applies
        let mixed = HealthSnapshot::from_sample(HostSample {
            cpu_pct: 0.0,
            memory_pct: 0.0,
            disk_free_gb: 1.5,
            ..Default::default()
        });
        let assessment = monitor.assess_recovery(&mixed);
        assert!(assessment.can_recover);
        assert_eq!(assessment.recommendations, vec!["free disk".to_string()]);
    }
}
