use crate::domain::{HealthSnapshot, ShutdownPhase, ShutdownReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Completion time of one shutdown phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: ShutdownPhase,
    pub completed_at: DateTime<Utc>,
}

/// Durable snapshot of the system run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedStatus {
    pub system_running: bool,
    pub shutdown_in_progress: bool,
    pub current_phase: ShutdownPhase,
    pub shutdown_reason: Option<ShutdownReason>,
    pub shutdown_session_id: Option<String>,
    pub shutdown_start_time: Option<DateTime<Utc>>,
    pub shutdown_end_time: Option<DateTime<Utc>>,
    pub phase_timestamps: Vec<PhaseRecord>,
    pub total_duration_secs: Option<f64>,
    pub shutdown_completed: bool,
    pub emergency_shutdown: bool,
    pub error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub system_health: Option<HealthSnapshot>,
    pub protected_symbols: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PersistedStatus {
    fn default() -> Self {
        Self {
            system_running: true,
            shutdown_in_progress: false,
            current_phase: ShutdownPhase::Running,
            shutdown_reason: None,
            shutdown_session_id: None,
            shutdown_start_time: None,
            shutdown_end_time: None,
            phase_timestamps: Vec::new(),
            total_duration_secs: None,
            shutdown_completed: false,
            emergency_shutdown: false,
            error: None,
            last_health_check: None,
            system_health: None,
            protected_symbols: Vec::new(),
            updated_at: None,
        }
    }
}

impl PersistedStatus {
    /// Completion time of a phase, if it was reached
    pub fn phase_completed_at(&self, phase: ShutdownPhase) -> Option<DateTime<Utc>> {
        self.phase_timestamps
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| r.completed_at)
    }

    pub fn record_phase(&mut self, phase: ShutdownPhase, at: DateTime<Utc>) {
        self.current_phase = phase;
        self.phase_timestamps.push(PhaseRecord {
            phase,
            completed_at: at,
        });
    }

    pub fn record_health(&mut self, snapshot: &HealthSnapshot) {
        self.last_health_check = Some(snapshot.timestamp);
        self.system_health = Some(snapshot.clone());
    }

    /// Reset to a fresh running state, keeping the last health reading
    pub fn reset_running(&mut self) {
        let health = self.system_health.take();
        let last_check = self.last_health_check.take();
        *self = PersistedStatus {
            system_health: health,
            last_health_check: last_check,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let status: PersistedStatus =
            serde_json::from_str(r#"{"system_running":false,"current_phase":"PHASE_1_SIGNAL_STOP"}"#)
                .unwrap();
        assert!(!status.system_running);
        assert_eq!(status.current_phase, ShutdownPhase::Phase1SignalStop);
        assert!(!status.shutdown_in_progress);
        assert!(status.protected_symbols.is_empty());
    }

    #[test]
    fn test_record_phase() {
        let mut status = PersistedStatus::default();
        let now = Utc::now();
        status.record_phase(ShutdownPhase::Phase1SignalStop, now);
        assert_eq!(status.current_phase, ShutdownPhase::Phase1SignalStop);
        assert_eq!(status.phase_completed_at(ShutdownPhase::Phase1SignalStop), Some(now));
        assert!(status
            .phase_completed_at(ShutdownPhase::Phase2PositionMonitorOnly)
            .is_none());
    }

    #[test]
    fn test_reset_running_keeps_health() {
        let mut status = PersistedStatus {
            system_running: false,
            shutdown_completed: true,
            emergency_shutdown: true,
            ..Default::default()
        };
        status.record_health(&HealthSnapshot::unavailable("x"));
        status.reset_running();

        assert!(status.system_running);
        assert!(!status.shutdown_completed);
        assert!(!status.emergency_shutdown);
        assert!(status.system_health.is_some());
    }
}
