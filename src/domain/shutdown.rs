use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shutdown state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// New signal generation stopped
    #[serde(rename = "PHASE_1_SIGNAL_STOP")]
    Phase1SignalStop,
    /// No new trades, risk controls still active
    #[serde(rename = "PHASE_2_POSITION_MONITOR_ONLY")]
    Phase2PositionMonitorOnly,
    /// Terminal: orderly shutdown finished
    #[serde(rename = "PHASE_3_COMPLETE")]
    Phase3Complete,
    /// Terminal: a phase failed and the fail-safe path ran
    EmergencyShutdown,
}

impl ShutdownPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPhase::Running => "RUNNING",
            ShutdownPhase::Phase1SignalStop => "PHASE_1_SIGNAL_STOP",
            ShutdownPhase::Phase2PositionMonitorOnly => "PHASE_2_POSITION_MONITOR_ONLY",
            ShutdownPhase::Phase3Complete => "PHASE_3_COMPLETE",
            ShutdownPhase::EmergencyShutdown => "EMERGENCY_SHUTDOWN",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ShutdownPhase) -> bool {
        use ShutdownPhase::*;

        match (self, target) {
            (Running, Phase1SignalStop) => true,
            (Phase1SignalStop, Phase2PositionMonitorOnly) => true,
            (Phase2PositionMonitorOnly, Phase3Complete) => true,

            // Emergency is reachable from any in-progress phase
            (Running, EmergencyShutdown) => true,
            (Phase1SignalStop, EmergencyShutdown) => true,
            (Phase2PositionMonitorOnly, EmergencyShutdown) => true,

            _ => false,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShutdownPhase::Phase3Complete | ShutdownPhase::EmergencyShutdown
        )
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownReason {
    ResourceExhaustion,
    SystemFailure,
    ExtremeMarket,
    Manual,
    Maintenance,
    EmergencyIntervention,
    DataCorruption,
    PerformanceDegradation,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            ShutdownReason::SystemFailure => "SYSTEM_FAILURE",
            ShutdownReason::ExtremeMarket => "EXTREME_MARKET",
            ShutdownReason::Manual => "MANUAL",
            ShutdownReason::Maintenance => "MAINTENANCE",
            ShutdownReason::EmergencyIntervention => "EMERGENCY_INTERVENTION",
            ShutdownReason::DataCorruption => "DATA_CORRUPTION",
            ShutdownReason::PerformanceDegradation => "PERFORMANCE_DEGRADATION",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Urgency attached to a shutdown trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerSeverity {
    Critical,
    Emergency,
    Precautionary,
}

impl TriggerSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSeverity::Critical => "CRITICAL",
            TriggerSeverity::Emergency => "EMERGENCY",
            TriggerSeverity::Precautionary => "PRECAUTIONARY",
        }
    }
}

impl fmt::Display for TriggerSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reason to begin shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownTrigger {
    pub reason: ShutdownReason,
    pub severity: TriggerSeverity,
    pub detail: String,
    pub manual: bool,
    pub raised_at: DateTime<Utc>,
}

impl ShutdownTrigger {
    pub fn new(reason: ShutdownReason, severity: TriggerSeverity, detail: impl Into<String>) -> Self {
        Self {
            reason,
            severity,
            detail: detail.into(),
            manual: false,
            raised_at: Utc::now(),
        }
    }

    /// Build an operator-requested trigger from a free-form reason.
    ///
    /// `maintenance` and `emergency` have dedicated mappings; anything else is
    /// treated as a critical manual stop.
    pub fn manual(reason: &str) -> Self {
        let (mapped, severity) = match reason.trim().to_ascii_lowercase().as_str() {
            "maintenance" => (ShutdownReason::Maintenance, TriggerSeverity::Precautionary),
            "emergency" => (
                ShutdownReason::EmergencyIntervention,
                TriggerSeverity::Emergency,
            ),
            _ => (ShutdownReason::Manual, TriggerSeverity::Critical),
        };

        Self {
            reason: mapped,
            severity,
            detail: format!("manual shutdown requested: {}", reason),
            manual: true,
            raised_at: Utc::now(),
        }
    }

    /// Pick one trigger out of several raised in the same check.
    ///
    /// First CRITICAL wins, then first EMERGENCY, then the first raised.
    pub fn select(triggers: &[ShutdownTrigger]) -> Option<&ShutdownTrigger> {
        triggers
            .iter()
            .find(|t| t.severity == TriggerSeverity::Critical)
            .or_else(|| {
                triggers
                    .iter()
                    .find(|t| t.severity == TriggerSeverity::Emergency)
            })
            .or_else(|| triggers.first())
    }
}
