//! Graduated shutdown controller
//!
//! Runs the three-phase shutdown sequence:
//! 1. Stop new signal generation
//! 2. Stop new trade execution, keep risk controls (position monitor only)
//! 3. Persist the terminal state and mark the system stopped
//!
//! Only one sequence can run at a time, across threads and processes. A
//! failure in any phase aborts the rest and takes the emergency path, which
//! always leaves the system stopped.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::triggers::TriggerSource;
use crate::domain::{HealthSnapshot, ShutdownPhase, ShutdownTrigger};
use crate::error::{Result, TripwireError};
use crate::persistence::{FileLock, PersistedStatus, StateStore};
use crate::services::{HealthMonitor, RecoveryAssessment};

const SHUTDOWN_LOCK: &str = "shutdown";

/// Configuration for the shutdown sequence and its monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait after phase 1 before stopping trade execution (default: 5s)
    pub signal_stop_buffer_ms: u64,
    /// Wait after phase 2 before finalizing (default: 30s)
    pub position_monitor_buffer_ms: u64,
    /// Health monitor period (default: 30s)
    pub monitor_interval_secs: u64,
    /// How long an EXTREME full-shutdown anomaly keeps requesting shutdown
    pub extreme_market_window_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            signal_stop_buffer_ms: 5_000,
            position_monitor_buffer_ms: 30_000,
            monitor_interval_secs: 30,
            extreme_market_window_secs: 300,
        }
    }
}

impl ShutdownConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.monitor_interval_secs == 0 {
            errors.push("shutdown.monitor_interval_secs must be positive".to_string());
        }
        if self.extreme_market_window_secs == 0 {
            errors.push("shutdown.extreme_market_window_secs must be positive".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Components that stop work as the shutdown advances
#[async_trait]
pub trait ShutdownParticipant: Send + Sync {
    /// Phase 1: stop producing new trading signals
    async fn stop_signal_generation(&self) -> Result<()>;
    /// Phase 2: stop opening trades; risk controls keep running
    async fn stop_trade_execution(&self) -> Result<()>;
    /// Phase 3: flush and release whatever is left
    async fn finalize(&self) -> Result<()>;
}

/// Participant for deployments with nothing to notify
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopParticipant;

#[async_trait]
impl ShutdownParticipant for NoopParticipant {
    async fn stop_signal_generation(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_trade_execution(&self) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// Result of a shutdown request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShutdownOutcome {
    Completed {
        session_id: String,
        duration_secs: f64,
    },
    /// A phase failed and the emergency path ran; the system is stopped
    Emergency { session_id: String, error: String },
    /// Another shutdown holds the single-flight guard or the system is already stopped
    Rejected { reason: String },
}

impl ShutdownOutcome {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ShutdownOutcome::Completed { session_id, .. }
            | ShutdownOutcome::Emergency { session_id, .. } => Some(session_id),
            ShutdownOutcome::Rejected { .. } => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ShutdownOutcome::Rejected { .. })
    }
}

/// Persisted status plus a live health reading when the system is running
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownStatus {
    #[serde(flatten)]
    pub status: PersistedStatus,
    pub current_health: Option<HealthSnapshot>,
}

/// Shutdown controller
pub struct ShutdownController {
    config: ShutdownConfig,
    store: StateStore,
    health: Arc<HealthMonitor>,
    participant: Arc<dyn ShutdownParticipant>,
    in_progress: AtomicBool,
    monitoring: AtomicBool,
    phase_tx: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownController {
    pub fn new(config: ShutdownConfig, store: StateStore, health: Arc<HealthMonitor>) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            store,
            health,
            participant: Arc::new(NoopParticipant),
            in_progress: AtomicBool::new(false),
            monitoring: AtomicBool::new(false),
            phase_tx,
            phase_rx,
        }
    }

    pub fn with_participant(mut self, participant: Arc<dyn ShutdownParticipant>) -> Self {
        self.participant = participant;
        self
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }

    /// Phase of the sequence running in this process
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Record a fresh running state at process start
    pub async fn mark_system_started(&self) -> Result<()> {
        if self.in_progress.load(Ordering::SeqCst) {
            return Err(TripwireError::Internal(
                "cannot mark started while a shutdown is in progress".to_string(),
            ));
        }

        self.store.update_status(|status| status.reset_running()).await?;
        let _ = self.phase_tx.send(ShutdownPhase::Running);
        info!("System marked as running");
        Ok(())
    }

    /// Run the full shutdown sequence for a trigger.
    ///
    /// Holds the cross-process shutdown lock until the sequence ends. A
    /// concurrent caller is rejected immediately instead of waiting.
    pub async fn initiate_shutdown(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already in progress, rejecting {}", trigger.reason);
            return ShutdownOutcome::Rejected {
                reason: "shutdown already in progress".to_string(),
            };
        }

        let outcome = self.run_single_flight(trigger).await;
        self.in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_single_flight(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        let lock_path = self.store.lock_path(SHUTDOWN_LOCK);
        let lock = match tokio::task::spawn_blocking(move || FileLock::try_acquire(lock_path)).await {
            Ok(Ok(Some(lock))) => lock,
            Ok(Ok(None)) => {
                warn!("Another process holds the shutdown lock, rejecting {}", trigger.reason);
                return ShutdownOutcome::Rejected {
                    reason: "shutdown in progress in another process".to_string(),
                };
            }
            Ok(Err(e)) => {
                error!("Shutdown lock unavailable: {}", e);
                return ShutdownOutcome::Rejected {
                    reason: format!("shutdown lock unavailable: {}", e),
                };
            }
            Err(e) => {
                error!("Shutdown lock task failed: {}", e);
                return ShutdownOutcome::Rejected {
                    reason: format!("shutdown lock task failed: {}", e),
                };
            }
        };

        match self.store.load_status().await {
            Ok(status) if status.shutdown_in_progress => {
                warn!("Persisted status reports a shutdown in progress, rejecting");
                return ShutdownOutcome::Rejected {
                    reason: "persisted status reports a shutdown in progress".to_string(),
                };
            }
            Ok(status) if !status.system_running => {
                warn!("System already stopped, rejecting {}", trigger.reason);
                return ShutdownOutcome::Rejected {
                    reason: "system is not running".to_string(),
                };
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read persisted status, continuing: {}", e),
        }

        // A restart recorded by another process leaves this phase stale
        let previous = self.current_phase();
        if previous.is_terminal() {
            debug!("Resetting phase {} from the previous session", previous);
            let _ = self.phase_tx.send(ShutdownPhase::Running);
        }

        let outcome = self.run_session(trigger).await;
        drop(lock);
        outcome
    }

    async fn run_session(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        let session_id = format!("shutdown-{}", Uuid::new_v4());
        let started_at = Utc::now();
        let started = Instant::now();
        let snapshot = self.health.snapshot().await;

        warn!(
            "Initiating shutdown {}: {} ({}, manual: {}) - {}",
            session_id, trigger.reason, trigger.severity, trigger.manual, trigger.detail
        );

        let sid = session_id.clone();
        let reason = trigger.reason;
        let start_snapshot = snapshot.clone();
        if let Err(e) = self
            .store
            .update_status(move |status| {
                status.shutdown_in_progress = true;
                status.current_phase = ShutdownPhase::Running;
                status.shutdown_reason = Some(reason);
                status.shutdown_session_id = Some(sid);
                status.shutdown_start_time = Some(started_at);
                status.shutdown_end_time = None;
                status.phase_timestamps.clear();
                status.total_duration_secs = None;
                status.shutdown_completed = false;
                status.emergency_shutdown = false;
                status.error = None;
                status.record_health(&start_snapshot);
            })
            .await
        {
            error!("Failed to persist shutdown start for {}: {}", session_id, e);
        }

        self.log_entry(
            &session_id,
            "SHUTDOWN_INITIATED",
            json!({
                "reason": trigger.reason.as_str(),
                "severity": trigger.severity.as_str(),
                "manual": trigger.manual,
                "detail": trigger.detail,
                "health": serde_json::to_value(&snapshot).unwrap_or_default(),
            }),
        )
        .await;

        match self.run_phases(&session_id, started).await {
            Ok(duration_secs) => {
                info!("Shutdown {} completed in {:.1}s", session_id, duration_secs);
                ShutdownOutcome::Completed {
                    session_id,
                    duration_secs,
                }
            }
            Err(e) => {
                self.emergency_shutdown(&session_id, &e, started).await;
                ShutdownOutcome::Emergency {
                    session_id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_phases(&self, session_id: &str, started: Instant) -> Result<f64> {
        // Phase 1
        self.participant
            .stop_signal_generation()
            .await
            .map_err(|e| TripwireError::phase(ShutdownPhase::Phase1SignalStop, e))?;
        self.complete_phase(session_id, ShutdownPhase::Phase1SignalStop, "signal generation stopped")
            .await?;
        tokio::time::sleep(Duration::from_millis(self.config.signal_stop_buffer_ms)).await;

        // Phase 2
        self.participant
            .stop_trade_execution()
            .await
            .map_err(|e| TripwireError::phase(ShutdownPhase::Phase2PositionMonitorOnly, e))?;
        self.complete_phase(
            session_id,
            ShutdownPhase::Phase2PositionMonitorOnly,
            "trade execution stopped, risk controls active",
        )
        .await?;
        tokio::time::sleep(Duration::from_millis(self.config.position_monitor_buffer_ms)).await;

        // Phase 3
        self.participant
            .finalize()
            .await
            .map_err(|e| TripwireError::phase(ShutdownPhase::Phase3Complete, e))?;
        self.transition(ShutdownPhase::Phase3Complete)?;

        let duration_secs = started.elapsed().as_secs_f64();
        let now = Utc::now();
        if let Err(e) = self
            .store
            .update_status(move |status| {
                status.record_phase(ShutdownPhase::Phase3Complete, now);
                status.system_running = false;
                status.shutdown_in_progress = false;
                status.shutdown_completed = true;
                status.shutdown_end_time = Some(now);
                status.total_duration_secs = Some(duration_secs);
            })
            .await
        {
            error!("Failed to persist final state for {}: {}", session_id, e);
        }

        self.log_entry(
            session_id,
            ShutdownPhase::Phase3Complete.as_str(),
            json!({
                "detail": "system stopped",
                "total_duration_secs": duration_secs,
            }),
        )
        .await;

        Ok(duration_secs)
    }

    fn transition(&self, phase: ShutdownPhase) -> Result<()> {
        let current = *self.phase_rx.borrow();
        if !current.can_transition_to(phase) {
            return Err(TripwireError::phase(
                phase,
                format!("invalid transition from {}", current),
            ));
        }
        let _ = self.phase_tx.send(phase);
        info!("Shutdown phase: {}", phase);
        Ok(())
    }

    /// Move to a phase, persist it and log its completion
    async fn complete_phase(&self, session_id: &str, phase: ShutdownPhase, detail: &str) -> Result<()> {
        self.transition(phase)?;

        let now = Utc::now();
        if let Err(e) = self
            .store
            .update_status(move |status| status.record_phase(phase, now))
            .await
        {
            error!("Failed to persist {} for {}: {}", phase, session_id, e);
        }

        self.log_entry(session_id, phase.as_str(), json!({ "detail": detail }))
            .await;
        Ok(())
    }

    async fn emergency_shutdown(&self, session_id: &str, cause: &TripwireError, started: Instant) {
        error!("Shutdown {} failed, running emergency shutdown: {}", session_id, cause);
        let _ = self.phase_tx.send(ShutdownPhase::EmergencyShutdown);

        let message = cause.to_string();
        let duration_secs = started.elapsed().as_secs_f64();
        let now = Utc::now();
        let persisted_message = message.clone();
        if let Err(e) = self
            .store
            .update_status(move |status| {
                status.current_phase = ShutdownPhase::EmergencyShutdown;
                status.system_running = false;
                status.shutdown_in_progress = false;
                status.shutdown_completed = true;
                status.emergency_shutdown = true;
                status.error = Some(persisted_message);
                status.shutdown_end_time = Some(now);
                status.total_duration_secs = Some(duration_secs);
            })
            .await
        {
            error!("Failed to persist emergency state for {}: {}", session_id, e);
        }

        self.log_entry(
            session_id,
            ShutdownPhase::EmergencyShutdown.as_str(),
            json!({ "error": message }),
        )
        .await;
    }

    async fn log_entry(&self, session_id: &str, phase: &str, details: serde_json::Value) {
        let entry = json!({
            "shutdown_id": session_id,
            "phase": phase,
            "details": details,
        });
        if let Err(e) = self.store.append_event(entry).await {
            error!("Failed to log {} for {}: {}", phase, session_id, e);
        }
    }

    /// Operator-requested shutdown
    pub async fn manual_shutdown(&self, reason: &str) -> ShutdownOutcome {
        let trigger = ShutdownTrigger::manual(reason);
        info!(
            "Manual shutdown '{}' mapped to {} / {}",
            reason, trigger.reason, trigger.severity
        );
        self.initiate_shutdown(trigger).await
    }

    /// Whether the persisted status says the system is running
    pub async fn is_system_running(&self) -> bool {
        match self.store.load_status().await {
            Ok(status) => status.system_running,
            Err(e) => {
                warn!("Could not read status, using in-process view: {}", e);
                !self.in_progress.load(Ordering::SeqCst) && self.current_phase() == ShutdownPhase::Running
            }
        }
    }

    pub async fn get_shutdown_status(&self) -> Result<ShutdownStatus> {
        let status = self.store.load_status().await?;
        let current_health = if status.system_running {
            Some(self.health.snapshot().await)
        } else {
            None
        };
        Ok(ShutdownStatus {
            status,
            current_health,
        })
    }

    /// Whether a stopped system is healthy enough to restart.
    ///
    /// A running system reports recoverable without sampling the host.
    pub async fn recovery_check(&self) -> RecoveryAssessment {
        if self.is_system_running().await {
            return RecoveryAssessment {
                can_recover: true,
                health_score: None,
                recommendations: Vec::new(),
            };
        }

        let snapshot = self.health.snapshot().await;
        let assessment = self.health.assess_recovery(&snapshot);
        info!(
            "Recovery check: score {:.1}, can_recover {}",
            snapshot.health_score, assessment.can_recover
        );
        assessment
    }

    /// Watch health and external trigger sources until one asks for shutdown.
    ///
    /// Exits after the shutdown it starts, when the system is no longer
    /// running, or after `stop_monitoring`. It does not resume by itself.
    pub async fn start_monitoring(
        self: Arc<Self>,
        sources: Vec<Arc<dyn TriggerSource>>,
    ) -> Option<ShutdownOutcome> {
        self.monitoring.store(true, Ordering::SeqCst);
        info!(
            "Shutdown monitoring started (every {}s, {} extra sources)",
            self.config.monitor_interval_secs,
            sources.len()
        );

        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.monitor_interval_secs.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            timer.tick().await;
            if !self.monitoring.load(Ordering::SeqCst) {
                break None;
            }
            if !self.is_system_running().await {
                info!("System not running, monitoring exits");
                break None;
            }

            let check = self.health.check().await;
            let snapshot = check.snapshot.clone();
            if let Err(e) = self
                .store
                .update_status(move |status| status.record_health(&snapshot))
                .await
            {
                warn!("Failed to persist health check: {}", e);
            }

            let mut triggers = check.triggers;
            for source in &sources {
                if let Some(trigger) = source.poll().await {
                    debug!("Trigger source {} raised {}", source.name(), trigger.reason);
                    triggers.push(trigger);
                }
            }

            if let Some(trigger) = ShutdownTrigger::select(&triggers).cloned() {
                warn!(
                    "Shutdown trigger {} ({}): {}",
                    trigger.reason, trigger.severity, trigger.detail
                );
                break Some(self.initiate_shutdown(trigger).await);
            }
        };

        self.monitoring.store(false, Ordering::SeqCst);
        info!("Shutdown monitoring stopped");
        outcome
    }

    /// Ask the monitoring loop to exit on its next tick
    pub fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }
}
