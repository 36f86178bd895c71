//! Market anomaly detector
//!
//! Keeps bounded per-symbol history, evaluates every detection rule on each
//! new sample, and turns matches into `AnomalyEvent`s with protection windows.
//! Rules are evaluated independently, so one sample may produce several events
//! for the same symbol; the last one applied sets the window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{SymbolHistory, DEFAULT_PRICE_CAPACITY, DEFAULT_VOLUME_CAPACITY};
use super::protection::{ProtectionRegistry, ProtectionScope};
use super::rules::default_rules;
use crate::adapters::MarketDataFeed;
use crate::domain::{AnomalyEvent, DetectionRule, MarketSample, Severity, SystemAction, TriggerConditions};
use crate::error::{Result, TripwireError};
use crate::persistence::{FileLock, StateStore};

const PROTECTION_LOCK: &str = "protection";

/// Configuration for anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Symbols polled on every tick
    pub symbols: Vec<String>,
    /// Seconds between ticks
    pub interval_secs: u64,
    pub price_history_capacity: usize,
    pub volume_history_capacity: usize,
    /// Number of preceding volume samples averaged for the spike baseline
    pub volume_baseline_window: usize,
    /// Events kept in memory for status queries
    pub max_retained_events: usize,
    /// Window for the "recent events" count in status queries
    pub recent_event_window_secs: u64,
    pub rules: Vec<DetectionRule>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            interval_secs: 30,
            price_history_capacity: DEFAULT_PRICE_CAPACITY,
            volume_history_capacity: DEFAULT_VOLUME_CAPACITY,
            volume_baseline_window: 30,
            max_retained_events: 1000,
            recent_event_window_secs: 3600,
            rules: default_rules(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() {
            errors.push("detection.symbols must not be empty".to_string());
        }
        if self.interval_secs == 0 {
            errors.push("detection.interval_secs must be positive".to_string());
        }
        if self.volume_baseline_window == 0 {
            errors.push("detection.volume_baseline_window must be positive".to_string());
        }
        if self.rules.is_empty() {
            errors.push("detection.rules must not be empty".to_string());
        }
        for rule in &self.rules {
            if let Err(e) = rule.validate() {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Snapshot answered to the trading pipeline and operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionStatus {
    pub monitoring_active: bool,
    pub protected_symbols: Vec<String>,
    pub recent_event_count: usize,
    pub total_event_count: u64,
}

#[derive(Debug, Clone)]
struct RuleMatch {
    reference: MarketSample,
    current: MarketSample,
    drop_pct: Decimal,
    volume_multiplier: Option<Decimal>,
    volume_spike: bool,
}

#[derive(Debug, Default)]
struct DetectorState {
    histories: HashMap<String, SymbolHistory>,
    /// Consecutive matching evaluations per (symbol, rule index)
    streaks: HashMap<(String, usize), u32>,
    events: VecDeque<AnomalyEvent>,
    total_events: u64,
}

/// Anomaly detector and owner of the protection registry
pub struct AnomalyDetector {
    config: DetectorConfig,
    store: StateStore,
    registry: ProtectionRegistry,
    state: Mutex<DetectorState>,
    protection_guard: tokio::sync::Mutex<()>,
    monitoring_active: AtomicBool,
    event_tx: broadcast::Sender<AnomalyEvent>,
}

impl AnomalyDetector {
    /// Create a detector; rejects invalid rule definitions
    pub fn new(config: DetectorConfig, store: StateStore) -> Result<Self> {
        for rule in &config.rules {
            rule.validate().map_err(TripwireError::InvalidRule)?;
        }

        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            store,
            registry: ProtectionRegistry::new(),
            state: Mutex::new(DetectorState::default()),
            protection_guard: tokio::sync::Mutex::new(()),
            monitoring_active: AtomicBool::new(false),
            event_tx,
        })
    }

    /// Subscribe to emitted anomaly events
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a symbol is inside an active protection window.
    ///
    /// Safe to call without the protection lock; evicts lapsed windows.
    pub fn is_symbol_protected(&self, symbol: &str) -> bool {
        self.registry.is_symbol_protected(symbol)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DetectorState>> {
        self.state
            .lock()
            .map_err(|_| TripwireError::Internal("detector state lock poisoned".to_string()))
    }

    /// Append a sample to history and evaluate every rule against it.
    ///
    /// Returns the events that fired; protection is not applied here.
    pub fn evaluate(&self, sample: MarketSample) -> Result<Vec<AnomalyEvent>> {
        sample.validate()?;

        let mut guard = self.lock_state()?;
        let DetectorState {
            histories, streaks, ..
        } = &mut *guard;
        let symbol = sample.symbol.clone();
        let price_cap = self.config.price_history_capacity;
        let volume_cap = self.config.volume_history_capacity;

        let history = histories
            .entry(symbol.clone())
            .or_insert_with(|| SymbolHistory::new(price_cap, volume_cap));
        history.push(sample);
        let history = &*history;

        let mut events = Vec::new();
        for (idx, rule) in self.config.rules.iter().enumerate() {
            if !self.rule_due(rule, history.samples_seen()) {
                continue;
            }

            let key = (symbol.clone(), idx);
            let matched = match self.match_rule(history, rule) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Rule {} failed for {}: {}", rule.kind, symbol, e);
                    continue;
                }
            };

            let Some(matched) = matched else {
                streaks.remove(&key);
                continue;
            };

            let streak = streaks.entry(key.clone()).or_insert(0);
            *streak += 1;
            if *streak < rule.confirmation_count {
                debug!(
                    "{} {}: match {}/{} awaiting confirmation",
                    symbol, rule.kind, streak, rule.confirmation_count
                );
                continue;
            }
            streaks.remove(&key);

            events.push(build_event(rule, matched));
        }

        Ok(events)
    }

    /// Rules with a longer monitoring interval than the tick run on every Nth sample
    fn rule_due(&self, rule: &DetectionRule, samples_seen: u64) -> bool {
        let tick = self.config.interval_secs.max(1);
        let stride = rule.monitoring_interval_secs.div_ceil(tick).max(1);
        samples_seen.saturating_sub(1) % stride == 0
    }

    fn match_rule(&self, history: &SymbolHistory, rule: &DetectionRule) -> Result<Option<RuleMatch>> {
        let Some(current) = history.latest() else {
            return Ok(None);
        };
        let Some(reference) = history.reference_sample(rule.timeframe()) else {
            return Ok(None);
        };

        let drop_pct = reference
            .price
            .checked_sub(current.price)
            .and_then(|d| d.checked_div(reference.price))
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(|| {
                TripwireError::Internal(format!(
                    "drop computation overflow ({} -> {})",
                    reference.price, current.price
                ))
            })?;

        if drop_pct < rule.threshold_pct {
            return Ok(None);
        }

        let (volume_multiplier, volume_spike) = match rule.volume_multiplier {
            Some(required) => {
                let multiplier = history.volume_multiplier(self.config.volume_baseline_window);
                let spike = multiplier.map(|m| m >= required).unwrap_or(false);
                if !spike {
                    return Ok(None);
                }
                (multiplier, spike)
            }
            None => (None, false),
        };

        Ok(Some(RuleMatch {
            reference: reference.clone(),
            current: current.clone(),
            drop_pct,
            volume_multiplier,
            volume_spike,
        }))
    }

    /// Evaluate a sample and apply protection for every event it produces.
    ///
    /// Protected symbols are skipped without touching their history.
    pub async fn process_sample(&self, sample: MarketSample) -> Vec<AnomalyEvent> {
        if self.is_symbol_protected(&sample.symbol) {
            debug!("{} is protected, skipping sample", sample.symbol);
            return Vec::new();
        }
        self.evaluate_and_apply(sample).await
    }

    async fn evaluate_and_apply(&self, sample: MarketSample) -> Vec<AnomalyEvent> {
        let symbol = sample.symbol.clone();
        let events = match self.evaluate(sample) {
            Ok(events) => events,
            Err(e) => {
                warn!("Evaluation failed for {}: {}", symbol, e);
                return Vec::new();
            }
        };

        for event in &events {
            self.apply_event(event).await;
        }
        events
    }

    /// Run one detection pass over every configured symbol
    pub async fn tick(&self, feed: &dyn MarketDataFeed) -> Vec<AnomalyEvent> {
        let mut emitted = Vec::new();

        for symbol in &self.config.symbols {
            if self.is_symbol_protected(symbol) {
                debug!("{} is protected, skipping", symbol);
                continue;
            }

            let sample = match feed.get_sample(symbol).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("No sample for {}: {}", symbol, e);
                    continue;
                }
            };

            if sample.symbol != *symbol {
                warn!("Feed returned {} when asked for {}", sample.symbol, symbol);
                continue;
            }

            emitted.extend(self.evaluate_and_apply(sample).await);
        }

        emitted
    }

    /// Install the event's protection window and record it.
    ///
    /// Persistence failures are logged and do not undo the in-memory window.
    pub async fn apply_event(&self, event: &AnomalyEvent) {
        let scope = if event.action.scope.is_global() {
            ProtectionScope::AllSymbols
        } else {
            ProtectionScope::Symbol(event.symbol.clone())
        };
        let ends_at = event.protection_end();

        {
            let _guard = self.protection_guard.lock().await;
            let lock_path = self.store.lock_path(PROTECTION_LOCK);
            let file_lock =
                match tokio::task::spawn_blocking(move || FileLock::acquire(lock_path)).await {
                    Ok(Ok(lock)) => Some(lock),
                    Ok(Err(e)) => {
                        warn!("Protection lock unavailable, applying in-process only: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("Protection lock task failed: {}", e);
                        None
                    }
                };

            self.registry.protect(scope.clone(), ends_at);

            let symbols = self.registry.protected_symbols_at(event.detected_at);
            if let Err(e) = self
                .store
                .update_status(move |status| status.protected_symbols = symbols)
                .await
            {
                error!("Failed to persist protected symbols: {}", e);
            }

            drop(file_lock);
        }

        warn!(
            "Anomaly {} on {}: {} severity {} drop {:.2}% -> {} until {}",
            event.event_id,
            event.symbol,
            event.rule_kind,
            event.severity,
            event.drop_pct,
            event.action.scope,
            ends_at
        );

        self.record_event(event.clone());

        if let Err(e) = self.log_event(event, &scope, ends_at).await {
            error!("Failed to log anomaly {}: {}", event.event_id, e);
        }
    }

    fn record_event(&self, event: AnomalyEvent) {
        match self.lock_state() {
            Ok(mut state) => {
                state.events.push_back(event.clone());
                while state.events.len() > self.config.max_retained_events.max(1) {
                    state.events.pop_front();
                }
                state.total_events += 1;
            }
            Err(e) => error!("Could not record anomaly {}: {}", event.event_id, e),
        }

        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn log_event(
        &self,
        event: &AnomalyEvent,
        scope: &ProtectionScope,
        ends_at: DateTime<Utc>,
    ) -> Result<()> {
        let details = serde_json::to_value(event)?;
        self.store
            .append_event(json!({
                "event_id": event.event_id,
                "symbol": event.symbol,
                "rule": event.rule_kind.as_str(),
                "severity": event.severity.as_str(),
                "action": event.action.scope.as_str(),
                "details": details,
            }))
            .await?;

        self.store
            .append_protection(json!({
                "event_id": event.event_id,
                "scope": scope.to_string(),
                "symbol": event.symbol,
                "severity": event.severity.as_str(),
                "duration_minutes": event.action.duration_minutes,
                "protected_until": ends_at.to_rfc3339(),
                "measures": event.action.measures,
            }))
            .await
    }

    pub fn protection_status(&self) -> ProtectionStatus {
        let now = Utc::now();
        let window = ChronoDuration::seconds(self.config.recent_event_window_secs as i64);

        let (recent_event_count, total_event_count) = match self.lock_state() {
            Ok(state) => (
                state
                    .events
                    .iter()
                    .filter(|e| e.detected_at >= now - window)
                    .count(),
                state.total_events,
            ),
            Err(_) => (0, 0),
        };

        ProtectionStatus {
            monitoring_active: self.is_monitoring(),
            protected_symbols: self.registry.protected_symbols_at(now),
            recent_event_count,
            total_event_count,
        }
    }

    /// Run the detection loop until `stop` is called
    pub async fn run(self: Arc<Self>, feed: Arc<dyn MarketDataFeed>) {
        self.monitoring_active.store(true, Ordering::SeqCst);
        info!(
            "Anomaly detection started ({} symbols, {} rules, every {}s)",
            self.config.symbols.len(),
            self.config.rules.len(),
            self.config.interval_secs
        );

        let mut timer = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.monitoring_active.load(Ordering::SeqCst) {
            timer.tick().await;
            if !self.monitoring_active.load(Ordering::SeqCst) {
                break;
            }

            let events = self.tick(feed.as_ref()).await;
            if !events.is_empty() {
                info!("Detection tick emitted {} events", events.len());
            }
        }

        info!("Anomaly detection stopped");
    }

    /// Ask the detection loop to exit after its current tick
    pub fn stop(&self) {
        self.monitoring_active.store(false, Ordering::SeqCst);
    }
}

fn build_event(rule: &DetectionRule, matched: RuleMatch) -> AnomalyEvent {
    let severity = Severity::classify(matched.drop_pct, matched.volume_multiplier);
    let action = SystemAction::derive(rule, severity);

    AnomalyEvent {
        event_id: Uuid::new_v4().to_string(),
        symbol: matched.current.symbol.clone(),
        rule_kind: rule.kind,
        severity,
        detected_at: Utc::now(),
        sample_timestamp: matched.current.timestamp,
        price_before: matched.reference.price,
        price_at_detection: matched.current.price,
        drop_pct: matched.drop_pct,
        volume_spike: matched.volume_spike,
        volume_multiplier: matched.volume_multiplier,
        trigger_conditions: TriggerConditions {
            timeframe_minutes: rule.timeframe_minutes,
            threshold_pct: rule.threshold_pct,
            required_volume_multiplier: rule.volume_multiplier,
            confirmation_count: rule.confirmation_count,
            reference_timestamp: matched.reference.timestamp,
        },
        action,
    }
}
