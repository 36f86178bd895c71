//! Shutdown trigger sources besides host health

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::domain::{
    ActionScope, AnomalyEvent, Severity, ShutdownReason, ShutdownTrigger, TriggerSeverity,
};

/// External input polled by the shutdown monitor on every check
#[async_trait]
pub trait TriggerSource: Send + Sync {
    fn name(&self) -> &str;

    /// A trigger if this source currently wants the system stopped
    async fn poll(&self) -> Option<ShutdownTrigger>;
}

/// Raises EXTREME_MARKET while a recent EXTREME full-shutdown anomaly is in window
pub struct ExtremeMarketSource {
    events: Mutex<broadcast::Receiver<AnomalyEvent>>,
    latest: Mutex<Option<AnomalyEvent>>,
    window: ChronoDuration,
}

impl ExtremeMarketSource {
    pub fn new(events: broadcast::Receiver<AnomalyEvent>, window_secs: u64) -> Self {
        Self {
            events: Mutex::new(events),
            latest: Mutex::new(None),
            window: ChronoDuration::seconds(window_secs as i64),
        }
    }

    fn drain(&self) -> Option<AnomalyEvent> {
        let mut found = None;
        let Ok(mut rx) = self.events.lock() else {
            return None;
        };

        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if event.severity == Severity::Extreme
                        && event.action.scope == ActionScope::FullShutdown
                    {
                        found = Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Extreme market source lagged, {} events skipped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        found
    }
}

#[async_trait]
impl TriggerSource for ExtremeMarketSource {
    fn name(&self) -> &str {
        "extreme_market"
    }

    async fn poll(&self) -> Option<ShutdownTrigger> {
        let fresh = self.drain();
        let Ok(mut latest) = self.latest.lock() else {
            return None;
        };
        if let Some(event) = fresh {
            debug!("Extreme anomaly {} on {} recorded", event.event_id, event.symbol);
            *latest = Some(event);
        }

        let event = latest.as_ref()?;
        if event.detected_at < Utc::now() - self.window {
            return None;
        }

        Some(ShutdownTrigger::new(
            ShutdownReason::ExtremeMarket,
            TriggerSeverity::Emergency,
            format!(
                "{} on {}: {:.2}% drop ({})",
                event.rule_kind, event.symbol, event.drop_pct, event.event_id
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CrashKind, DetectionRule, SystemAction, TriggerConditions};
    use rust_decimal_macros::dec;

    fn event(kind: CrashKind, severity: Severity, minutes_ago: i64) -> AnomalyEvent {
        let rule = DetectionRule::new(kind, 30, dec!(30), 240);
        let detected_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        AnomalyEvent {
            event_id: format!("evt-{}", minutes_ago),
            symbol: "BTCUSDT".to_string(),
            rule_kind: kind,
            severity,
            detected_at,
            sample_timestamp: detected_at,
            price_before: dec!(100),
            price_at_detection: dec!(65),
            drop_pct: dec!(35),
            volume_spike: false,
            volume_multiplier: None,
            trigger_conditions: TriggerConditions {
                timeframe_minutes: 30,
                threshold_pct: dec!(30),
                required_volume_multiplier: None,
                confirmation_count: 1,
                reference_timestamp: detected_at - ChronoDuration::minutes(30),
            },
            action: SystemAction::derive(&rule, severity),
        }
    }

    #[tokio::test]
    async fn test_extreme_full_shutdown_raises_trigger() {
        let (tx, rx) = broadcast::channel(16);
        let source = ExtremeMarketSource::new(rx, 300);
        assert!(source.poll().await.is_none());

        tx.send(event(CrashKind::FlashCrash, Severity::Extreme, 0)).unwrap();
        assert!(source.poll().await.is_none());

        tx.send(event(CrashKind::ExtremeCrash, Severity::Extreme, 0)).unwrap();
        let trigger = source.poll().await.unwrap();
        assert_eq!(trigger.reason, ShutdownReason::ExtremeMarket);
        assert_eq!(trigger.severity, TriggerSeverity::Emergency);
        assert!(!trigger.manual);

        // Still in window on the next poll
        assert!(source.poll().await.is_some());
    }

    #[tokio::test]
    async fn test_stale_extreme_event_ignored() {
        let (tx, rx) = broadcast::channel(16);
        let source = ExtremeMarketSource::new(rx, 300);

        tx.send(event(CrashKind::ExtremeCrash, Severity::Extreme, 10)).unwrap();
        assert!(source.poll().await.is_none());
    }
}
