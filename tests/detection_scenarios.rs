use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tripwire::coordination::{ExtremeMarketSource, ShutdownConfig, ShutdownController, ShutdownOutcome, TriggerSource};
use tripwire::detection::{default_rules, AnomalyDetector, DetectorConfig};
use tripwire::domain::{
    ActionScope, CrashKind, HostSample, MarketSample, Severity, ShutdownReason, TriggerSeverity,
};
use tripwire::services::{HealthConfig, HealthMonitor, HostMetrics};
use tripwire::{ReplayFeed, Result, StateStore};

struct FixedHost;

impl HostMetrics for FixedHost {
    fn sample(&self) -> Result<HostSample> {
        Ok(HostSample {
            cpu_pct: 10.0,
            memory_pct: 30.0,
            memory_available_gb: 16.0,
            disk_free_gb: 100.0,
            disk_used_pct: 10.0,
            network_connections: 8,
        })
    }
}

fn detector(dir: &std::path::Path, symbols: &[&str]) -> AnomalyDetector {
    let config = DetectorConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        rules: default_rules(),
        ..Default::default()
    };
    AnomalyDetector::new(config, StateStore::open(dir).unwrap()).unwrap()
}

/// 100 -> 88 over six minutes without volume data pauses the symbol for 30 minutes.
#[tokio::test]
async fn flash_crash_pauses_symbol() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["BTCUSDT", "ETHUSDT"]);
    let now = Utc::now();
    let feed = ReplayFeed::from_samples(vec![
        MarketSample::new("BTCUSDT", now - Duration::minutes(6), dec!(100)),
        MarketSample::new("BTCUSDT", now, dec!(88)),
        MarketSample::new("ETHUSDT", now - Duration::minutes(6), dec!(50)),
        MarketSample::new("ETHUSDT", now, dec!(49.5)),
    ]);

    assert!(detector.tick(&feed).await.is_empty());
    let events = detector.tick(&feed).await;

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.symbol, "BTCUSDT");
    assert_eq!(event.rule_kind, CrashKind::FlashCrash);
    assert_eq!(event.severity, Severity::Medium);
    assert_eq!(event.action.scope, ActionScope::PauseSymbol);
    assert_eq!(event.action.duration_minutes, 30);

    assert!(detector.is_symbol_protected("BTCUSDT"));
    assert!(!detector.is_symbol_protected("ETHUSDT"));

    let logged = StateStore::open(dir.path()).unwrap().read_events().await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0]["symbol"], "BTCUSDT");
    assert_eq!(logged[0]["severity"], "MEDIUM");
    assert_eq!(logged[0]["action"], "pause_symbol");
    assert!(logged[0]["timestamp"].is_string());
}

/// A 30x volume burst with a 6% move fires the volume rule but not the flash-crash rule.
#[tokio::test]
async fn volume_spike_fires_volume_rule_only() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["SOLUSDT"]);
    let start = Utc::now() - Duration::minutes(31);

    let mut samples: Vec<MarketSample> = (0..30)
        .map(|i| {
            MarketSample::new("SOLUSDT", start + Duration::minutes(i), dec!(150))
                .with_volume(dec!(2000))
        })
        .collect();
    samples.push(
        MarketSample::new("SOLUSDT", start + Duration::minutes(30), dec!(141))
            .with_volume(dec!(60000)),
    );
    let feed = ReplayFeed::from_samples(samples);

    let mut events = Vec::new();
    for _ in 0..31 {
        events.extend(detector.tick(&feed).await);
    }

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_kind, CrashKind::VolumeAnomaly);
    assert!(events[0].volume_spike);
    assert_eq!(events[0].volume_multiplier, Some(dec!(30)));
}

/// While protected, further crashes on the symbol produce no new events.
#[tokio::test]
async fn protected_symbol_stays_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["BTCUSDT"]);
    let now = Utc::now();

    let mut samples = vec![
        MarketSample::new("BTCUSDT", now - Duration::minutes(6), dec!(100)),
        MarketSample::new("BTCUSDT", now, dec!(88)),
    ];
    for i in 1..=10 {
        samples.push(MarketSample::new(
            "BTCUSDT",
            now + Duration::seconds(30 * i),
            dec!(88) - rust_decimal::Decimal::from(i * 5),
        ));
    }
    let feed = ReplayFeed::from_samples(samples);

    let mut total = 0;
    for _ in 0..12 {
        total += detector.tick(&feed).await.len();
    }

    assert_eq!(total, 1);
    // Protected symbols are not polled
    assert_eq!(feed.remaining("BTCUSDT"), 10);

    let status = detector.protection_status();
    assert_eq!(status.total_event_count, 1);
    assert_eq!(status.recent_event_count, 1);
    assert_eq!(status.protected_symbols, vec!["BTCUSDT".to_string()]);
}

/// An EXTREME full-shutdown anomaly drives the monitor into an EXTREME_MARKET shutdown.
#[tokio::test]
async fn extreme_crash_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["BTCUSDT"]);
    let source: Arc<dyn TriggerSource> = Arc::new(ExtremeMarketSource::new(detector.subscribe(), 300));

    let now = Utc::now();
    let feed = ReplayFeed::from_samples(vec![
        MarketSample::new("BTCUSDT", now - Duration::minutes(31), dec!(100)),
        MarketSample::new("BTCUSDT", now, dec!(60)),
    ]);
    detector.tick(&feed).await;
    let events = detector.tick(&feed).await;

    let extreme = events
        .iter()
        .find(|e| e.rule_kind == CrashKind::ExtremeCrash)
        .expect("extreme crash event");
    assert_eq!(extreme.severity, Severity::Extreme);
    assert_eq!(extreme.action.scope, ActionScope::FullShutdown);
    assert_eq!(extreme.action.duration_minutes, 480);
    assert!(extreme
        .action
        .measures
        .contains(&"request_system_shutdown".to_string()));
    // Global scope protects every symbol
    assert!(detector.is_symbol_protected("ANYTHING"));

    let health = Arc::new(HealthMonitor::new(Arc::new(FixedHost), HealthConfig::default()));
    let controller = Arc::new(ShutdownController::new(
        ShutdownConfig {
            signal_stop_buffer_ms: 10,
            position_monitor_buffer_ms: 10,
            monitor_interval_secs: 1,
            extreme_market_window_secs: 300,
        },
        StateStore::open(dir.path()).unwrap(),
        health,
    ));

    let outcome = controller.clone().start_monitoring(vec![source]).await;
    assert!(matches!(outcome, Some(ShutdownOutcome::Completed { .. })));

    let status = StateStore::open(dir.path()).unwrap().load_status().await.unwrap();
    assert_eq!(status.shutdown_reason, Some(ShutdownReason::ExtremeMarket));
    assert!(!status.system_running);
    assert!(status.protected_symbols.contains(&"ALL".to_string()));
}

fn recorded_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Replayed history from 2024 still installs a full cooldown.
#[tokio::test]
async fn replayed_crash_protects_symbol() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["BTCUSDT"]);
    let start = recorded_start();

    let mut samples = vec![
        MarketSample::new("BTCUSDT", start, dec!(100)),
        MarketSample::new("BTCUSDT", start + Duration::minutes(6), dec!(88)),
    ];
    for (i, price) in [dec!(85), dec!(82), dec!(79), dec!(76)].into_iter().enumerate() {
        let offset = Duration::minutes(6) + Duration::seconds(30 * (i as i64 + 1));
        samples.push(MarketSample::new("BTCUSDT", start + offset, price));
    }
    let feed = ReplayFeed::from_samples(samples);

    let mut events = Vec::new();
    for _ in 0..6 {
        events.extend(detector.tick(&feed).await);
    }

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.sample_timestamp, start + Duration::minutes(6));
    assert!(event.protection_end() > Utc::now());
    assert!(detector.is_symbol_protected("BTCUSDT"));
    assert_eq!(feed.remaining("BTCUSDT"), 4);
}

/// An extreme crash replayed from 2024 still requests a shutdown.
#[tokio::test]
async fn replayed_extreme_crash_raises_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let detector = detector(dir.path(), &["BTCUSDT"]);
    let source = ExtremeMarketSource::new(detector.subscribe(), 300);
    let start = recorded_start();

    let feed = ReplayFeed::from_samples(vec![
        MarketSample::new("BTCUSDT", start, dec!(100)),
        MarketSample::new("BTCUSDT", start + Duration::minutes(31), dec!(60)),
    ]);
    detector.tick(&feed).await;
    let events = detector.tick(&feed).await;
    assert!(events.iter().any(|e| e.rule_kind == CrashKind::ExtremeCrash));

    let trigger = source.poll().await.expect("extreme market trigger");
    assert_eq!(trigger.reason, ShutdownReason::ExtremeMarket);
    assert_eq!(trigger.severity, TriggerSeverity::Emergency);
}
