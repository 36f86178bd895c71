use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Anomaly pattern a detection rule looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashKind {
    /// Sharp single-symbol drop over a few minutes
    FlashCrash,
    /// Price move accompanied by an outsized volume burst
    VolumeAnomaly,
    /// Sustained decline that warrants pausing every symbol
    RapidDecline,
    /// Broad crash, system-wide protect mode
    MarketCrash,
    /// Crash severe enough to request a full shutdown
    ExtremeCrash,
}

impl CrashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashKind::FlashCrash => "flash_crash",
            CrashKind::VolumeAnomaly => "volume_anomaly",
            CrashKind::RapidDecline => "rapid_decline",
            CrashKind::MarketCrash => "market_crash",
            CrashKind::ExtremeCrash => "extreme_crash",
        }
    }

    /// Scope of the protective action this kind of anomaly calls for
    pub fn action_scope(&self) -> ActionScope {
        match self {
            CrashKind::FlashCrash | CrashKind::VolumeAnomaly => ActionScope::PauseSymbol,
            CrashKind::RapidDecline => ActionScope::PauseAllSymbols,
            CrashKind::MarketCrash => ActionScope::ProtectMode,
            CrashKind::ExtremeCrash => ActionScope::FullShutdown,
        }
    }
}

impl std::fmt::Display for CrashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_confirmation_count() -> u32 {
    1
}

fn default_monitoring_interval_secs() -> u64 {
    30
}

/// One anomaly pattern definition, immutable after startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRule {
    pub kind: CrashKind,
    /// Lookback in minutes; 0 compares against the immediately preceding sample
    pub timeframe_minutes: u32,
    /// Minimum price drop in percent (e.g. 10 = 10%)
    pub threshold_pct: Decimal,
    /// Required current/baseline volume ratio, if the rule needs a volume spike
    #[serde(default)]
    pub volume_multiplier: Option<Decimal>,
    /// Consecutive matching evaluations required before an event is emitted
    #[serde(default = "default_confirmation_count")]
    pub confirmation_count: u32,
    /// Minimum spacing between evaluations of this rule for one symbol
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Protection window length in minutes (doubled on EXTREME severity)
    pub action_duration_minutes: u32,
}

impl DetectionRule {
    pub fn new(
        kind: CrashKind,
        timeframe_minutes: u32,
        threshold_pct: Decimal,
        action_duration_minutes: u32,
    ) -> Self {
        Self {
            kind,
            timeframe_minutes,
            threshold_pct,
            volume_multiplier: None,
            confirmation_count: default_confirmation_count(),
            monitoring_interval_secs: default_monitoring_interval_secs(),
            action_duration_minutes,
        }
    }

    pub fn with_volume_multiplier(mut self, multiplier: Decimal) -> Self {
        self.volume_multiplier = Some(multiplier);
        self
    }

    pub fn with_confirmation_count(mut self, count: u32) -> Self {
        self.confirmation_count = count;
        self
    }

    pub fn with_monitoring_interval_secs(mut self, secs: u64) -> Self {
        self.monitoring_interval_secs = secs;
        self
    }

    pub fn timeframe(&self) -> Duration {
        Duration::minutes(self.timeframe_minutes as i64)
    }

    /// Check the rule definition for values that can never match sensibly
    pub fn validate(&self) -> Result<(), String> {
        if self.threshold_pct <= Decimal::ZERO {
            return Err(format!("{}: threshold_pct must be positive", self.kind));
        }
        if let Some(m) = self.volume_multiplier {
            if m <= Decimal::ZERO {
                return Err(format!("{}: volume_multiplier must be positive", self.kind));
            }
        }
        if self.confirmation_count == 0 {
            return Err(format!("{}: confirmation_count must be at least 1", self.kind));
        }
        if self.action_duration_minutes == 0 {
            return Err(format!("{}: action_duration_minutes must be positive", self.kind));
        }
        Ok(())
    }
}

/// Ordinal anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Extreme,
}

impl Severity {
    /// Classify by drop percentage and volume multiplier.
    ///
    /// Each tier is entered when either input reaches its floor, so raising
    /// either input never lowers the tier.
    pub fn classify(drop_pct: Decimal, volume_multiplier: Option<Decimal>) -> Self {
        let multiplier = volume_multiplier.unwrap_or(Decimal::ZERO);

        if drop_pct >= dec!(30) || multiplier >= dec!(20) {
            Severity::Extreme
        } else if drop_pct >= dec!(20) || multiplier >= dec!(10) {
            Severity::High
        } else if drop_pct >= dec!(10) || multiplier >= dec!(5) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Extreme => "EXTREME",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Blast radius of a protective action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionScope {
    /// Pause the affected symbol only
    PauseSymbol,
    /// Pause every monitored symbol
    PauseAllSymbols,
    /// System-wide protect mode
    ProtectMode,
    /// Request a full system shutdown
    FullShutdown,
}

impl ActionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionScope::PauseSymbol => "pause_symbol",
            ActionScope::PauseAllSymbols => "pause_all_symbols",
            ActionScope::ProtectMode => "protect_mode",
            ActionScope::FullShutdown => "full_shutdown",
        }
    }

    /// Whether the resulting protection window covers every symbol
    pub fn is_global(&self) -> bool {
        !matches!(self, ActionScope::PauseSymbol)
    }
}

impl std::fmt::Display for ActionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action taken in response to an anomaly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAction {
    pub scope: ActionScope,
    pub duration_minutes: u32,
    pub measures: Vec<String>,
}

impl SystemAction {
    /// Derive the action for a rule firing at the given severity
    pub fn derive(rule: &DetectionRule, severity: Severity) -> Self {
        let scope = rule.kind.action_scope();
        let mut measures = vec![scope.as_str().to_string()];
        let mut duration_minutes = rule.action_duration_minutes;

        if severity == Severity::Extreme {
            duration_minutes = duration_minutes.saturating_mul(2);
            measures.push("notify_operators".to_string());
            measures.push("tighten_risk_limits".to_string());
            if scope == ActionScope::FullShutdown {
                measures.push("request_system_shutdown".to_string());
            }
        }

        Self {
            scope,
            duration_minutes,
            measures,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes as i64)
    }
}

/// Rule parameters and reference point captured when an event fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConditions {
    pub timeframe_minutes: u32,
    pub threshold_pct: Decimal,
    pub required_volume_multiplier: Option<Decimal>,
    pub confirmation_count: u32,
    pub reference_timestamp: DateTime<Utc>,
}

/// A detected rule violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub event_id: String,
    pub symbol: String,
    pub rule_kind: CrashKind,
    pub severity: Severity,
    /// Wall-clock time the detector raised the event
    pub detected_at: DateTime<Utc>,
    /// Timestamp of the market sample that matched
    pub sample_timestamp: DateTime<Utc>,
    pub price_before: Decimal,
    pub price_at_detection: Decimal,
    pub drop_pct: Decimal,
    pub volume_spike: bool,
    pub volume_multiplier: Option<Decimal>,
    pub trigger_conditions: TriggerConditions,
    pub action: SystemAction,
}

impl AnomalyEvent {
    /// When the protection window installed by this event lapses.
    ///
    /// Measured from `detected_at`, so replayed history still gets a full
    /// cooldown.
    pub fn protection_end(&self) -> DateTime<Utc> {
        self.detected_at + self.action.duration()
    }
}
