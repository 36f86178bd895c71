use rust_decimal_macros::dec;

use crate::domain::{CrashKind, DetectionRule};

/// Rule set used when the configuration does not provide one
pub fn default_rules() -> Vec<DetectionRule> {
    vec![
        DetectionRule::new(CrashKind::FlashCrash, 5, dec!(10), 30),
        DetectionRule::new(CrashKind::VolumeAnomaly, 5, dec!(5), 60).with_volume_multiplier(dec!(10)),
        DetectionRule::new(CrashKind::RapidDecline, 15, dec!(15), 60),
        DetectionRule::new(CrashKind::MarketCrash, 60, dec!(20), 120),
        DetectionRule::new(CrashKind::ExtremeCrash, 30, dec!(30), 240),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_are_valid() {
        let rules = default_rules();
        assert_eq!(rules.len(), 5);
        for rule in &rules {
            assert!(rule.validate().is_ok(), "{:?}", rule);
        }
        assert_eq!(rules[0].kind, CrashKind::FlashCrash);
        assert!(rules
            .iter()
            .any(|r| r.kind == CrashKind::VolumeAnomaly && r.volume_multiplier.is_some()));
    }
}
