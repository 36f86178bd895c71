//! Protection windows (per-symbol and global cooldowns)
//!
//! Windows are evicted lazily: the first query at or after a window's end
//! removes it. Overlapping windows for the same scope are last-write-wins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// What a protection window covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionScope {
    Symbol(String),
    AllSymbols,
}

impl fmt::Display for ProtectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionScope::Symbol(s) => write!(f, "{}", s),
            ProtectionScope::AllSymbols => write!(f, "ALL"),
        }
    }
}

/// An active cooldown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionWindow {
    pub scope: ProtectionScope,
    pub ends_at: DateTime<Utc>,
}

/// Registry of active protection windows
#[derive(Debug, Default)]
pub struct ProtectionRegistry {
    windows: DashMap<ProtectionScope, DateTime<Utc>>,
}

impl ProtectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite the window for a scope
    pub fn protect(&self, scope: ProtectionScope, ends_at: DateTime<Utc>) {
        debug!("Protection window {} until {}", scope, ends_at);
        self.windows.insert(scope, ends_at);
    }

    /// Whether a symbol is covered right now
    pub fn is_symbol_protected(&self, symbol: &str) -> bool {
        self.is_symbol_protected_at(symbol, Utc::now())
    }

    /// Whether a symbol is covered at `now`, evicting lapsed windows it touches
    pub fn is_symbol_protected_at(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let own = self.check_scope(&ProtectionScope::Symbol(symbol.to_string()), now);
        own || self.is_globally_protected_at(now)
    }

    /// Whether the all-symbols window is active at `now`
    pub fn is_globally_protected_at(&self, now: DateTime<Utc>) -> bool {
        self.check_scope(&ProtectionScope::AllSymbols, now)
    }

    fn check_scope(&self, scope: &ProtectionScope, now: DateTime<Utc>) -> bool {
        // Copy the end time out so no shard guard is held across remove_if
        let ends_at = match self.windows.get(scope) {
            Some(entry) => *entry.value(),
            None => return false,
        };

        if now < ends_at {
            return true;
        }

        // Only drop it if nobody extended the window in the meantime
        if self
            .windows
            .remove_if(scope, |_, end| now >= *end)
            .is_some()
        {
            debug!("Protection window {} expired at {}", scope, ends_at);
        }
        false
    }

    /// Active windows at `now`, evicting any that lapsed
    pub fn active_windows_at(&self, now: DateTime<Utc>) -> Vec<ProtectionWindow> {
        let scopes: Vec<ProtectionScope> = self.windows.iter().map(|e| e.key().clone()).collect();

        let mut active: Vec<ProtectionWindow> = scopes
            .into_iter()
            .filter(|scope| self.check_scope(scope, now))
            .filter_map(|scope| {
                self.windows.get(&scope).map(|end| ProtectionWindow {
                    scope: scope.clone(),
                    ends_at: *end.value(),
                })
            })
            .collect();
        active.sort_by(|a, b| a.scope.to_string().cmp(&b.scope.to_string()));
        active
    }

    /// Labels of the active windows (symbol names, or `ALL`)
    pub fn protected_symbols_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.active_windows_at(now)
            .into_iter()
            .map(|w| w.scope.to_string())
            .collect()
    }

    /// Number of stored windows, including lapsed ones not yet evicted
    #[cfg(test)]
    fn stored(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_window_boundaries() {
        let registry = ProtectionRegistry::new();
        let now = Utc::now();
        let end = now + Duration::minutes(30);
        registry.protect(ProtectionScope::Symbol("BTCUSDT".into()), end);

        assert!(registry.is_symbol_protected_at("BTCUSDT", now));
        assert!(registry.is_symbol_protected_at("BTCUSDT", end - Duration::milliseconds(1)));
        assert!(!registry.is_symbol_protected_at("ETHUSDT", now));

        // At the end instant the window is over and gets evicted
        assert_eq!(registry.stored(), 1);
        assert!(!registry.is_symbol_protected_at("BTCUSDT", end));
        assert_eq!(registry.stored(), 0);

        // Idempotent afterwards
        assert!(!registry.is_symbol_protected_at("BTCUSDT", end));
        assert!(!registry.is_symbol_protected_at("BTCUSDT", end + Duration::minutes(1)));
    }

    #[test]
    fn test_global_window_covers_everything() {
        let registry = ProtectionRegistry::new();
        let now = Utc::now();
        registry.protect(ProtectionScope::AllSymbols, now + Duration::minutes(60));

        assert!(registry.is_symbol_protected_at("BTCUSDT", now));
        assert!(registry.is_symbol_protected_at("anything", now));
        assert!(registry.is_globally_protected_at(now));
        assert_eq!(registry.protected_symbols_at(now), vec!["ALL".to_string()]);
    }

    #[test]
    fn test_last_write_wins() {
        let registry = ProtectionRegistry::new();
        let now = Utc::now();
        let scope = ProtectionScope::Symbol("SOLUSDT".into());

        registry.protect(scope.clone(), now + Duration::minutes(60));
        registry.protect(scope.clone(), now + Duration::minutes(10));

        assert!(registry.is_symbol_protected_at("SOLUSDT", now + Duration::minutes(5)));
        assert!(!registry.is_symbol_protected_at("SOLUSDT", now + Duration::minutes(11)));
    }

    #[test]
    fn test_active_windows_evicts_lapsed() {
        let registry = ProtectionRegistry::new();
        let now = Utc::now();
        registry.protect(ProtectionScope::Symbol("A".into()), now - Duration::seconds(1));
        registry.protect(ProtectionScope::Symbol("B".into()), now + Duration::minutes(5));

        let active = registry.active_windows_at(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].scope, ProtectionScope::Symbol("B".into()));
        assert_eq!(registry.stored(), 1);
    }
}
