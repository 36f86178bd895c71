use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::VecDeque;

use crate::domain::MarketSample;

pub const DEFAULT_PRICE_CAPACITY: usize = 1000;
pub const DEFAULT_VOLUME_CAPACITY: usize = 100;

/// Bounded price/volume history for one symbol
#[derive(Debug, Clone)]
pub struct SymbolHistory {
    prices: VecDeque<MarketSample>,
    volumes: VecDeque<Decimal>,
    price_capacity: usize,
    volume_capacity: usize,
    samples_seen: u64,
}

impl SymbolHistory {
    pub fn new(price_capacity: usize, volume_capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(price_capacity.min(DEFAULT_PRICE_CAPACITY)),
            volumes: VecDeque::with_capacity(volume_capacity.min(DEFAULT_VOLUME_CAPACITY)),
            price_capacity: price_capacity.max(1),
            volume_capacity: volume_capacity.max(1),
            samples_seen: 0,
        }
    }

    /// Append a sample, dropping the oldest entries past capacity
    pub fn push(&mut self, sample: MarketSample) {
        if sample.has_volume() {
            self.volumes.push_back(sample.volume);
            while self.volumes.len() > self.volume_capacity {
                self.volumes.pop_front();
            }
        }

        self.prices.push_back(sample);
        while self.prices.len() > self.price_capacity {
            self.prices.pop_front();
        }
        self.samples_seen += 1;
    }

    pub fn latest(&self) -> Option<&MarketSample> {
        self.prices.back()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.prices.len()
    }

    #[cfg(test)]
    fn volume_len(&self) -> usize {
        self.volumes.len()
    }

    /// Total samples pushed since creation, including evicted ones
    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    /// Most recent sample before the latest one that is at least `lookback` older
    pub fn reference_sample(&self, lookback: Duration) -> Option<&MarketSample> {
        let latest = self.prices.back()?;
        let cutoff = latest.timestamp - lookback;
        self.prices
            .iter()
            .rev()
            .skip(1)
            .find(|s| s.timestamp <= cutoff)
    }

    /// Latest volume over the mean of up to `window` preceding volumes.
    ///
    /// `None` when the latest sample has no volume or there is no baseline.
    pub fn volume_multiplier(&self, window: usize) -> Option<Decimal> {
        let latest = self.prices.back()?;
        if !latest.has_volume() {
            return None;
        }

        let baseline: Vec<Decimal> = self.volumes.iter().rev().skip(1).take(window).copied().collect();
        if baseline.is_empty() {
            return None;
        }

        let sum: Decimal = baseline.iter().copied().sum();
        let mean = sum.checked_div(Decimal::from(baseline.len()))?;
        if mean <= Decimal::ZERO {
            return None;
        }

        latest.volume.checked_div(mean)
    }
}

impl Default for SymbolHistory {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE_CAPACITY, DEFAULT_VOLUME_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_capacity_drops_oldest() {
        let mut history = SymbolHistory::new(3, 2);
        let start = Utc::now();
        for i in 0..5 {
            history.push(
                MarketSample::new("BTCUSDT", start + Duration::minutes(i), Decimal::from(100 + i))
                    .with_volume(Decimal::from(10 + i)),
            );
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.volume_len(), 2);
        assert_eq!(history.samples_seen(), 5);
        assert_eq!(history.latest().unwrap().price, dec!(104));
    }

    #[test]
    fn test_reference_sample_lookup() {
        let mut history = SymbolHistory::default();
        let now = Utc::now();
        history.push(MarketSample::new("X", now - Duration::minutes(10), dec!(100)));
        history.push(MarketSample::new("X", now - Duration::minutes(6), dec!(95)));
        history.push(MarketSample::new("X", now - Duration::minutes(2), dec!(90)));
        history.push(MarketSample::new("X", now, dec!(88)));

        let five = history.reference_sample(Duration::minutes(5)).unwrap();
        assert_eq!(five.price, dec!(95));

        let nine = history.reference_sample(Duration::minutes(9)).unwrap();
        assert_eq!(nine.price, dec!(100));

        assert!(history.reference_sample(Duration::minutes(15)).is_none());

        // Zero lookback compares against the previous sample
        let zero = history.reference_sample(Duration::zero()).unwrap();
        assert_eq!(zero.price, dec!(90));
    }

    #[test]
    fn test_single_sample_has_no_reference() {
        let mut history = SymbolHistory::default();
        history.push(MarketSample::new("X", Utc::now(), dec!(100)));
        assert!(history.reference_sample(Duration::zero()).is_none());
    }

    #[test]
    fn test_volume_multiplier_excludes_current() {
        let mut history = SymbolHistory::default();
        let start = Utc::now();
        for i in 0..30 {
            history.push(
                MarketSample::new("X", start + Duration::minutes(i), dec!(100))
                    .with_volume(dec!(1000)),
            );
        }
        history.push(
            MarketSample::new("X", start + Duration::minutes(30), dec!(94)).with_volume(dec!(30000)),
        );

        assert_eq!(history.volume_multiplier(30), Some(dec!(30)));
    }

    #[test]
    fn test_volume_multiplier_requires_volume() {
        let mut history = SymbolHistory::default();
        let now = Utc::now();
        history.push(MarketSample::new("X", now - Duration::minutes(1), dec!(100)).with_volume(dec!(5)));
        history.push(MarketSample::new("X", now, dec!(100)));
        assert!(history.volume_multiplier(30).is_none());

        let mut fresh = SymbolHistory::default();
        fresh.push(MarketSample::new("X", now, dec!(100)).with_volume(dec!(5)));
        assert!(fresh.volume_multiplier(30).is_none());
    }
}
