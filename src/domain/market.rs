use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One observed price/volume point for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSample {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    /// Traded volume for the sampling interval (zero when the feed has none)
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
}

impl MarketSample {
    /// Create a price-only sample
    pub fn new(symbol: impl Into<String>, timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price,
            volume: Decimal::ZERO,
            high: None,
            low: None,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }

    /// Whether this sample carries volume information
    pub fn has_volume(&self) -> bool {
        self.volume > Decimal::ZERO
    }

    /// Reject samples that cannot be evaluated
    pub fn validate(&self) -> crate::Result<()> {
        if self.symbol.is_empty() {
            return Err(crate::TripwireError::InvalidMarketData(
                "sample without symbol".to_string(),
            ));
        }
        if self.price <= Decimal::ZERO {
            return Err(crate::TripwireError::InvalidMarketData(format!(
                "{}: non-positive price {}",
                self.symbol, self.price
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(crate::TripwireError::InvalidMarketData(format!(
                "{}: negative volume {}",
                self.symbol, self.volume
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sample_validation() {
        let now = Utc::now();
        assert!(MarketSample::new("BTCUSDT", now, dec!(100)).validate().is_ok());
        assert!(MarketSample::new("BTCUSDT", now, dec!(0)).validate().is_err());
        assert!(MarketSample::new("", now, dec!(1)).validate().is_err());
        assert!(MarketSample::new("BTCUSDT", now, dec!(1))
            .with_volume(dec!(-1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_sample_deserializes_without_volume() {
        let sample: MarketSample = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","timestamp":"2024-05-01T12:00:00Z","price":"3100.5"}"#,
        )
        .unwrap();
        assert_eq!(sample.price, dec!(3100.5));
        assert!(!sample.has_volume());
        assert!(sample.high.is_none());
    }
}
