//! Market data feed seam
//!
//! The detector pulls one sample per symbol per tick through `MarketDataFeed`.
//! `ReplayFeed` serves recorded samples and backs the `run` command and tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::MarketSample;
use crate::error::{Result, TripwireError};

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Latest sample for a symbol
    async fn get_sample(&self, symbol: &str) -> Result<MarketSample>;
}

/// Feed that replays recorded samples in timestamp order, one per request
#[derive(Debug, Default)]
pub struct ReplayFeed {
    queues: Mutex<HashMap<String, VecDeque<MarketSample>>>,
}

impl ReplayFeed {
    pub fn from_samples(samples: impl IntoIterator<Item = MarketSample>) -> Self {
        let mut queues: HashMap<String, VecDeque<MarketSample>> = HashMap::new();
        for sample in samples {
            queues
                .entry(sample.symbol.clone())
                .or_default()
                .push_back(sample);
        }
        for queue in queues.values_mut() {
            queue
                .make_contiguous()
                .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
        Self {
            queues: Mutex::new(queues),
        }
    }

    /// Load a JSON-lines file of `MarketSample` objects
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;

        let mut samples = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MarketSample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!("Skipping line {} of {}: {}", idx + 1, path.display(), e),
            }
        }

        info!("Loaded {} samples from {}", samples.len(), path.display());
        Ok(Self::from_samples(samples))
    }

    /// Samples still queued for a symbol
    pub fn remaining(&self, symbol: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(symbol).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Queue another sample behind the recorded ones
    pub fn push(&self, sample: MarketSample) -> Result<()> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| TripwireError::Internal("replay feed lock poisoned".to_string()))?;
        queues
            .entry(sample.symbol.clone())
            .or_default()
            .push_back(sample);
        Ok(())
    }
}

#[async_trait]
impl MarketDataFeed for ReplayFeed {
    async fn get_sample(&self, symbol: &str) -> Result<MarketSample> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| TripwireError::Internal("replay feed lock poisoned".to_string()))?;

        let sample = queues
            .get_mut(symbol)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                TripwireError::MarketDataUnavailable(format!("no samples left for {}", symbol))
            })?;

        debug!("Replaying {} @ {} ({})", symbol, sample.price, sample.timestamp);
        Ok(sample)
    }
}
