use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw host resource reading
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostSample {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub memory_available_gb: f64,
    pub disk_free_gb: f64,
    pub disk_used_pct: f64,
    pub network_connections: u64,
}

/// Point-in-time host resource state with a derived 0-100 score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub memory_available_gb: f64,
    pub disk_free_gb: f64,
    pub disk_used_pct: f64,
    pub network_connections: u64,
    pub health_score: f64,
    /// Set when sampling failed and the snapshot is synthetic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthSnapshot {
    pub fn from_sample(sample: HostSample) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_pct: sample.cpu_pct,
            memory_pct: sample.memory_pct,
            memory_available_gb: sample.memory_available_gb,
            disk_free_gb: sample.disk_free_gb,
            disk_used_pct: sample.disk_used_pct,
            network_connections: sample.network_connections,
            health_score: health_score(&sample),
            error: None,
        }
    }

    /// Synthetic snapshot used when host metrics could not be read
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_pct: 0.0,
            memory_pct: 0.0,
            memory_available_gb: 0.0,
            disk_free_gb: 0.0,
            disk_used_pct: 0.0,
            network_connections: 0,
            health_score: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.error.is_none()
    }
}

/// Mean of CPU headroom, memory headroom and disk headroom (10 GB free = full marks)
pub fn health_score(sample: &HostSample) -> f64 {
    let cpu = (100.0 - sample.cpu_pct).max(0.0);
    let memory = (100.0 - sample.memory_pct).max(0.0);
    let disk = (sample.disk_free_gb * 10.0).min(100.0);
    (cpu + memory + disk) / 3.0
}
