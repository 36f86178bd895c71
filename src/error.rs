use thiserror::Error;

/// Main error type for the safety subsystem
#[derive(Error, Debug)]
pub enum TripwireError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid detection rule: {0}")]
    InvalidRule(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(unix)]
    #[error("System call error: {0}")]
    Sys(#[from] nix::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    // Host metrics errors
    #[error("Host metrics unavailable: {0}")]
    HostMetrics(String),

    // Shutdown errors
    #[error("Shutdown phase {phase} failed: {reason}")]
    ShutdownPhase { phase: String, reason: String },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TripwireError
pub type Result<T> = std::result::Result<T, TripwireError>;

impl TripwireError {
    /// Build a phase failure from any displayable cause
    pub fn phase(phase: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        TripwireError::ShutdownPhase {
            phase: phase.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_error_display() {
        let err = TripwireError::phase("phase_2_position_monitor_only", "executor unreachable");
        assert_eq!(
            err.to_string(),
            "Shutdown phase phase_2_position_monitor_only failed: executor unreachable"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TripwireError = io.into();
        assert!(matches!(err, TripwireError::Io(_)));
    }
}
