use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use tripwire::config::{AppConfig, LoggingConfig};
use tripwire::detection::AnomalyDetector;
use tripwire::persistence::StateStore;
use tripwire::services::{HealthMonitor, ProcHostMetrics};
use tripwire::{Result, ShutdownController};

const LOG_FILE: &str = "tripwire.log";

/// Install console logging plus a daily rolling file when the log
/// directory is writable.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,tripwire=debug"));

    let log_dir = config
        .dir
        .clone()
        .or_else(|| std::env::var_os("TRIPWIRE_LOG_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));

    // `rolling::daily` panics when it cannot create its first file
    let (file_layer, guard) = match ensure_writable(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "File logging disabled, {} is not writable: {}",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    let console_json = config
        .json
        .then(|| fmt::layer().json().with_current_span(false));
    let console_plain = (!config.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_json)
        .with(console_plain)
        .with(file_layer)
        .init();

    if guard.is_some() {
        info!("Logging to {}", log_dir.join(LOG_FILE).display());
    }
    guard
}

fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = dir.join(".tripwire_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)?;
    std::fs::remove_file(&marker)
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Services wired from configuration
pub struct Runtime {
    pub store: StateStore,
    pub controller: Arc<ShutdownController>,
}

impl Runtime {
    pub fn build(config: &AppConfig) -> Result<Self> {
        let store = StateStore::open(&config.persistence.state_dir)?;
        let metrics = ProcHostMetrics::new(&config.health.disk_path);
        let health = Arc::new(HealthMonitor::new(Arc::new(metrics), config.health.clone()));
        let controller = Arc::new(ShutdownController::new(
            config.shutdown.clone(),
            store.clone(),
            health,
        ));

        Ok(Self { store, controller })
    }

    pub fn detector(&self, config: &AppConfig) -> Result<Arc<AnomalyDetector>> {
        Ok(Arc::new(AnomalyDetector::new(
            config.detection.clone(),
            self.store.clone(),
        )?))
    }
}
