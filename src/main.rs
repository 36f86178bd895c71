use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tripwire::cli::{Cli, Commands};
use tripwire::config::AppConfig;
use tripwire::domain::ShutdownPhase;
use tripwire::{ExtremeMarketSource, MarketDataFeed, ReplayFeed, ShutdownOutcome, TriggerSource};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, Runtime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { replay } => {
            let _guard = init_logging(&config.logging);
            run(config, replay).await
        }
        Commands::Status { events } => {
            init_logging_simple();
            status(config, events).await
        }
        Commands::Shutdown { reason } => {
            init_logging_simple();
            shutdown(config, &reason).await
        }
        Commands::Recovery { mark_started } => {
            init_logging_simple();
            recovery(config, mark_started).await
        }
    }
}

async fn run(config: AppConfig, replay: std::path::PathBuf) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        bail!("{} configuration errors", errors.len());
    }

    let runtime = Runtime::build(&config)?;
    let detector = runtime.detector(&config)?;
    let feed: Arc<dyn MarketDataFeed> = Arc::new(
        ReplayFeed::from_jsonl(&replay)
            .with_context(|| format!("loading replay file {}", replay.display()))?,
    );

    runtime.controller.mark_system_started().await?;
    info!(
        "tripwire started: {} symbols, state in {}",
        config.detection.symbols.len(),
        runtime.store.dir().display()
    );

    let extreme: Arc<dyn TriggerSource> = Arc::new(ExtremeMarketSource::new(
        detector.subscribe(),
        config.shutdown.extreme_market_window_secs,
    ));

    let detection_task = tokio::spawn(detector.clone().run(feed));
    let mut monitor_task = tokio::spawn(runtime.controller.clone().start_monitoring(vec![extreme]));

    // Detection stops as soon as the shutdown sequence starts
    let mut phases = runtime.controller.phase_receiver();
    let phase_detector = detector.clone();
    tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            if phase != ShutdownPhase::Running {
                info!("Shutdown phase {} reached, stopping detection", phase);
                phase_detector.stop();
                break;
            }
        }
    });

    let mut outcome = tokio::select! {
        result = &mut monitor_task => monitor_result(result),
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, requesting maintenance shutdown");
            runtime.controller.stop_monitoring();
            Some(runtime.controller.manual_shutdown("maintenance").await)
        }
    };

    // A monitor-initiated shutdown may already hold the single-flight guard
    if matches!(outcome, Some(ShutdownOutcome::Rejected { .. })) && !monitor_task.is_finished() {
        info!("Waiting for the running shutdown to finish");
        outcome = monitor_result(monitor_task.await);
    }

    detector.stop();
    runtime.controller.stop_monitoring();
    if let Err(e) = detection_task.await {
        warn!("Detection task ended abnormally: {}", e);
    }

    match outcome {
        Some(outcome) => {
            info!("Shutdown outcome: {:?}", outcome);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        None => info!("Monitoring ended without a shutdown"),
    }
    Ok(())
}

fn monitor_result(
    result: std::result::Result<Option<ShutdownOutcome>, tokio::task::JoinError>,
) -> Option<ShutdownOutcome> {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Monitoring task failed: {}", e);
            None
        }
    }
}

async fn status(config: AppConfig, events: usize) -> anyhow::Result<()> {
    let runtime = Runtime::build(&config)?;
    let status = runtime.controller.get_shutdown_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if events > 0 {
        println!("-- events");
        print_tail(&runtime.store.read_events().await?, events);
        println!("-- protections");
        print_tail(&runtime.store.read_protections().await?, events);
    }
    Ok(())
}

fn print_tail(entries: &[serde_json::Value], count: usize) {
    let skip = entries.len().saturating_sub(count);
    for entry in entries.iter().skip(skip) {
        println!("{}", entry);
    }
}

async fn shutdown(config: AppConfig, reason: &str) -> anyhow::Result<()> {
    let runtime = Runtime::build(&config)?;
    let outcome = runtime.controller.manual_shutdown(reason).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let ShutdownOutcome::Rejected { reason } = outcome {
        bail!("shutdown rejected: {}", reason);
    }
    Ok(())
}

async fn recovery(config: AppConfig, mark_started: bool) -> anyhow::Result<()> {
    let runtime = Runtime::build(&config)?;
    let assessment = runtime.controller.recovery_check().await;
    println!("{}", serde_json::to_string_pretty(&assessment)?);

    if mark_started {
        if !assessment.can_recover {
            bail!("system is not healthy enough to restart");
        }
        runtime.controller.mark_system_started().await?;
        println!("System marked as running");
    }
    Ok(())
}
