use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tripwire")]
#[command(version = "0.1.0")]
#[command(about = "Market anomaly detection and graduated shutdown control", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml plus <TRIPWIRE_ENV>.toml)
    #[arg(short, long, default_value = "config", env = "TRIPWIRE_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run anomaly detection and shutdown monitoring
    Run {
        /// JSON-lines file of market samples to replay
        #[arg(short, long)]
        replay: PathBuf,
    },
    /// Show persisted status and protection state
    Status {
        /// Also print the last N event and protection log entries
        #[arg(short, long, default_value_t = 0)]
        events: usize,
    },
    /// Request a graduated shutdown
    Shutdown {
        /// maintenance, emergency, or any free-form reason
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },
    /// Check whether a stopped system can be restarted
    Recovery {
        /// Mark the system running again if recovery is possible
        #[arg(long)]
        mark_started: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shutdown() {
        let cli = Cli::parse_from(["tripwire", "shutdown", "--reason", "emergency"]);
        match cli.command {
            Commands::Shutdown { reason } => assert_eq!(reason, "emergency"),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config, PathBuf::from("config"));
    }

    #[test]
    fn test_parse_run_requires_replay() {
        assert!(Cli::try_parse_from(["tripwire", "run"]).is_err());
        let cli = Cli::try_parse_from(["tripwire", "-c", "/etc/tripwire", "run", "-r", "ticks.jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { .. }));
        assert_eq!(cli.config, PathBuf::from("/etc/tripwire"));
    }
}
