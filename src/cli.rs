use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_STATE_PATH;

/// overlordd - persistent task-orchestration daemon
#[derive(Parser)]
#[command(name = "overlordd")]
#[command(about = "Runs and inspects crash-resilient changes made of dependent tasks")]
#[command(version)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ensure loop until SIGINT/SIGTERM
    Run {
        /// Path to the daemon configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the state file named in the configuration
        #[arg(short, long)]
        state: Option<PathBuf>,
    },
    /// List the changes in a state file
    Changes {
        /// State file to read
        #[arg(short, long, default_value = DEFAULT_STATE_PATH)]
        state: PathBuf,

        /// Print the changes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the tasks of one change
    Tasks {
        /// Change id
        change: u64,

        /// State file to read
        #[arg(short, long, default_value = DEFAULT_STATE_PATH)]
        state: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["overlordd"]).is_err());
    }

    #[test]
    fn test_cli_run_with_config_and_state() {
        let cli = Cli::try_parse_from([
            "overlordd",
            "run",
            "--config",
            "/etc/overlord.json",
            "--state",
            "/tmp/state.json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run { config, state } => {
                assert_eq!(config, Some(PathBuf::from("/etc/overlord.json")));
                assert_eq!(state, Some(PathBuf::from("/tmp/state.json")));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_changes_defaults_state_path() {
        let cli = Cli::try_parse_from(["overlordd", "changes"]).expect("parse");
        match cli.command {
            Commands::Changes { state, json } => {
                assert_eq!(state, PathBuf::from(DEFAULT_STATE_PATH));
                assert!(!json);
            }
            _ => panic!("Expected Changes command"),
        }
    }

    #[test]
    fn test_cli_tasks_takes_change_id() {
        let cli = Cli::try_parse_from(["overlordd", "-v", "tasks", "42", "--state", "s.json"])
            .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Tasks { change, state } => {
                assert_eq!(change, 42);
                assert_eq!(state, PathBuf::from("s.json"));
            }
            _ => panic!("Expected Tasks command"),
        }
        assert!(Cli::try_parse_from(["overlordd", "tasks", "nope"]).is_err());
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["overlordd", "validate", "/path/to/config.json"])
            .expect("parse");
        match cli.command {
            Commands::Validate { config } => {
                assert_eq!(config, PathBuf::from("/path/to/config.json"));
            }
            _ => panic!("Expected Validate command"),
        }
    }
}
