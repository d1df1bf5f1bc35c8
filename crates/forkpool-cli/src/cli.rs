//! CLI argument definitions for forkpool
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Parser, Subcommand};
use forkpool::config::{default_pid_file, DEFAULT_POOL_SIZE};
use std::path::PathBuf;

/// Default instance name (pid file `/var/run/forkpool.pid`)
pub const DEFAULT_NAME: &str = "forkpool";

/// forkpool - run a command in a bounded pool of background processes
///
/// Detaches from the terminal, keeps one live instance per pid file, and
/// keeps at most N copies of the command running at any time.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Silent mode - suppress all forkpool output
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise a command, restarting it in up to N concurrent children
    #[command(trailing_var_arg = true)]
    #[command(after_help = "EXAMPLES:
    # Keep 10 copies of a queue consumer running in the background
    forkpool run -- ./consume-queue

    # Four workers, custom pid file, stay in the foreground
    forkpool run --pool 4 --pid-file /tmp/consumer.pid --foreground -- ./consume-queue

    # Let the kernel suspend the supervisor while the pool is full
    forkpool run --blocking --pool 2 -- php worker.php
")]
    Run(Box<RunArgs>),

    /// Report whether an instance owns the pid file
    #[command(after_help = "EXAMPLES:
    # Check the default instance
    forkpool status

    # JSON output for scripts
    forkpool status --pid-file /tmp/consumer.pid --json
")]
    Status(StatusArgs),

    /// Ask a running instance to shut down (SIGTERM)
    Stop(StopArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct InstanceArgs {
    /// Instance name; selects the default pid file /var/run/<NAME>.pid
    #[arg(long, value_name = "NAME", default_value = DEFAULT_NAME)]
    pub name: String,

    /// Pid file identifying the instance (overrides --name)
    #[arg(long, short = 'p', value_name = "FILE")]
    pub pid_file: Option<PathBuf>,
}

impl InstanceArgs {
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| default_pid_file(&self.name))
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Maximum number of concurrently running children
    #[arg(long, short = 'n', value_name = "N", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool: u32,

    /// Blocking admission: suspend in the kernel while the pool is full.
    /// Children return their own slot; each wait is capped so signals stay prompt.
    #[arg(long)]
    pub blocking: bool,

    /// Do not detach from the terminal
    #[arg(long, short = 'f')]
    pub foreground: bool,

    /// Command to run in every child
    #[arg(required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub instance: InstanceArgs,

    /// Seconds to wait for the pid file to disappear (0 = don't wait)
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub wait: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses_trailing_command() {
        let cli = Cli::parse_from([
            "forkpool", "run", "--pool", "3", "--foreground", "--", "sleep", "1",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.pool, 3);
                assert!(args.foreground);
                assert!(!args.blocking);
                assert_eq!(args.command, vec!["sleep", "1"]);
                assert_eq!(
                    args.instance.pid_file(),
                    PathBuf::from("/var/run/forkpool.pid")
                );
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_pid_file_overrides_name() {
        let cli = Cli::parse_from(["forkpool", "status", "--name", "x", "-p", "/tmp/y.pid"]);
        match cli.command {
            Commands::Status(args) => {
                assert_eq!(args.instance.pid_file(), PathBuf::from("/tmp/y.pid"));
                assert!(!args.json);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn test_name_selects_default_pid_file() {
        let cli = Cli::parse_from(["forkpool", "stop", "--name", "consumer"]);
        match cli.command {
            Commands::Stop(args) => {
                assert_eq!(
                    args.instance.pid_file(),
                    PathBuf::from("/var/run/consumer.pid")
                );
                assert_eq!(args.wait, 10);
            }
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["forkpool", "run"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
