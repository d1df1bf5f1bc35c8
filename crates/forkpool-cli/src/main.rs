//! forkpool CLI - run a command in a bounded pool of background processes
//!
//! Thin front end over the forkpool library: argument parsing, output, and
//! exit codes live here, everything process-related lives in the library.

mod cli;
mod command_worker;
mod output;

use clap::Parser;
use cli::{Cli, Commands, RunArgs, StatusArgs, StopArgs};
use command_worker::CommandWorker;
use forkpool::{
    DaemonConfig, ForkpoolError, InstanceStatus, Outcome, Result, Supervisor, TracingSink,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Interval between pid file checks while `stop --wait` is pending
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("forkpool: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_supervisor(*args, cli.silent),
        Commands::Status(args) => run_status(&args),
        Commands::Stop(args) => run_stop(&args, cli.silent),
    }
}

/// Start the supervisor for `args.command`
fn run_supervisor(args: RunArgs, silent: bool) -> Result<()> {
    let config = DaemonConfig::builder(&args.instance.name)
        .pid_file(args.instance.pid_file())
        .pool_size(args.pool)
        .blocking(args.blocking)
        .daemonize(!args.foreground)
        .build()?;

    // Resolve before forking so a typo fails here, with a terminal attached
    let worker = CommandWorker::from_command(&args.command)?;
    output::print_starting(&config, worker.program(), silent);

    let foreground = !config.daemonize();
    let mut supervisor = Supervisor::new(config, worker);
    if foreground {
        supervisor = supervisor.with_sink(Box::new(TracingSink));
    }

    match supervisor.run()? {
        Outcome::Detached { daemon_pid } => output::print_detached(daemon_pid, silent),
        Outcome::AlreadyRunning { pid } => info!("Already running as {}", pid),
        Outcome::Terminated { signal } => info!("Stopped by {:?}", signal),
    }
    Ok(())
}

fn run_status(args: &StatusArgs) -> Result<()> {
    let pid_file = args.instance.pid_file();
    let status = InstanceStatus::inspect(&pid_file)?;
    output::print_status(&status, &pid_file, args.json)
}

/// Send SIGTERM to the recorded owner and optionally wait for it to clean up
fn run_stop(args: &StopArgs, silent: bool) -> Result<()> {
    let pid_file = args.instance.pid_file();
    let pid = match InstanceStatus::inspect(&pid_file)? {
        InstanceStatus::Running { pid } => Pid::from_raw(pid),
        status => {
            if !silent {
                output::print_status(&status, &pid_file, false)?;
            }
            return Ok(());
        }
    };

    kill(pid, Signal::SIGTERM)
        .map_err(|e| ForkpoolError::Io(std::io::Error::from(e)))?;
    info!("Sent SIGTERM to {}", pid);

    if args.wait == 0 {
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(args.wait);
    while pid_file.exists() {
        if Instant::now() >= deadline {
            return Err(ForkpoolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!(
                    "{} still present after {}s (pid {})",
                    pid_file.display(),
                    args.wait,
                    pid
                ),
            )));
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
    output::print_stopped(pid, silent);
    Ok(())
}
