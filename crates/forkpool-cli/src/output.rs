//! CLI output styling for forkpool

use colored::Colorize;
use forkpool::{DaemonConfig, ForkpoolError, InstanceStatus, Result};
use nix::unistd::Pid;
use std::path::Path;

/// Print the one-line startup summary
pub fn print_starting(config: &DaemonConfig, program: &Path, silent: bool) {
    if silent {
        return;
    }
    eprintln!(
        "{} {} {} {}",
        "forkpool".truecolor(204, 102, 0).bold(),
        program.display().to_string().white().bold(),
        format!("x{}", config.pool_size()).green(),
        format!("({}, {})", config.mode(), config.pid_file().display()).truecolor(150, 150, 150),
    );
}

/// Print where the daemon went after detaching
pub fn print_detached(daemon_pid: Pid, silent: bool) {
    if silent {
        return;
    }
    eprintln!("  {} daemon pid {}", "\u{2713}".green(), daemon_pid);
}

/// Print an instance status, human-readable or JSON
pub fn print_status(status: &InstanceStatus, pid_file: &Path, json: bool) -> Result<()> {
    if json {
        let json = serde_json::to_string_pretty(status).map_err(|e| {
            ForkpoolError::InvalidConfig(format!("JSON serialization failed: {}", e))
        })?;
        println!("{}", json);
        return Ok(());
    }

    let path = pid_file.display();
    match status {
        InstanceStatus::Running { pid } => {
            println!("{} {} (pid {})", "running".green().bold(), path, pid);
        }
        InstanceStatus::Stale { pid } => {
            println!(
                "{} {} (pid {} is gone, next start reclaims it)",
                "stale".yellow().bold(),
                path,
                pid
            );
        }
        InstanceStatus::Invalid => {
            println!("{} {} (no pid recorded)", "invalid".red().bold(), path);
        }
        InstanceStatus::NotRunning => {
            println!("{} {}", "stopped".white().bold(), path);
        }
    }
    Ok(())
}

/// Confirm that an instance went away
pub fn print_stopped(pid: Pid, silent: bool) {
    if silent {
        return;
    }
    eprintln!("  {} stopped pid {}", "\u{2713}".green(), pid);
}
