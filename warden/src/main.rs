use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::unistd::Pid;
use tracing::{debug, error};
use warden::logger::init_logger;
use warden::supervisor;

const SHORT_HELP: &str = "Tracks a process tree and reaps it when its owner exits.";
const LONG_HELP: &str = "Tracks a process tree and reaps it when its owner exits.

Spawned with two pids: the process whose descendants are tracked, and a
trigger process whose exit (like the watched process's own exit) starts
the reap. Once subscribed to the kernel's process events the supervisor
writes a single '0' byte to fd 1 so the spawning process knows tracking
is live, then runs until the tree is fully drained.";

#[derive(Debug, Parser)]
#[command(about = SHORT_HELP, long_about = LONG_HELP)]
struct Cli {
    /// Process whose descendants define the tree
    #[arg(value_name = "WATCHED_PID")]
    watched: i32,

    /// Process whose exit triggers the reap, normally the caller
    #[arg(value_name = "TRIGGER_PID")]
    trigger: i32,

    /// Append logs to this file in addition to stderr
    #[arg(short, long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(err) = init_logger(&args.log_file) {
        eprintln!("failed to initialize logger: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(err = ?err, "exiting with failure");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<()> {
    let pid_max = read_pid_max().context("failed to read the pid ceiling")?;
    let watched = checked_pid(args.watched, pid_max)?;
    let trigger = checked_pid(args.trigger, pid_max)?;

    // The spawning process shouldn't leak fds to us, but just in case;
    // nothing beyond the handshake pipes on 0 and 1 is ours to keep.
    unsafe { close_fds::close_open_fds(3, &[]) };
    debug!("closed inherited fds");

    supervisor::run(watched, trigger)
}

/// The kernel's pid ceiling, used to bound argument validation.
fn read_pid_max() -> Result<i32> {
    let raw = read_to_string("/proc/sys/kernel/pid_max")
        .context("failed to read /proc/sys/kernel/pid_max")?;
    raw.trim()
        .parse()
        .with_context(|| format!("invalid pid_max {raw:?}"))
}

fn checked_pid(pid: i32, pid_max: i32) -> Result<Pid> {
    if pid <= 1 || pid > pid_max {
        bail!("pid {pid} outside the valid range [2, {pid_max}]");
    }
    Ok(Pid::from_raw(pid))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejects_out_of_range_pids() {
        assert!(checked_pid(-5, 4_194_304).is_err());
        assert!(checked_pid(0, 4_194_304).is_err());
        assert!(checked_pid(1, 4_194_304).is_err());
        assert!(checked_pid(4_194_305, 4_194_304).is_err());
    }

    #[test]
    fn accepts_the_valid_pid_range() {
        assert_eq!(checked_pid(2, 4_194_304).unwrap(), Pid::from_raw(2));
        assert_eq!(
            checked_pid(4_194_304, 4_194_304).unwrap(),
            Pid::from_raw(4_194_304)
        );
    }

    #[test]
    fn pid_max_is_sane_on_this_machine() {
        assert!(read_pid_max().unwrap() > 1);
    }

    #[test]
    fn parses_positional_pids() {
        let cli = Cli::parse_from(["warden", "123", "456"]);
        assert_eq!(cli.watched, 123);
        assert_eq!(cli.trigger, 456);
        assert_eq!(cli.log_file, None);
    }
}
