//! Log output for the daemon.
//!
//! Two sinks with independent filters: `stderr`, which only matters
//! while the supervisor still has a terminal (it gets parked on
//! `/dev/null` during detach), and an optional log file that survives
//! the detach and is the only place post-readiness failures can be
//! seen.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Controls what reaches the log file; `RUST_LOG` governs stderr.
const FILE_FILTER_ENV: &str = "_WARDEN_LOG_LEVEL";

/// Installs the global subscriber. Call once, before anything logs.
pub fn init_logger(log_file: &Option<PathBuf>) -> Result<(), anyhow::Error> {
    let file_layer = match log_file {
        Some(path) => {
            let sink = open_log_file(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(sink)
                    .with_filter(EnvFilter::from_env(FILE_FILTER_ENV)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .init();
    Ok(())
}

/// Opens the daemon's log file for appending.
///
/// Relative paths are anchored to the current directory up front,
/// before the supervisor chdirs to `/`. The file is appended to, never
/// truncated: a host hands the same path to every supervisor it
/// spawns, and each invocation's lines must survive the next one.
fn open_log_file(path: &Path) -> Result<File, anyhow::Error> {
    let path = if path.is_relative() {
        std::env::current_dir()
            .context("failed to resolve the current directory")?
            .join(path)
    } else {
        path.to_path_buf()
    };
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn creates_a_missing_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.log");

        let mut first = open_log_file(&path).unwrap();
        writeln!(first, "first run").unwrap();
        drop(first);

        let mut second = open_log_file(&path).unwrap();
        writeln!(second, "second run").unwrap();
        drop(second);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first run\nsecond run\n");
    }

    #[test]
    fn anchors_relative_paths_to_the_current_directory() {
        // The cwd is process-global state; restore it before asserting.
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let opened = open_log_file(Path::new("relative.log"));
        std::env::set_current_dir(original).unwrap();

        opened.unwrap();
        assert!(dir.path().join("relative.log").exists());
    }
}
