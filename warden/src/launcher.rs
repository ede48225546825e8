//! Host-side entry point: spawn a supervisor for the caller's session.
//!
//! The host authorization layer calls [`ensure_tracking`] after it has
//! mapped the session to a local account. The launcher forks the
//! supervisor, wires two pipes onto the child's fds 0 and 1, and then
//! blocks until the child reports readiness with a single `'0'` byte.
//! Anything else, including EOF, means the supervisor never got its
//! kernel subscription and the session must not proceed.

use std::fs::File;
use std::io;
use std::io::Read;
use std::os::fd::OwnedFd;

use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, Uid, dup2_stdin, dup2_stdout, fork, getpid, pipe};
use tracing::{debug, error, info};

use crate::supervisor;

/// What the host knows when it asks for tracking.
#[derive(Debug, Clone)]
pub struct TrackingRequest {
    /// The account this session was mapped to. Tracking refuses to
    /// start before the mapping has happened.
    pub mapped_uid: Option<Uid>,
    /// The process whose descendants define the session.
    pub watched: Pid,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no account mapped for this session yet")]
    NoUid,
    #[error("failed to create the handshake pipes")]
    Pipe(#[source] nix::Error),
    #[error("failed to fork the supervisor")]
    Fork(#[source] nix::Error),
    #[error("the supervisor did not report readiness")]
    Startup,
}

/// Ensures a supervisor is tracking the caller's session: the watched
/// process, its descendants, and the caller itself as the trigger.
/// Returns once the supervisor has confirmed its kernel subscription.
pub fn ensure_tracking(request: &TrackingRequest) -> Result<(), LaunchError> {
    let Some(uid) = request.mapped_uid else {
        error!("refusing to track a session with no mapped account");
        return Err(LaunchError::NoUid);
    };

    let (p2c_read, p2c_write) = pipe().map_err(LaunchError::Pipe)?;
    let (c2p_read, c2p_write) = pipe().map_err(LaunchError::Pipe)?;
    let trigger = getpid();

    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            drop(p2c_write);
            drop(c2p_read);
            let status = match supervisor_child(p2c_read, c2p_write, request.watched, trigger) {
                Ok(()) => 0,
                Err(err) => {
                    error!(err = ?err, "supervisor failed");
                    1
                }
            };
            // This process must never fall back into the caller.
            unsafe { libc::_exit(status) }
        }
        ForkResult::Parent { child } => {
            drop(p2c_read);
            drop(p2c_write);
            drop(c2p_write);
            debug!(supervisor = child.as_raw(), "spawned supervisor");

            // The direct child exits as soon as it has forked the
            // daemon out of our session.
            if let Err(err) = waitpid(child, None) {
                debug!(%err, "failed to reap the intermediate process");
            }

            match read_readiness(c2p_read) {
                Ok(b'0') => {
                    info!(
                        watched = request.watched.as_raw(),
                        uid = uid.as_raw(),
                        "session tracking is live"
                    );
                    Ok(())
                }
                Ok(byte) => {
                    error!(byte, "supervisor reported a startup failure");
                    Err(LaunchError::Startup)
                }
                Err(err) => {
                    error!(%err, "supervisor went away before reporting readiness");
                    Err(LaunchError::Startup)
                }
            }
        }
    }
}

/// Everything the forked child does before it becomes the supervisor.
/// Runs with the caller's memory image; keep it simple.
fn supervisor_child(
    handshake_in: OwnedFd,
    handshake_out: OwnedFd,
    watched: Pid,
    trigger: Pid,
) -> anyhow::Result<()> {
    dup2_stdin(&handshake_in)?;
    dup2_stdout(&handshake_out)?;
    drop(handshake_in);
    drop(handshake_out);
    supervisor::detach()?;
    supervisor::run(watched, trigger)
}

fn read_readiness(fd: OwnedFd) -> io::Result<u8> {
    let mut pipe = File::from(fd);
    let mut byte = [0u8; 1];
    // EOF surfaces as UnexpectedEof, which the caller treats the same
    // as an explicit failure byte.
    pipe.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refuses_to_launch_without_a_mapped_account() {
        let request = TrackingRequest {
            mapped_uid: None,
            watched: Pid::from_raw(1234),
        };
        assert!(matches!(
            ensure_tracking(&request),
            Err(LaunchError::NoUid)
        ));
    }
}
