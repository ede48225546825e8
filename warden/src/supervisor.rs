//! The process that actually runs the tracking loop.
//!
//! The supervisor lives in its own session as root, with fds 0 and 1
//! wired to the process that launched it. Startup is a handshake: once
//! the kernel subscription is live it writes a single `'0'` byte to
//! fd 1 and parks both fds on `/dev/null`. If anything fails before
//! that byte is written the launcher reads EOF and reports failure;
//! after the byte there is nobody left to tell, so failures are only
//! logged.

use std::fs::{File, OpenOptions};
use std::os::fd::BorrowedFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::stat::{Mode, umask};
use nix::unistd::{
    ForkResult, Gid, Pid, Uid, chdir, dup2_stderr, dup2_stdin, dup2_stdout, fork, getpid,
    setresgid, setresuid, setsid, write,
};
use tracing::{info, warn};
use warden_core::tree::ProcessTree;

use crate::events::EventSocket;

/// Written to fd 1 once the kernel subscription is established.
const READY_BYTE: u8 = b'0';

/// Our end of the launcher's child-to-parent pipe.
const HANDSHAKE_OUT_FD: i32 = 1;

/// Turns the current process into a detached root daemon: root
/// real/effective ids, its own session, the root directory as cwd, and
/// stderr parked on `/dev/null`. Fds 0 and 1 are left alone, they carry
/// the launcher handshake. Returns in the surviving grandchild only.
pub fn detach() -> Result<()> {
    // The connector multicast group refuses non-root listeners, and the
    // reap must be able to kill any uid's processes.
    setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0))
        .context("failed to set real/effective gid to root")?;
    setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0))
        .context("failed to set real/effective uid to root")?;

    match unsafe { fork() }.context("failed to fork into the background")? {
        ForkResult::Parent { .. } => {
            // The intermediate process has done its job: its exit is
            // what frees the launcher from us.
            unsafe { libc::_exit(0) }
        }
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    setsid().context("failed to create a new session")?;
    chdir("/").context("failed to change to the root directory")?;
    let null = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    dup2_stderr(&null).context("failed to silence stderr")?;
    Ok(())
}

/// Runs the subscription and tracking loop to completion.
///
/// Assumes fd 1 leads to whoever is waiting for the readiness byte: the
/// launcher wires it up explicitly, and the standalone binary is
/// expected to be spawned that way.
pub fn run(watched: Pid, trigger: Pid) -> Result<()> {
    info!(
        supervisor = getpid().as_raw(),
        watched = watched.as_raw(),
        trigger = trigger.as_raw(),
        "monitoring process tree"
    );

    let mut socket = EventSocket::open().context("failed to open the event socket")?;
    socket
        .install_filter()
        .context("failed to install the event filter")?;
    socket
        .subscribe()
        .context("failed to subscribe to process events")?;

    write_readiness().context("failed to report readiness to the caller")?;
    park_handshake_fds().context("failed to release the handshake fds")?;

    let mut tree = ProcessTree::new(watched, trigger);
    let result = pump_events(&mut socket, &mut tree);

    if let Err(err) = socket.unsubscribe() {
        warn!(%err, "failed to unsubscribe from process events");
    }
    match &result {
        Ok(()) => info!(watched = watched.as_raw(), "process tree drained"),
        Err(err) => warn!(watched = watched.as_raw(), err = ?err, "tracking aborted"),
    }
    result
}

fn pump_events(socket: &mut EventSocket, tree: &mut ProcessTree) -> Result<()> {
    loop {
        // Block while anything is alive. Once the tree reports drained,
        // flush whatever is still queued and stop on the first empty
        // receive.
        match socket.next_event(tree.done())? {
            Some(event) => tree.apply(event),
            None => return Ok(()),
        }
    }
}

fn write_readiness() -> Result<(), Errno> {
    // Fd 1 is the handshake pipe, not a file we own.
    let handshake = unsafe { BorrowedFd::borrow_raw(HANDSHAKE_OUT_FD) };
    loop {
        match write(handshake, &[READY_BYTE]) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Parks both handshake fds on `/dev/null` so nothing later in the
/// supervisor's life can write into the launcher's pipes by accident.
fn park_handshake_fds() -> Result<()> {
    let null_in = File::open("/dev/null").context("failed to open /dev/null")?;
    dup2_stdin(&null_in).context("failed to park stdin")?;
    let null_out = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    dup2_stdout(&null_out).context("failed to park stdout")?;
    Ok(())
}
