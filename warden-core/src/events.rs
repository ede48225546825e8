use nix::unistd::Pid;

/// A whole-process lifecycle event decoded from the kernel feed.
///
/// The event source only hands out thread-group-leader events, so every
/// pid here is a thread group id and names a process, never an individual
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcEvent {
    /// A process forked a new child process.
    Fork { parent: Pid, child: Pid },
    /// A process exited.
    Exit { pid: Pid },
}
