//! Bookkeeping for the process tree hanging off a single watched process.
//!
//! The tree is fed decoded fork/exit events and mirrors what the kernel
//! did: children are recorded under their parent, an exiting parent's
//! children are re-parented to init, and processes we have no ancestry
//! for are remembered in an ignore set so later events about them are
//! cheap no-ops. When the watched process or the trigger process exits,
//! every process still known to the tree is killed, and the tree keeps
//! consuming exit events until nothing it counts as alive remains.
//!
//! The event feed is lossy by nature. A missed fork means the orphaned
//! subtree classifies itself into the ignore set on its next event, which
//! errs on the side of not killing; a missed exit means the live count
//! overestimates until the next reap sweeps the whole known set anyway.

use std::collections::{HashMap, HashSet};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::events::ProcEvent;

/// Pid 1. Orphans are re-parented to it, and it is never a kill target.
pub const INIT: Pid = Pid::from_raw(1);

/// Delivers the reaping signal. The seam exists so tests can observe
/// which pids would be killed without signalling anything.
pub trait Signaller {
    fn kill(&mut self, pid: Pid) -> Result<(), Errno>;
}

/// The real thing: unconditional SIGKILL.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelSignaller;

impl Signaller for KernelSignaller {
    fn kill(&mut self, pid: Pid) -> Result<(), Errno> {
        kill(pid, Signal::SIGKILL)
    }
}

/// Live parent/child bookkeeping rooted at one watched process.
#[derive(Debug)]
pub struct ProcessTree<S = KernelSignaller> {
    /// The process whose descendants define the tree.
    watched: Pid,
    /// The process whose exit also starts the reap, commonly the caller.
    trigger: Pid,
    /// Parent pid to live children. A pid is a key iff it was seen with
    /// at least one live child.
    children: HashMap<Pid, Vec<Pid>>,
    /// Child pid to parent pid. Re-parenting to init rewrites the value
    /// to pid 1; the entry itself only goes away on exit.
    parents: HashMap<Pid, Pid>,
    /// Pids classified as outside the tree.
    ignored: HashSet<Pid>,
    /// Processes counted as alive inside the tree, the watched process
    /// included.
    live: u32,
    /// Latched on the first reap; never cleared.
    reaping: bool,
    signaller: S,
}

impl ProcessTree<KernelSignaller> {
    pub fn new(watched: Pid, trigger: Pid) -> Self {
        Self::with_signaller(watched, trigger, KernelSignaller)
    }
}

impl<S: Signaller> ProcessTree<S> {
    pub fn with_signaller(watched: Pid, trigger: Pid, signaller: S) -> Self {
        Self {
            watched,
            trigger,
            children: HashMap::new(),
            parents: HashMap::new(),
            ignored: HashSet::new(),
            live: 1,
            reaping: false,
            signaller,
        }
    }

    pub fn watched(&self) -> Pid {
        self.watched
    }

    /// Processes currently counted as alive inside the tree.
    pub fn live(&self) -> u32 {
        self.live
    }

    /// True once nothing inside the tree is left alive.
    pub fn done(&self) -> bool {
        self.live == 0
    }

    pub fn apply(&mut self, event: ProcEvent) {
        match event {
            ProcEvent::Fork { parent, child } => self.on_fork(parent, child),
            ProcEvent::Exit { pid } => self.on_exit(pid),
        }
    }

    /// Records a fork, classifying the parent against what the tree
    /// already knows.
    pub fn on_fork(&mut self, parent: Pid, child: Pid) {
        if self.ignored.contains(&parent) {
            // Outside the tree. The child stays unrecorded until it
            // shows up in an event of its own.
            return;
        }
        if parent != INIT && self.children.contains_key(&parent) {
            self.children.entry(parent).or_default().push(child);
        } else if self.parents.contains_key(&parent) || parent == self.watched {
            // A known child (or the root itself) became a parent.
            self.children.insert(parent, vec![child]);
        } else {
            // A fork with no ancestry in the tree: neither side is
            // reachable from the watched process. A currently tracked
            // child pid can only mean stale reuse after a missed exit;
            // leave the tracked entry alone.
            self.ignored.insert(parent);
            if !self.parents.contains_key(&child) {
                self.ignored.insert(child);
            }
            return;
        }
        trace!(parent = parent.as_raw(), child = child.as_raw(), "fork");
        // A lingering ignore entry for this pid means it was reused
        // since we wrote it off; the pid is ours now.
        self.ignored.remove(&child);
        self.parents.insert(child, parent);
        self.live += 1;
        if self.reaping {
            // The tree is already being torn down; the newcomer goes
            // with it before anything else is processed.
            self.reap();
        }
    }

    /// Records an exit, reaping first when the exiting process is the
    /// trigger or the watched process itself.
    pub fn on_exit(&mut self, pid: Pid) {
        if pid == self.trigger {
            debug!(pid = pid.as_raw(), "trigger process exited");
            self.reap();
            // The trigger may live outside the tree; it never touches
            // the live count here.
        }
        if pid == self.watched {
            info!(pid = pid.as_raw(), "watched process exited");
            self.reap();
            self.live = self.live.saturating_sub(1);
        }
        if self.ignored.remove(&pid) {
            return;
        }

        let mut was_parent = false;
        if let Some(orphans) = self.children.remove(&pid) {
            was_parent = true;
            for child in orphans {
                if let Some(parent) = self.parents.get_mut(&child) {
                    if *parent == pid {
                        debug!(child = child.as_raw(), "re-parented to init");
                        *parent = INIT;
                    }
                }
            }
        }

        match self.parents.remove(&pid) {
            None => {
                // The watched pid was already accounted for above.
                if was_parent && pid != self.watched {
                    trace!(pid = pid.as_raw(), "exit");
                    self.live = self.live.saturating_sub(1);
                }
            }
            Some(parent) => {
                trace!(pid = pid.as_raw(), parent = parent.as_raw(), "exit");
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|&sibling| sibling != pid);
                }
                if pid != self.watched {
                    self.live = self.live.saturating_sub(1);
                }
            }
        }
    }

    /// Kills every process the tree knows about, init excepted, and
    /// latches so any later fork into the tree is killed on sight.
    ///
    /// The maps are left alone: the exit events the kills produce are
    /// what drives the bookkeeping down to zero.
    pub fn reap(&mut self) {
        self.reaping = true;
        let Self {
            parents, signaller, ..
        } = self;
        let mut count = 0usize;
        for &pid in parents.keys() {
            if pid == INIT {
                continue;
            }
            match signaller.kill(pid) {
                // Already gone is as good as killed.
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "failed to kill process");
                }
            }
            count += 1;
        }
        if count > 0 {
            info!(
                watched = self.watched.as_raw(),
                count, "reaped process tree"
            );
        }
    }
}
