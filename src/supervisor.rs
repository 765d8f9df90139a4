use crate::error::{EXIT_ABORT, Error};
use anyhow::{Result, anyhow};
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

/// Signals the parent relays to the child. SIGKILL cannot be caught by
/// anyone, so it is not in here.
pub const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGHUP,
];

/// How long one wait for a signal may take before we poll the child again.
const WAIT_SLICE_NS: libc::c_long = 100_000_000;

fn supervised_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in FORWARDED_SIGNALS {
        set.add(signal);
    }
    set.add(Signal::SIGCHLD);
    set
}

/// Blocks the supervised signals for as long as it lives.
struct BlockedSignals {
    set: SigSet,
    previous: SigSet,
}

impl BlockedSignals {
    fn block() -> Result<BlockedSignals> {
        let set = supervised_set();
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(|e| anyhow!("Failed to block signals: {}", e))?;
        Ok(BlockedSignals { set, previous })
    }

    fn restore(&self) -> nix::Result<()> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None)
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("Failed to restore signal mask: {}", e);
        }
    }
}

/**
 * Owns the container child process. The forwarded signals are blocked in
 * the parent from before the fork until the child is reaped, and picked up
 * synchronously while waiting, so no handler or global pid is involved.
 */
pub struct Supervisor {
    child: Pid,
    /// The child is init of a PID namespace of its own.
    namespace_init: bool,
    signals: BlockedSignals,
}

/**
 * Whether `child` lives in a different PID namespace than we do, which
 * makes it that namespace's init: the first process forked after
 * `unshare(CLONE_NEWPID)`.
 */
fn is_namespace_init(child: Pid) -> bool {
    let own = std::fs::read_link("/proc/self/ns/pid");
    let theirs = std::fs::read_link(format!("/proc/{}/ns/pid", child));
    match (own, theirs) {
        (Ok(own), Ok(theirs)) => own != theirs,
        _ => false,
    }
}

/**
 * The signal to deliver for a forwarded `signal`. A namespace init only
 * receives signals it installed a handler for, and nothing has by the time
 * we exec, so it gets SIGKILL instead. Every forwarded signal terminates by
 * default, so this does not change what the user asked for.
 */
fn relayed(signal: Signal, namespace_init: bool) -> Signal {
    if namespace_init {
        Signal::SIGKILL
    } else {
        signal
    }
}

impl Supervisor {
    /**
     * Fork and run `child` in the new process. `child` is expected to exec;
     * if it returns, its value becomes the child's exit status.
     */
    pub fn spawn<F: FnOnce() -> i32>(child: F) -> Result<Supervisor> {
        let signals = BlockedSignals::block()?;

        match unsafe { fork() } {
            Err(e) => Err(Error::ForkFailed(e).into()),
            Ok(ForkResult::Child) => {
                let status = match signals.restore() {
                    Ok(()) => child(),
                    Err(_) => EXIT_ABORT,
                };
                unsafe { libc::_exit(status) }
            }
            Ok(ForkResult::Parent { child }) => {
                let namespace_init = is_namespace_init(child);
                debug!(
                    "Forked container process {}{}",
                    child,
                    if namespace_init { " (PID namespace init)" } else { "" }
                );
                Ok(Supervisor {
                    child,
                    namespace_init,
                    signals,
                })
            }
        }
    }

    #[cfg(test)]
    pub fn pid(&self) -> Pid {
        self.child
    }

    /**
     * Wait for the child to terminate, relaying forwarded signals to it in
     * the meantime. Returns the exit status to report for it: its own exit
     * code, or 128 plus the signal number that killed it.
     */
    pub fn wait(self) -> Result<i32> {
        loop {
            if let Some(status) = self.reap()? {
                return Ok(status);
            }

            let timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: WAIT_SLICE_NS,
            };
            let signo = unsafe {
                libc::sigtimedwait(
                    self.signals.set.as_ref(),
                    std::ptr::null_mut(),
                    &timeout,
                )
            };
            if signo < 0 {
                match Errno::last() {
                    Errno::EAGAIN | Errno::EINTR => continue,
                    e => return Err(anyhow!("Failed waiting for signals: {}", e)),
                }
            }

            match Signal::try_from(signo) {
                Ok(Signal::SIGCHLD) => {}
                Ok(signal) => self.forward(signal),
                Err(_) => trace!("Ignoring unexpected signal {}", signo),
            }
        }
    }

    fn forward(&self, signal: Signal) {
        let relayed = relayed(signal, self.namespace_init);
        debug!(
            "Forwarding {} to container process {} as {}",
            signal, self.child, relayed
        );
        if let Err(e) = kill(self.child, relayed) {
            // ESRCH just means it is already gone and about to be reaped
            trace!("Failed to signal {}: {}", self.child, e);
        }
    }

    fn reap(&self) -> Result<Option<i32>> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                debug!("Container process exited with {}", code);
                Ok(Some(code))
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!("Container process killed by {}", signal);
                Ok(Some(128 + signal as i32))
            }
            Ok(_) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(anyhow!("Failed to wait for {}: {}", self.child, e)),
        }
    }
}
