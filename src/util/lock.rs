use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::trace;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn blocking(self) -> FlockArg {
        match self {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        }
    }

    fn nonblocking(self) -> FlockArg {
        match self {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        }
    }
}

/**
 * An advisory `flock(2)` lock held for as long as this value lives.
 *
 * Locks belong to the open file description, so two independently opened
 * descriptors of the same file contend with each other even inside one
 * process.
 */
pub struct Lock {
    path: PathBuf,
    mode: LockMode,
    lock: Flock<File>,
}

impl Lock {
    /** Open (creating if needed) a lock file. */
    pub fn open_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|e| {
                anyhow!("Failed to open lock file {}: {}", path.display(), e)
            })
    }

    /** Open a directory so it can be locked. */
    pub fn open_dir(path: &Path) -> Result<File> {
        File::open(path).map_err(|e| {
            anyhow!("Failed to open directory {}: {}", path.display(), e)
        })
    }

    /**
     * Attempt to take the lock without blocking. Returns `Ok(None)` when a
     * conflicting lock is held by someone else.
     */
    pub fn try_acquire(
        file: File,
        path: &Path,
        mode: LockMode,
    ) -> Result<Option<Lock>> {
        trace!("Trying {:?} lock on {}", mode, path.display());
        match Flock::lock(file, mode.nonblocking()) {
            Ok(lock) => {
                trace!("Acquired {:?} lock {}", mode, path.display());
                Ok(Some(Lock {
                    path: path.to_path_buf(),
                    mode,
                    lock,
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, e)) => Err(anyhow!(
                "Failed to acquire lock {}: {}",
                path.display(),
                e
            )),
        }
    }

    /** Block until the lock is ours. */
    pub fn acquire(file: File, path: &Path, mode: LockMode) -> Result<Lock> {
        trace!("Acquiring {:?} lock {}", mode, path.display());
        let lock = Flock::lock(file, mode.blocking())
            .map_err(|(_, e)| anyhow!("Failed to acquire lock: {}", e))?;
        trace!("Acquired {:?} lock {}", mode, path.display());
        Ok(Lock {
            path: path.to_path_buf(),
            mode,
            lock,
        })
    }

    #[cfg(test)]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /** Trade an exclusive hold for a shared one. */
    pub fn downgrade(&mut self) -> Result<()> {
        relock(&self.lock, libc::LOCK_SH | libc::LOCK_NB).map_err(|e| {
            anyhow!("Failed to downgrade lock {}: {}", self.path.display(), e)
        })?;
        trace!("Downgraded lock {} to shared", self.path.display());
        self.mode = LockMode::Shared;
        Ok(())
    }

    /**
     * Try to turn a shared hold into an exclusive one without blocking.
     * Returns false if anyone else still holds the lock.
     */
    pub fn try_upgrade(&mut self) -> Result<bool> {
        match relock(&self.lock, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                self.mode = LockMode::Exclusive;
                Ok(true)
            }
            Err(Errno::EWOULDBLOCK) => Ok(false),
            Err(e) => Err(anyhow!(
                "Failed to upgrade lock {}: {}",
                self.path.display(),
                e
            )),
        }
    }
}

fn relock(file: &File, operation: libc::c_int) -> nix::Result<()> {
    Errno::result(unsafe { libc::flock(file.as_raw_fd(), operation) })
        .map(drop)
}

impl Drop for Lock {
    fn drop(&mut self) {
        trace!("Unlocking lock {}", self.path.display());
    }
}
