use crate::error::Error;
use crate::loopdev::LoopDevice;
use crate::privilege::{Governor, IdentityBackend};
use crate::types::{ImageId, Invoker};
use crate::util::{Lock, LockMode, join_inside, mkdir};
use anyhow::{Context, Result};
use log::{debug, trace, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/**
 * Per image launch state, shared by every concurrent launch of the same
 * image by the same user:
 *
 * ```text
 * <tmp_root>/.singularity-<uid>.<dev>.<ino>/
 *     lock        setup gate
 *     loop_dev    loop device chosen by the setup winner
 *     passwd      generated identity templates
 *     group
 *     tmp/        private /tmp and /var/tmp (contained launches)
 *     home/...    private home tree (contained launches)
 * ```
 *
 * A shared lock on the directory itself is held for the whole launch; the
 * last launch out upgrades it and removes the directory.
 */
pub struct StateDir {
    path: PathBuf,
    dir_lock: Lock,
    lock_file: File,
    cache: File,
}

/// Outcome of passing the setup gate.
pub struct SetupOutcome<W> {
    pub device: LoopDevice,
    /// What the setup closure produced, if we were the ones running it.
    pub won: Option<W>,
    /// Shared hold on the setup lock, kept until the launch ends.
    pub lock: Lock,
}

impl StateDir {
    pub fn path_for(tmp_root: &Path, image: &ImageId) -> PathBuf {
        tmp_root.join(format!(".singularity-{}", image))
    }

    /**
     * Create (or join) the state directory. Everything in it is created
     * with the invoking user's identity, so this refuses to run elevated.
     */
    pub fn open<B: IdentityBackend>(
        governor: &Governor<B>,
        tmp_root: &Path,
        image: &ImageId,
        invoker: &Invoker,
        contain: bool,
    ) -> Result<StateDir> {
        governor.ensure_restricted("prepare the state directory")?;
        let path = Self::path_for(tmp_root, image);
        let fail = |e: anyhow::Error| Error::StateDirFailed(path.clone(), format!("{:#}", e));

        mkdir(&path, 0o750, invoker.uid).map_err(fail)?;

        let dir_lock =
            Lock::try_acquire(Lock::open_dir(&path).map_err(fail)?, &path, LockMode::Shared)
                .map_err(fail)?
                .ok_or_else(|| Error::DirectoryBusy(path.clone()))?;

        let lock_file = Lock::open_file(&path.join("lock")).map_err(fail)?;
        let cache = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o644)
            .open(path.join("loop_dev"))
            .map_err(|e| fail(e.into()))?;

        if contain {
            mkdir(&path.join("tmp"), 0o750, invoker.uid).map_err(fail)?;
            mkdir(&join_inside(&path, &invoker.home), 0o750, invoker.uid)
                .map_err(fail)?;
        }

        debug!("Using state directory {}", path.display());
        Ok(StateDir {
            path,
            dir_lock,
            lock_file,
            cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn passwd_template(&self) -> PathBuf {
        self.path.join("passwd")
    }

    pub fn group_template(&self) -> PathBuf {
        self.path.join("group")
    }

    /**
     * Make sure a loop device is set up for the image, with at most one of
     * the concurrent launches doing the work. See [`pass_gate`].
     */
    pub fn setup_device<W, F>(&mut self, setup: F) -> Result<SetupOutcome<W>>
    where
        F: FnOnce() -> Result<(LoopDevice, W)>,
    {
        let lock_file = self
            .lock_file
            .try_clone()
            .context("Failed to duplicate setup lock descriptor")?;
        pass_gate(
            lock_file,
            &self.path.join("lock"),
            &mut self.cache,
            &self.path.join("loop_dev"),
            setup,
        )
    }

    /**
     * Remove the directory if no other launch is using it any more. Only
     * call this once every other lock inside the directory has been
     * released.
     */
    pub fn teardown<B: IdentityBackend>(self, governor: &Governor<B>) -> Result<()> {
        governor.ensure_restricted("remove the state directory")?;
        let StateDir {
            path,
            mut dir_lock,
            lock_file,
            cache,
        } = self;
        drop((lock_file, cache));

        if !dir_lock.try_upgrade()? {
            trace!("State directory {} still in use", path.display());
            return Ok(());
        }

        debug!("Removing state directory {}", path.display());
        remove_tree(&path);
        Ok(())
    }
}

/**
 * Single writer, many readers setup of the loop device.
 *
 * Whoever gets the exclusive lock first runs `setup`, records the device
 * in the cache file and only then downgrades to a shared lock. Everyone
 * else blocks on a shared lock, which they can only get after that
 * downgrade (or after the winner died), and then reads the cache.
 */
pub fn pass_gate<W, F>(
    lock_file: File,
    lock_path: &Path,
    cache: &mut File,
    cache_path: &Path,
    setup: F,
) -> Result<SetupOutcome<W>>
where
    F: FnOnce() -> Result<(LoopDevice, W)>,
{
    let follower_file = lock_file
        .try_clone()
        .context("Failed to duplicate setup lock descriptor")?;

    if let Some(mut lock) = Lock::try_acquire(lock_file, lock_path, LockMode::Exclusive)? {
        debug!("Setting up loop device");
        let (device, won) = setup()?;
        write_cache(cache, &device).map_err(|e| {
            Error::StateDirFailed(cache_path.to_path_buf(), e.to_string())
        })?;
        lock.downgrade()?;
        return Ok(SetupOutcome {
            device,
            won: Some(won),
            lock,
        });
    }

    debug!("Waiting for loop device setup by another launch");
    let lock = Lock::acquire(follower_file, lock_path, LockMode::Shared)?;
    let device = read_cache(cache)
        .ok_or_else(|| Error::CacheUnavailable(cache_path.to_path_buf()))?;
    debug!("Using cached loop device {}", device);
    Ok(SetupOutcome {
        device,
        won: None,
        lock,
    })
}

fn write_cache(cache: &mut File, device: &LoopDevice) -> std::io::Result<()> {
    cache.set_len(0)?;
    cache.seek(SeekFrom::Start(0))?;
    cache.write_all(device.to_string().as_bytes())?;
    cache.flush()
}

fn read_cache(cache: &mut File) -> Option<LoopDevice> {
    let mut contents = String::new();
    cache.seek(SeekFrom::Start(0)).ok()?;
    cache.read_to_string(&mut contents).ok()?;
    LoopDevice::from_path(&contents)
}

/// Best effort recursive removal that never follows symlinks.
fn remove_tree(path: &Path) {
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not remove all files in {}: {}", path.display(), e);
                continue;
            }
        };
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            warn!("Could not remove {}: {}", entry.path().display(), e);
        }
    }
}
