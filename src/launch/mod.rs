mod child;
mod program;
mod state_dir;
mod validate;

use child::{ChildSpec, WorkingDir};
use state_dir::StateDir;
use validate::{validate_home, validate_image};

use crate::config::Config;
use crate::error::Error;
use crate::loopdev::{LoopAllocator, LoopBinding};
use crate::mounts::{Layerer, MountPlan, MountedRoot, PlanInputs, SysMounter};
use crate::namespace;
use crate::privilege::{Governor, IdentityBackend};
use crate::supervisor::Supervisor;
use crate::templates::{Account, ensure_identity_templates};
use crate::types::{ImageId, Invoker};
use crate::util::{Lock, LockMode, mkdir};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::unistd::Uid;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// The image file, opened by the invoking user, twice: once to lock and
/// once to hand to the loop device. Two opens give two open file
/// descriptions, so the lock is independent of whatever the kernel does
/// with the other one.
struct ImageFiles {
    path: PathBuf,
    lock: File,
    backing: File,
}

impl ImageFiles {
    fn open(path: &Path, writable: bool) -> Result<ImageFiles> {
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(writable)
                .open(path)
                .context(format!("Could not open image {}", path.display()))
        };
        Ok(ImageFiles {
            path: path.to_path_buf(),
            lock: open()?,
            backing: open()?,
        })
    }

    /// Readers share the image, a writable launch needs it to itself.
    fn lock(self, writable: bool) -> Result<(Lock, File)> {
        let mode = if writable {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let lock = Lock::try_acquire(self.lock, &self.path, mode)?
            .ok_or_else(|| Error::ImageLocked(self.path.clone()))?;
        Ok((lock, self.backing))
    }
}

/// Locks and references that must outlive the container process.
struct Held {
    _image_lock: Lock,
    _setup_lock: Lock,
    _binding: LoopBinding,
}

/**
 * Launch a container for `config` and supervise it until it exits.
 *
 * Expects the governor to be restricted on entry and leaves it restricted.
 * Returns the exit status to report for the container process.
 */
pub fn launch<B: IdentityBackend>(
    config: &Config,
    invoker: &Invoker,
    governor: &Governor<B>,
) -> Result<i32> {
    governor.ensure_restricted("start a launch")?;

    let workdir = WorkingDir::capture()?;
    let image = validate_image(config.image.as_deref(), invoker.uid)?;
    validate_home(&invoker.home, invoker.uid)?;

    let files = ImageFiles::open(&image, config.writable)?;
    let image_id = ImageId::of(&image, invoker.uid)?;
    info!("Launching {} ({})", image.display(), config.command);

    let mut state = StateDir::open(
        governor,
        &config.tmp_root,
        &image_id,
        invoker,
        config.contain,
    )?;

    let result = run_container(
        config, invoker, governor, files, &image_id, &mut state, &workdir,
    );

    // Every lock taken inside the state directory is released by now
    if let Err(e) = state.teardown(governor) {
        warn!("Could not clean up state directory: {:#}", e);
    }
    result
}

fn run_container<B: IdentityBackend>(
    config: &Config,
    invoker: &Invoker,
    governor: &Governor<B>,
    files: ImageFiles,
    image_id: &ImageId,
    state: &mut StateDir,
    workdir: &WorkingDir,
) -> Result<i32> {
    let image_name = files
        .path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    let layerer = Layerer::new(SysMounter, governor);

    let (root, _held) = {
        let _elevated = governor.elevate()?;
        prepare_root(config, governor, &layerer, files, image_id, state)?
    };

    let account = Account::lookup(invoker)?;
    ensure_identity_templates(
        governor,
        &account,
        root.path(),
        &state.passwd_template(),
        &state.group_template(),
    )
    .context("Preparing identity templates")?;

    let passwd_template = state.passwd_template();
    let group_template = state.group_template();
    let base_home = invoker.base_home();
    let plan = MountPlan::build(&PlanInputs {
        sysconf_dir: &config.sysconf_dir,
        passwd_template: &passwd_template,
        group_template: &group_template,
        base_home: &base_home,
        contained_in: config.contain.then_some(state.path()),
    });

    let cwd = if config.contain {
        invoker.home.as_path()
    } else {
        workdir.path.as_path()
    };
    let spec = ChildSpec {
        root: root.path(),
        mode: &config.command,
        args: &config.args,
        exec_command: config.exec_command.as_deref(),
        image_name: &image_name,
        cwd,
        workdir,
    };

    let supervisor = {
        let _elevated = governor.elevate()?;
        layerer.apply_binds(&root, &plan)?;
        Supervisor::spawn(|| child::run(governor, &spec))?
    };

    let status = supervisor.wait()?;
    debug!("Container process exited with {}", status);
    Ok(status)
}

/**
 * The elevated half of the setup: private namespace, image lock, loop
 * device, and the image mounted on the shared mount point.
 */
fn prepare_root<B: IdentityBackend>(
    config: &Config,
    governor: &Governor<B>,
    layerer: &Layerer<'_, SysMounter, B>,
    files: ImageFiles,
    image_id: &ImageId,
    state: &mut StateDir,
) -> Result<(MountedRoot, Held)> {
    let mount_point = config.mount_point();
    mkdir(&mount_point, 0o755, Uid::from_raw(0)).map_err(|e| {
        Error::StateDirFailed(mount_point.clone(), format!("{:#}", e))
    })?;

    namespace::isolate(&config.namespaces, governor)?;

    let (image_lock, backing) = files.lock(config.writable)?;

    let outcome = state.setup_device(|| {
        let binding = LoopAllocator::new(config.max_loop_devices).attach(&backing)?;
        Ok((binding.device, binding))
    })?;
    let binding = match outcome.won {
        Some(binding) => binding,
        None => LoopBinding::reuse(&outcome.device, image_id)?.ok_or_else(|| {
            Error::CacheUnavailable(state.path().join("loop_dev"))
        })?,
    };

    let root = layerer.mount_root(&binding.path(), &mount_point, config.writable)?;
    Ok((
        root,
        Held {
            _image_lock: image_lock,
            _setup_lock: outcome.lock,
            _binding: binding,
        },
    ))
}
