use super::program::{self, RUNSCRIPT};
use crate::config::CommandMode;
use crate::error::{Error, exit_code_for};
use crate::privilege::{Governor, IdentityBackend};
use crate::util::mount;
use anyhow::{Context, Result, anyhow};
use log::{error, trace};
use nix::mount::MsFlags;
use nix::unistd::{AccessFlags, access, chdir, chroot, execve, fchdir};
use std::convert::Infallible;
use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// The directory we were started in, by path and by descriptor. The
/// descriptor still works when the path does not exist inside the
/// container.
pub struct WorkingDir {
    pub path: PathBuf,
    fd: File,
}

impl WorkingDir {
    pub fn capture() -> Result<WorkingDir> {
        let fd = File::open(".").context("Could not open current directory")?;
        let path = std::env::current_dir()
            .context("Could not obtain current directory path")?;
        Ok(WorkingDir { path, fd })
    }
}

/// Everything the container process needs once it has been forked.
pub struct ChildSpec<'a> {
    pub root: &'a Path,
    pub mode: &'a CommandMode,
    pub args: &'a [String],
    pub exec_command: Option<&'a str>,
    pub image_name: &'a OsStr,
    /// Where to start inside the container.
    pub cwd: &'a Path,
    pub workdir: &'a WorkingDir,
}

/**
 * Body of the forked container process. Only returns if something went
 * wrong before or during exec, with the status the child should exit with.
 */
pub fn run<B: IdentityBackend>(governor: &Governor<B>, spec: &ChildSpec) -> i32 {
    match enter(governor, spec) {
        Ok(never) => match never {},
        Err(e) => {
            error!("ABORT: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn enter<B: IdentityBackend>(
    governor: &Governor<B>,
    spec: &ChildSpec,
) -> Result<Infallible> {
    chroot(spec.root)
        .context(format!("failed to enter container {}", spec.root.display()))?;
    chdir("/").context("failed to chdir to /")?;

    for (fstype, target) in [("proc", "/proc"), ("sysfs", "/sys")] {
        let target = Path::new(target);
        if target.is_dir() {
            mount(
                Some(Path::new(fstype)),
                target,
                Some(fstype),
                MsFlags::empty(),
                None,
            )
            .map_err(|e| anyhow!("Could not mount {}: {}", target.display(), e))?;
        }
    }

    governor.drop_permanently()?;

    let env = program::container_env(std::env::vars_os(), spec.image_name)?;

    if spec.cwd.is_dir() {
        trace!("Setting CWD to {}", spec.cwd.display());
        chdir(spec.cwd)
            .context(format!("Could not chdir to {}", spec.cwd.display()))?;
    } else {
        trace!("{} not in container, keeping original CWD", spec.cwd.display());
        fchdir(spec.workdir.fd.as_raw_fd()).context("Could not fchdir to cwd")?;
    }

    let runscript_executable = Path::new(RUNSCRIPT).is_file()
        && access(RUNSCRIPT, AccessFlags::X_OK).is_ok();
    let program = program::resolve(
        spec.mode,
        spec.args,
        spec.exec_command,
        runscript_executable,
    )?;

    trace!("Executing {:?}", program.argv);
    // This never returns on success
    let Err(errno) = execve(&program.path, &program.argv, &env);
    Err(Error::ExecFailed {
        program: program.path.to_string_lossy().into_owned(),
        errno,
    }
    .into())
}
