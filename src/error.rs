use std::path::PathBuf;

use thiserror::Error;

/// Exit status for configuration and environment problems.
pub const EXIT_CONFIG: i32 = 1;
/// Exit status when a conflicting launch holds a lock we need.
pub const EXIT_CONTENTION: i32 = 5;
/// Exit status for any setup abort before (or instead of) a running child.
pub const EXIT_ABORT: i32 = 255;

/// Failures of the launch pipeline. Each variant maps onto the process exit
/// status through [`Error::exit_code`]; call sites wrap these in
/// `anyhow::Context` and `main` digs the typed error back out of the chain.
#[derive(Debug, Error)]
pub enum Error {
    /* Configuration */
    #[error("Container image path is undefined")]
    ImageMissing,

    #[error("Container image path is invalid: {}", .0.display())]
    ImageInvalid(PathBuf),

    #[error("Will not execute in an image you (or root) does not own: {}", .0.display())]
    ImageNotOwned(PathBuf),

    #[error("Home directory not found: {}", .0.display())]
    HomeMissing(PathBuf),

    #[error("You don't own your own home directory: {}", .0.display())]
    HomeNotOwned(PathBuf),

    #[error("Unrecognized command: {0}")]
    UnknownCommand(String),

    #[error("No command string given for exec")]
    MissingExecCommand,

    #[error(
        "Insufficient permissions to launch a container, please retry using `sudo` or setuid flags"
    )]
    NotPrivileged,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /* Contention */
    #[error("State directory {} is busy", .0.display())]
    DirectoryBusy(PathBuf),

    #[error("Image is locked by another process: {}", .0.display())]
    ImageLocked(PathBuf),

    /* Loop devices */
    #[error("No free loop device among the first {0} devices")]
    NoDeviceAvailable(u32),

    #[error("Could not create loop device {}: {}", .0.display(), .1)]
    DeviceCreateFailed(PathBuf, nix::errno::Errno),

    #[error("Could not associate image to loop device {}: {}", .0.display(), .1)]
    AssociationFailed(PathBuf, String),

    #[error("Could not retrieve loop device from cache {}", .0.display())]
    CacheUnavailable(PathBuf),

    /* Namespaces and mounts */
    #[error("Could not virtualize mount namespace: {0}")]
    NamespaceIsolationFailed(nix::errno::Errno),

    #[error("Could not mount {} on {}: {}", .0.display(), .1.display(), .2)]
    RootMountFailed(PathBuf, PathBuf, String),

    #[error("Could not bind mount {} to {}: {}", .0.display(), .1.display(), .2)]
    BindMountFailed(PathBuf, PathBuf, String),

    #[error("Required bind target does not exist in the image: {}", .0.display())]
    BindTargetMissing(PathBuf),

    /* Privilege */
    #[error("Could not switch effective identity to {0}: {1}")]
    PrivilegeTransitionFailed(String, nix::errno::Errno),

    /* Setup */
    #[error("Could not prepare state directory {}: {}", .0.display(), .1)]
    StateDirFailed(PathBuf, String),

    #[error("Failed creating template file {}: {}", .0.display(), .1)]
    TemplateFailed(PathBuf, String),

    #[error("Could not fork child process: {0}")]
    ForkFailed(nix::errno::Errno),

    /* Child */
    #[error("exec of {program} failed: {errno}")]
    ExecFailed {
        program: String,
        errno: nix::errno::Errno,
    },
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ImageMissing
            | Error::ImageInvalid(_)
            | Error::HomeMissing(_)
            | Error::HomeNotOwned(_)
            | Error::UnknownCommand(_)
            | Error::MissingExecCommand
            | Error::NotPrivileged
            | Error::InvalidConfig(_) => EXIT_CONFIG,
            Error::DirectoryBusy(_) | Error::ImageLocked(_) => EXIT_CONTENTION,
            _ => EXIT_ABORT,
        }
    }
}

/// Walk an error chain looking for the typed launch error that decides the
/// exit status. Errors that never passed through [`Error`] abort with 255.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::exit_code)
        .unwrap_or(EXIT_ABORT)
}
