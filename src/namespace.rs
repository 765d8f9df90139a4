use crate::error::Error;
use crate::privilege::{Governor, IdentityBackend};
use anyhow::Result;
use log::{debug, warn};
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use std::path::Path;

/// Which of the optional namespaces to try. The mount namespace is never
/// optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceOptions {
    pub pid: bool,
    pub fs: bool,
    pub files: bool,
}

impl Default for NamespaceOptions {
    fn default() -> Self {
        NamespaceOptions {
            pid: true,
            fs: true,
            files: true,
        }
    }
}

/**
 * The best effort namespaces to unshare after the mount namespace, in
 * order. PID isolation is only attempted when the kernel exposes PID
 * namespaces at all.
 */
pub fn optional_namespaces(
    options: &NamespaceOptions,
    pid_supported: bool,
) -> Vec<(&'static str, CloneFlags)> {
    let mut namespaces = vec![];
    if options.pid && pid_supported {
        namespaces.push(("PID", CloneFlags::CLONE_NEWPID));
    }
    if options.fs {
        namespaces.push(("FS", CloneFlags::CLONE_FS));
    }
    if options.files {
        namespaces.push(("FILES", CloneFlags::CLONE_FILES));
    }
    namespaces
}

/**
 * Move this process into a private mount namespace and mark every mount in
 * it private, so nothing we mount from here on leaks back to the host. Must
 * be called elevated, before any container mount.
 */
pub fn isolate<B: IdentityBackend>(
    options: &NamespaceOptions,
    governor: &Governor<B>,
) -> Result<()> {
    governor.ensure_elevated("create namespaces")?;

    debug!("Virtualizing FS namespace");
    unshare(CloneFlags::CLONE_NEWNS).map_err(Error::NamespaceIsolationFailed)?;

    debug!("Making mounts private");
    let null: Option<&str> = None;
    mount(null, "/", null, MsFlags::MS_PRIVATE | MsFlags::MS_REC, null)
        .map_err(Error::NamespaceIsolationFailed)?;

    let pid_supported = Path::new("/proc/self/ns/pid").exists();
    for (name, flag) in optional_namespaces(options, pid_supported) {
        debug!("Virtualizing {} namespace", name);
        if let Err(e) = unshare(flag) {
            warn!("Could not virtualize {} namespace: {}", name, e);
        }
    }

    Ok(())
}
