use super::plan::{BindSpec, MountPlan, Presence};
use crate::error::Error;
use crate::privilege::{Governor, IdentityBackend};
use crate::util::{join_inside, mount};
use anyhow::Result;
use log::{debug, warn};
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

/// The mount primitives the layerer needs. Errors are human readable
/// descriptions of what failed.
pub trait Mounter {
    fn mount_image(
        &self,
        device: &Path,
        target: &Path,
        writable: bool,
    ) -> Result<(), String>;

    fn mount_bind(
        &self,
        source: &Path,
        target: &Path,
        writable: bool,
    ) -> Result<(), String>;
}

pub struct SysMounter;

const IMAGE_FILESYSTEMS: [&str; 2] = ["ext4", "ext3"];

impl Mounter for SysMounter {
    fn mount_image(
        &self,
        device: &Path,
        target: &Path,
        writable: bool,
    ) -> Result<(), String> {
        let mut flags = MsFlags::MS_NOSUID;
        if !writable {
            flags |= MsFlags::MS_RDONLY;
        }

        let mut errors = vec![];
        for fstype in IMAGE_FILESYSTEMS {
            match mount(
                Some(device),
                target,
                Some(fstype),
                flags,
                Some("errors=remount-ro"),
            ) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Mounting as {} failed: {}", fstype, e);
                    errors.push(e);
                }
            }
        }
        Err(errors.join("; "))
    }

    fn mount_bind(
        &self,
        source: &Path,
        target: &Path,
        writable: bool,
    ) -> Result<(), String> {
        mount(
            Some(source),
            target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_NOSUID,
            None,
        )?;

        if !writable {
            // MS_RDONLY is ignored on the initial bind, it takes a remount
            mount(
                None,
                target,
                None,
                MsFlags::MS_REMOUNT
                    | MsFlags::MS_BIND
                    | MsFlags::MS_RDONLY
                    | MsFlags::MS_NOSUID,
                None,
            )?;
        }
        Ok(())
    }
}

/// Proof that the image root is mounted. Only [`Layerer::mount_root`] hands
/// these out, and binds cannot be applied without one.
#[derive(Debug)]
pub struct MountedRoot {
    root: PathBuf,
}

impl MountedRoot {
    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Applies the image mount and then the bind plan, checking that privileges
/// are elevated for every operation.
pub struct Layerer<'g, M: Mounter, B: IdentityBackend> {
    mounter: M,
    governor: &'g Governor<B>,
}

impl<'g, M: Mounter, B: IdentityBackend> Layerer<'g, M, B> {
    pub fn new(mounter: M, governor: &'g Governor<B>) -> Self {
        Layerer { mounter, governor }
    }

    #[cfg(test)]
    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    pub fn mount_root(
        &self,
        device: &Path,
        target: &Path,
        writable: bool,
    ) -> Result<MountedRoot> {
        self.governor.ensure_elevated("mount the container image")?;
        debug!(
            "Mounting {} on {} ({})",
            device.display(),
            target.display(),
            if writable { "read-write" } else { "read-only" }
        );
        self.mounter
            .mount_image(device, target, writable)
            .map_err(|e| {
                Error::RootMountFailed(device.to_path_buf(), target.to_path_buf(), e)
            })?;
        Ok(MountedRoot {
            root: target.to_path_buf(),
        })
    }

    pub fn apply_binds(&self, root: &MountedRoot, plan: &MountPlan) -> Result<()> {
        for bind in &plan.binds {
            self.bind(root, bind)?;
        }
        Ok(())
    }

    fn bind(&self, root: &MountedRoot, bind: &BindSpec) -> Result<()> {
        self.governor.ensure_elevated("bind mount into the container")?;
        let target = join_inside(root.path(), &bind.target);

        if !present(&target) {
            return skip(bind, Error::BindTargetMissing(bind.target.clone()));
        }
        if !bind.source.exists() {
            return skip(
                bind,
                Error::BindMountFailed(
                    bind.source.clone(),
                    bind.target.clone(),
                    "source does not exist".to_string(),
                ),
            );
        }

        debug!("Binding {} to {}", bind.source.display(), bind.target.display());
        self.mounter
            .mount_bind(&bind.source, &target, bind.writable)
            .map_err(|e| {
                Error::BindMountFailed(bind.source.clone(), bind.target.clone(), e)
            })?;
        Ok(())
    }
}

/// Symlinks inside the image are treated as absent, they would resolve
/// against the host root while we are still outside the chroot.
fn present(target: &Path) -> bool {
    match std::fs::symlink_metadata(target) {
        Ok(metadata) => !metadata.file_type().is_symlink(),
        Err(_) => false,
    }
}

fn skip(bind: &BindSpec, err: Error) -> Result<()> {
    match bind.presence {
        Presence::Required => Err(err.into()),
        Presence::Expected => {
            warn!("Skipping bind of {}: {}", bind.target.display(), err);
            Ok(())
        }
        Presence::Optional => {
            debug!("Skipping bind of {}: {}", bind.target.display(), err);
            Ok(())
        }
    }
}
