use crate::error::{EXIT_ABORT, Error};
use crate::types::Invoker;
use anyhow::Result;
use log::{debug, error, trace};
use nix::unistd::{Gid, Uid};
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeState {
    /// Effective identity is root.
    Elevated,
    /// Effective identity is the invoking user.
    Restricted,
}

/// The identity switching primitives. The real implementation talks to the
/// kernel, tests substitute a recorder.
pub trait IdentityBackend {
    fn set_effective_uid(&self, uid: Uid) -> nix::Result<()>;
    fn set_effective_gid(&self, gid: Gid) -> nix::Result<()>;
    fn set_groups(&self, groups: &[Gid]) -> nix::Result<()>;
    /// Set real, effective and saved gid at once.
    fn set_all_gids(&self, gid: Gid) -> nix::Result<()>;
    /// Set real, effective and saved uid at once. Once the saved uid is no
    /// longer root there is no way back.
    fn set_all_uids(&self, uid: Uid) -> nix::Result<()>;
}

pub struct SysIdentity;

impl IdentityBackend for SysIdentity {
    fn set_effective_uid(&self, uid: Uid) -> nix::Result<()> {
        nix::unistd::seteuid(uid)
    }

    fn set_effective_gid(&self, gid: Gid) -> nix::Result<()> {
        nix::unistd::setegid(gid)
    }

    fn set_groups(&self, groups: &[Gid]) -> nix::Result<()> {
        nix::unistd::setgroups(groups)
    }

    fn set_all_gids(&self, gid: Gid) -> nix::Result<()> {
        nix::unistd::setresgid(gid, gid, gid)
    }

    fn set_all_uids(&self, uid: Uid) -> nix::Result<()> {
        nix::unistd::setresuid(uid, uid, uid)
    }
}

/**
 * Tracks and transitions the effective identity during a launch.
 *
 * We start out elevated (setuid root or sudo) and immediately restrict to
 * the invoking user. Privileged work happens inside [`Governor::elevate`]
 * scopes; the returned guard restores the previous state when it goes out of
 * scope, on error paths too. Any failed transition is fatal.
 */
pub struct Governor<B: IdentityBackend = SysIdentity> {
    backend: B,
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
    elevated_gid: Gid,
    state: Cell<PrivilegeState>,
}

impl Governor<SysIdentity> {
    /**
     * A governor for the real ids of this process, read straight from the
     * kernel. Nothing from the environment is consulted, so it is safe to
     * restrict with this before anything else runs.
     */
    pub fn for_real_ids() -> Result<Governor<SysIdentity>> {
        let uid = nix::unistd::getresuid()?.real;
        let gid = nix::unistd::getresgid()?.real;
        Ok(Governor::from_ids(
            SysIdentity,
            uid,
            gid,
            nix::unistd::getgroups()?,
            nix::unistd::getegid(),
        ))
    }
}

impl<B: IdentityBackend> Governor<B> {
    /// The governor assumes the process is currently elevated.
    pub fn with_backend(
        backend: B,
        invoker: &Invoker,
        elevated_gid: Gid,
    ) -> Governor<B> {
        Governor::from_ids(
            backend,
            invoker.uid,
            invoker.gid,
            invoker.groups.clone(),
            elevated_gid,
        )
    }

    fn from_ids(
        backend: B,
        uid: Uid,
        gid: Gid,
        groups: Vec<Gid>,
        elevated_gid: Gid,
    ) -> Governor<B> {
        Governor {
            backend,
            uid,
            gid,
            groups,
            elevated_gid,
            state: Cell::new(PrivilegeState::Elevated),
        }
    }

    /**
     * Retarget a restricted governor at `invoker`. Under sudo the real ids
     * are root's and the invoker only becomes known from the environment,
     * so the effective identity moves from one to the other here. The
     * result is restricted to `invoker`.
     */
    pub fn hand_over(self, invoker: &Invoker) -> Result<Governor<B>> {
        self.ensure_restricted("change the invoking user")?;
        if self.uid == invoker.uid && self.gid == invoker.gid {
            return Ok(Governor {
                groups: invoker.groups.clone(),
                ..self
            });
        }

        debug!(
            "Handing over from {}:{} to {}:{}",
            self.uid, self.gid, invoker.uid, invoker.gid
        );
        self.raise()?;
        let governor = Governor::with_backend(
            self.backend,
            invoker,
            self.elevated_gid,
        );
        governor.restrict()?;
        Ok(governor)
    }

    pub fn state(&self) -> PrivilegeState {
        self.state.get()
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Switch the effective identity to the invoking user.
    pub fn restrict(&self) -> Result<()> {
        trace!("Restricting effective identity to {}:{}", self.uid, self.gid);
        self.backend.set_effective_gid(self.gid).map_err(|e| {
            Error::PrivilegeTransitionFailed(format!("gid {}", self.gid), e)
        })?;
        self.backend.set_effective_uid(self.uid).map_err(|e| {
            Error::PrivilegeTransitionFailed(format!("uid {}", self.uid), e)
        })?;
        self.state.set(PrivilegeState::Restricted);
        Ok(())
    }

    /// Become root until the returned guard is dropped.
    pub fn elevate(&self) -> Result<Elevated<'_, B>> {
        let previous = self.state.get();
        self.raise()?;
        Ok(Elevated {
            governor: self,
            previous,
        })
    }

    fn raise(&self) -> Result<()> {
        trace!("Elevating effective identity");
        let root = Uid::from_raw(0);
        self.backend.set_effective_uid(root).map_err(|e| {
            Error::PrivilegeTransitionFailed(format!("uid {}", root), e)
        })?;
        self.backend.set_effective_gid(self.elevated_gid).map_err(|e| {
            Error::PrivilegeTransitionFailed(
                format!("gid {}", self.elevated_gid),
                e,
            )
        })?;
        self.state.set(PrivilegeState::Elevated);
        Ok(())
    }

    pub fn ensure_restricted(&self, what: &str) -> Result<()> {
        match self.state.get() {
            PrivilegeState::Restricted => Ok(()),
            PrivilegeState::Elevated => Err(anyhow::anyhow!(
                "Refusing to {} while privileges are elevated",
                what
            )),
        }
    }

    pub fn ensure_elevated(&self, what: &str) -> Result<()> {
        match self.state.get() {
            PrivilegeState::Elevated => Ok(()),
            PrivilegeState::Restricted => Err(anyhow::anyhow!(
                "Cannot {} without elevated privileges",
                what
            )),
        }
    }

    /**
     * Give up root for good: real, effective and saved ids all become the
     * invoking user. Only the container child does this, right before exec.
     */
    pub fn drop_permanently(&self) -> Result<()> {
        self.ensure_elevated("drop privileges permanently")?;
        trace!(
            "Dropping privileges permanently to uid/gid: {}/{}",
            self.uid, self.gid
        );
        self.backend
            .set_groups(&self.groups)
            .map_err(permanent(format!("groups {:?}", self.groups)))?;
        self.backend
            .set_all_gids(self.gid)
            .map_err(permanent(format!("gid {}", self.gid)))?;
        self.backend
            .set_all_uids(self.uid)
            .map_err(permanent(format!("uid {}", self.uid)))?;
        self.state.set(PrivilegeState::Restricted);
        Ok(())
    }
}

fn permanent(what: String) -> impl FnOnce(nix::errno::Errno) -> Error {
    move |e| Error::PrivilegeTransitionFailed(format!("{} (permanent)", what), e)
}

/// Scope guard returned by [`Governor::elevate`].
pub struct Elevated<'a, B: IdentityBackend> {
    governor: &'a Governor<B>,
    previous: PrivilegeState,
}

impl<B: IdentityBackend> Drop for Elevated<'_, B> {
    fn drop(&mut self) {
        if self.previous == PrivilegeState::Elevated {
            return;
        }
        if let Err(e) = self.governor.restrict() {
            // Carrying on with an unknown effective identity is not an option
            error!("ABORT: {:#}", e);
            std::process::exit(EXIT_ABORT);
        }
    }
}
