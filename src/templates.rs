use crate::error::Error;
use crate::privilege::{Governor, IdentityBackend};
use crate::types::Invoker;
use anyhow::Result;
use log::{debug, trace};
use nix::unistd::{Group, User};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Account details of the invoking user as they should appear inside the
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// (name, gid) of every group the user belongs to.
    pub groups: Vec<(String, u32)>,
}

impl Account {
    /**
     * Look the invoker up in the host account database. A user without a
     * passwd entry still gets one inside the container, named after the
     * numeric uid.
     */
    pub fn lookup(invoker: &Invoker) -> Result<Account> {
        let user = User::from_uid(invoker.uid).map_err(|e| {
            anyhow::anyhow!("Failed to look up uid {}: {}", invoker.uid, e)
        })?;
        let (name, gecos, shell) = match user {
            Some(user) => (
                user.name,
                user.gecos.to_string_lossy().into_owned(),
                user.shell,
            ),
            None => (
                invoker.uid.to_string(),
                String::new(),
                PathBuf::from("/bin/sh"),
            ),
        };

        let mut groups = vec![];
        for gid in &invoker.groups {
            match Group::from_gid(*gid) {
                Ok(Some(group)) => groups.push((group.name, gid.as_raw())),
                Ok(None) => trace!("No group entry for gid {}", gid),
                Err(e) => trace!("Failed to look up gid {}: {}", gid, e),
            }
        }

        Ok(Account {
            name,
            uid: invoker.uid.as_raw(),
            gid: invoker.gid.as_raw(),
            gecos,
            home: invoker.home.clone(),
            shell,
            groups,
        })
    }

    pub fn passwd_line(&self) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}\n",
            self.name,
            self.uid,
            self.gid,
            self.gecos,
            self.home.display(),
            self.shell.display()
        )
    }

    pub fn group_lines(&self) -> String {
        self.groups
            .iter()
            .map(|(group, gid)| format!("{}:x:{}:{}\n", group, gid, self.name))
            .collect()
    }
}

/**
 * Write `dest` as a copy of the image's `source` with `extra` appended,
 * unless `dest` already exists. Runs with restricted privileges only: the
 * result lives in the user's state directory and must be owned by them.
 */
pub fn ensure_template<B: IdentityBackend>(
    governor: &Governor<B>,
    source: &Path,
    dest: &Path,
    extra: &str,
) -> Result<()> {
    governor.ensure_restricted("create identity templates")?;

    if dest.is_file() {
        trace!("Template {} already exists", dest.display());
        return Ok(());
    }

    let fail = |e: std::io::Error| Error::TemplateFailed(dest.to_path_buf(), e.to_string());

    let mut contents = match std::fs::read_to_string(source) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(fail(e).into()),
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(extra);

    // Concurrent launches may race to build the same template; whoever
    // renames last wins and both results are identical.
    let partial = dest.with_file_name(format!(
        ".{}.{}",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Uuid::new_v4()
    ));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&partial)
        .map_err(fail)?;
    let written = file
        .write_all(contents.as_bytes())
        .and_then(|()| std::fs::rename(&partial, dest));
    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(&partial) {
            debug!("Failed to remove {}: {}", partial.display(), cleanup);
        }
        return Err(fail(e).into());
    }

    debug!("Created template {}", dest.display());
    Ok(())
}

/// Build the passwd and group files that get bound over the image's own.
pub fn ensure_identity_templates<B: IdentityBackend>(
    governor: &Governor<B>,
    account: &Account,
    container_root: &Path,
    passwd: &Path,
    group: &Path,
) -> Result<()> {
    ensure_template(
        governor,
        &container_root.join("etc/passwd"),
        passwd,
        &account.passwd_line(),
    )?;
    ensure_template(
        governor,
        &container_root.join("etc/group"),
        group,
        &account.group_lines(),
    )
}
