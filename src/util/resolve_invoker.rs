use anyhow::{Result, anyhow};
use nix::unistd::{Gid, Uid, User, getgrouplist, getgroups, getresgid, getresuid};
use std::ffi::CString;
use std::path::Path;

use crate::types::Invoker;

/**
 * We may be being run with setuid bits, or via sudo. This figures out who we
 * really are. It runs after we have already restricted to the real ids, so
 * under setuid everything here happens as the user; under sudo the real ids
 * are root's and the user only shows up in the SUDO_ variables.
 */
pub fn resolve_invoker() -> Result<Invoker> {
    let resuid = getresuid()?;
    let resgid = getresgid()?;

    // Only root can have been started through sudo. Anyone else could have
    // put SUDO_ variables in their own environment.
    let (uid, gid, home, groups) = if !resuid.real.is_root() {
        let home = std::env::var("HOME").unwrap_or("/tmp".to_string());
        (resuid.real, resgid.real, home, getgroups()?)
    } else {
        let sudo_uid = std::env::var("SUDO_UID");
        let sudo_gid = std::env::var("SUDO_GID");
        let home = std::env::var("SUDO_HOME")
            .or(std::env::var("HOME"))
            .unwrap_or("/tmp".to_string());

        let uid = match sudo_uid {
            Ok(uid) => match uid.parse::<u32>() {
                Ok(uid) => Uid::from_raw(uid),
                Err(_) => {
                    return Err(anyhow!("Failed to parse SUDO_UID: {:?}", uid));
                }
            },
            Err(_) => resuid.real,
        };

        let gid = match sudo_gid {
            Ok(gid) => match gid.parse::<u32>() {
                Ok(gid) => Gid::from_raw(gid),
                Err(_) => {
                    return Err(anyhow!("Failed to parse SUDO_GID: {:?}", gid));
                }
            },
            Err(_) => resgid.real,
        };

        // Our own supplementary groups are root's under sudo, look up the
        // user's instead.
        let groups = if uid != resuid.real {
            groups_of(uid, gid)?
        } else {
            getgroups()?
        };

        (uid, gid, home, groups)
    };

    let home_path = Path::new(&home);
    if !home_path.is_absolute() {
        return Err(anyhow!("Home directory is not absolute: {:?}", home));
    }

    Ok(Invoker {
        uid,
        gid,
        groups,
        home: home_path.to_path_buf(),
    })
}

fn groups_of(uid: Uid, gid: Gid) -> Result<Vec<Gid>> {
    match User::from_uid(uid)? {
        Some(user) => {
            let name = CString::new(user.name.as_bytes())?;
            Ok(getgrouplist(&name, gid)?)
        }
        None => Ok(vec![gid]),
    }
}
