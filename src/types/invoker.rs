use nix::unistd::{Gid, Uid};
use std::path::{Component, Path, PathBuf};

/// The user who invoked us, independent of whatever privileges we were
/// started with.
#[derive(Debug, Clone)]
pub struct Invoker {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
    pub home: PathBuf,
}

impl Invoker {
    /**
     * The top level directory holding the home directory, e.g. `/home` for
     * `/home/alice`. This is what gets bound into the container so the home
     * directory shows up at the same path inside.
     */
    pub fn base_home(&self) -> PathBuf {
        base_of(&self.home)
    }
}

fn base_of(path: &Path) -> PathBuf {
    path.components()
        .find_map(|component| match component {
            Component::Normal(name) => Some(PathBuf::from("/").join(name)),
            _ => None,
        })
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker(home: &str) -> Invoker {
        Invoker {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            groups: vec![],
            home: PathBuf::from(home),
        }
    }

    #[test]
    fn test_base_home() {
        assert_eq!(invoker("/home/alice").base_home(), PathBuf::from("/home"));
        assert_eq!(
            invoker("/global/u2/b/bob").base_home(),
            PathBuf::from("/global")
        );
        assert_eq!(invoker("/root").base_home(), PathBuf::from("/root"));
        assert_eq!(invoker("/").base_home(), PathBuf::from("/"));
    }
}
