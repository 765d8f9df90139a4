use std::path::{Component, Path, PathBuf};

/**
 * Resolve an absolute container path against a root directory, e.g.
 * `/etc/hosts` inside `/var/singularity/mnt` becomes
 * `/var/singularity/mnt/etc/hosts`. `..` components are dropped rather than
 * allowed to climb out of the root.
 */
pub fn join_inside(root: &Path, path: &Path) -> PathBuf {
    let mut joined = root.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            joined.push(part);
        }
    }
    joined
}
