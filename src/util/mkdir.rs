use anyhow::{Result, anyhow};
use nix::{sys::stat::SFlag, unistd::Uid};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/* Makes the directory (and any missing parents) with the given mode if it
 * doesn't exist. Will throw an error if the path already exists but is not a
 * directory, or is not owned by `owner`. Symlinks are never followed for the
 * final component, so a link planted in a shared location is rejected.
 *
 * New directories are owned by whatever our effective identity is right now,
 * so callers pick their privilege state before calling this.
 */
pub fn mkdir(path: &Path, mode: u32, owner: Uid) -> Result<()> {
    match nix::sys::stat::lstat(path) {
        Ok(metadata) => {
            if metadata.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFDIR.bits()
            {
                return Err(anyhow!(
                    "Directory {} already exists but is not a directory",
                    path.display()
                ));
            }

            if metadata.st_uid != owner.as_raw() {
                return Err(anyhow!(
                    "Directory {} already exists with a different owner",
                    path.display()
                ));
            }
        }
        Err(_) => {
            if let Err(e) = std::fs::DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(path)
            {
                return Err(anyhow!(
                    "Failed to create directory {}: {}",
                    path.display(),
                    e
                ));
            }
        }
    }

    Ok(())
}
