use anyhow::{Context, Result};
use nix::unistd::Uid;
use std::fmt;
use std::path::Path;

/// Identifies an image file for the purpose of sharing launch state. Two
/// paths naming the same file (hard links, symlinks, bind mounts) map onto the
/// same identity, and each user gets their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId {
    pub uid: Uid,
    pub dev: u64,
    pub ino: u64,
}

impl ImageId {
    pub fn of(image: &Path, uid: Uid) -> Result<ImageId> {
        let stat = nix::sys::stat::stat(image)
            .context(format!("failed to stat image {}", image.display()))?;
        #[allow(clippy::useless_conversion)]
        Ok(ImageId {
            uid,
            dev: u64::from(stat.st_dev),
            ino: u64::from(stat.st_ino),
        })
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.uid, self.dev, self.ino)
    }
}
