use crate::error::Error;
use anyhow::Result;
use log::trace;
use nix::unistd::Uid;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/**
 * The image must be a regular file owned by the invoking user or by root.
 * Must be called restricted so the checks see what the user can see.
 */
pub fn validate_image(image: Option<&Path>, uid: Uid) -> Result<PathBuf> {
    let image = image.ok_or(Error::ImageMissing)?;
    let metadata = match std::fs::metadata(image) {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Err(Error::ImageInvalid(image.to_path_buf()).into()),
    };

    let owner = Uid::from_raw(metadata.uid());
    if owner != uid && !owner.is_root() {
        return Err(Error::ImageNotOwned(image.to_path_buf()).into());
    }

    trace!("Image {} owned by {}", image.display(), owner);
    Ok(image.to_path_buf())
}

/// The home directory must exist and belong to the invoking user.
pub fn validate_home(home: &Path, uid: Uid) -> Result<()> {
    let metadata = match std::fs::metadata(home) {
        Ok(metadata) if metadata.is_dir() => metadata,
        _ => return Err(Error::HomeMissing(home.to_path_buf()).into()),
    };

    if Uid::from_raw(metadata.uid()) != uid {
        return Err(Error::HomeNotOwned(home.to_path_buf()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EXIT_ABORT, EXIT_CONFIG, exit_code_for};
    use nix::unistd::geteuid;

    fn scratch(name: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!(
            "sexec-validate-{}-{}-{}",
            name,
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn test_image_checks() -> Result<()> {
        let dir = scratch("image")?;
        let image = dir.join("centos.img");
        std::fs::write(&image, b"not really ext4")?;
        let me = geteuid();

        assert_eq!(validate_image(Some(&image), me)?, image);

        let err = validate_image(None, me).expect_err("no image");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ImageMissing)));
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);

        let err = validate_image(Some(&dir), me).expect_err("directory");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ImageInvalid(_))));

        let err = validate_image(Some(&dir.join("missing.img")), me)
            .expect_err("missing");
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);

        if !me.is_root() {
            // A file we own is not owned by some other user
            let err = validate_image(Some(&image), Uid::from_raw(me.as_raw() + 1))
                .expect_err("foreign image");
            assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ImageNotOwned(_))));
            assert_eq!(exit_code_for(&err), EXIT_ABORT);
        }

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn test_root_owned_image_accepted() -> Result<()> {
        // /bin/sh resolves to a root owned regular file on any sane host
        let sh = std::fs::canonicalize("/bin/sh")?;
        validate_image(Some(&sh), Uid::from_raw(4242))?;
        Ok(())
    }

    #[test]
    fn test_home_checks() -> Result<()> {
        let dir = scratch("home")?;
        let me = geteuid();

        validate_home(&dir, me)?;

        let err = validate_home(&dir.join("nope"), me).expect_err("missing");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::HomeMissing(_))));

        let file = dir.join("file");
        std::fs::write(&file, b"")?;
        let err = validate_home(&file, me).expect_err("not a directory");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::HomeMissing(_))));

        let err = validate_home(&dir, Uid::from_raw(me.as_raw() + 1))
            .expect_err("someone else's home");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::HomeNotOwned(_))));
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
