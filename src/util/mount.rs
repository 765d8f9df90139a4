use log::trace;
use nix::mount::MsFlags;
use std::path::Path;

/**
 * Thin wrapper around `mount(2)` that logs what it is about to do and
 * returns a message carrying every argument on failure, since a bare errno
 * from a mount rarely says which of them the kernel disliked.
 */
pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), String> {
    trace!(
        "mount {} {} [type={}, flags={:#x}, data={}]",
        source.map(|s| s.display().to_string()).unwrap_or_default(),
        target.display(),
        fstype.unwrap_or(""),
        flags.bits(),
        data.unwrap_or("")
    );

    nix::mount::mount::<Path, Path, str, str>(
        source, target, fstype, flags, data,
    )
    .map_err(|e| {
        format!(
            "failed to mount {} {} [type={}, flags={:#x}, data={}]: {}",
            source.map(|s| s.display().to_string()).unwrap_or_default(),
            target.display(),
            fstype.unwrap_or(""),
            flags.bits(),
            data.unwrap_or(""),
            e
        )
    })
}
