use super::ioctl::{
    LO_FLAGS_AUTOCLEAR, LOOP_MAJOR, LoopInfo64, loop_clr_fd, loop_get_status64,
    loop_set_fd, loop_set_status64,
};
use crate::error::Error;
use crate::types::ImageId;
use anyhow::Result;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Default number of loop device indices we are willing to scan.
pub const MAX_LOOP_DEVICES: u32 = 128;

/// A numbered loop device node, `/dev/loop<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDevice {
    pub index: u32,
}

impl LoopDevice {
    pub fn new(index: u32) -> LoopDevice {
        LoopDevice { index }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/loop{}", self.index))
    }

    /**
     * Parse a device path as written to the loop device cache. Anything
     * other than `/dev/loop<digits>` is rejected, the cache lives in a user
     * writable directory and must not be able to point us at arbitrary block
     * devices.
     */
    pub fn from_path(path: &str) -> Option<LoopDevice> {
        let digits = path.trim().strip_prefix("/dev/loop")?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().map(LoopDevice::new)
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/dev/loop{}", self.index)
    }
}

/// What we learned about a candidate loop device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// No device node exists yet; free once we create it.
    Missing,
    /// The node exists and has no backing file.
    Unbound,
    /// Bound to a file, or otherwise not usable.
    Bound,
}

/// Inspects, creates and attaches loop device nodes. Split out so the
/// allocation policy can be exercised without touching real devices.
pub trait DeviceProbe {
    fn probe(&self, device: &LoopDevice) -> Slot;
    fn create(&self, device: &LoopDevice) -> nix::Result<()>;
    /// Attach `image`, or `None` if someone else attached the device first.
    fn associate(&self, image: &File, device: &LoopDevice) -> Result<Option<LoopBinding>>;
}

pub struct SysProbe;

/**
 * A device is free if its node does not exist yet, or if it exists and
 * the status query reports that nothing is attached (ENXIO). Any other
 * outcome, including a node we cannot open, counts as taken.
 */
fn slot_at(path: &Path) -> Slot {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Slot::Missing;
        }
        Err(e) => {
            trace!("Skipping {}: {}", path.display(), e);
            return Slot::Bound;
        }
    };

    let mut info = LoopInfo64::default();
    let status = unsafe { loop_get_status64(file.as_raw_fd(), &mut info) };
    if let Err(e) = status {
        trace!("Status query of {}: {}", path.display(), e);
    }
    slot_for_status(status)
}

fn slot_for_status<T>(status: nix::Result<T>) -> Slot {
    match status {
        Err(Errno::ENXIO) => Slot::Unbound,
        _ => Slot::Bound,
    }
}

impl DeviceProbe for SysProbe {
    fn probe(&self, device: &LoopDevice) -> Slot {
        slot_at(&device.path())
    }

    fn associate(&self, image: &File, device: &LoopDevice) -> Result<Option<LoopBinding>> {
        associate(image, device, &device.path())
    }

    fn create(&self, device: &LoopDevice) -> nix::Result<()> {
        let mode = Mode::from_bits_truncate(0o644);
        mknod(
            &device.path(),
            SFlag::S_IFBLK,
            mode,
            makedev(LOOP_MAJOR, u64::from(device.index)),
        )
    }
}

/**
 * Finds a free loop device by brute force scanning. This works on kernels
 * without `/dev/loop-control` and on hosts where only a few nodes have been
 * pre-created.
 */
pub struct LoopAllocator<P: DeviceProbe = SysProbe> {
    probe: P,
    max_devices: u32,
}

impl LoopAllocator<SysProbe> {
    pub fn new(max_devices: u32) -> LoopAllocator<SysProbe> {
        LoopAllocator::with_probe(SysProbe, max_devices)
    }
}

impl<P: DeviceProbe> LoopAllocator<P> {
    pub fn with_probe(probe: P, max_devices: u32) -> LoopAllocator<P> {
        LoopAllocator { probe, max_devices }
    }

    pub fn obtain(&self) -> Result<LoopDevice> {
        self.obtain_from(0)
    }

    fn obtain_from(&self, start: u32) -> Result<LoopDevice> {
        let (device, slot) = (start..self.max_devices)
            .map(LoopDevice::new)
            .map(|device| (device, self.probe.probe(&device)))
            .find(|(_, slot)| *slot != Slot::Bound)
            .ok_or(Error::NoDeviceAvailable(self.max_devices))?;

        if slot == Slot::Missing {
            debug!("Creating loop device {}", device);
            self.probe
                .create(&device)
                .map_err(|e| Error::DeviceCreateFailed(device.path(), e))?;
        }

        debug!("Selected loop device {}", device);
        Ok(device)
    }

    /**
     * Obtain a free device and attach `image` to it. Another process may
     * grab the device between our probe and the attach; we then carry on
     * scanning past it.
     */
    pub fn attach(&self, image: &File) -> Result<LoopBinding> {
        let mut start = 0;
        loop {
            let device = self.obtain_from(start)?;
            match self.probe.associate(image, &device)? {
                Some(binding) => return Ok(binding),
                None => {
                    debug!("{} was taken before we could attach, rescanning", device);
                    start = device.index + 1;
                }
            }
        }
    }
}

/**
 * An image attached to a loop device. The descriptor is kept open for as
 * long as this value lives: with autoclear set, the kernel detaches the
 * image as soon as the last reference goes away, and until the image is
 * mounted this descriptor is that reference.
 */
pub struct LoopBinding {
    pub device: LoopDevice,
    _fd: File,
}

impl LoopBinding {
    /**
     * Take a reference on a device somebody else associated, provided it is
     * still backed by `image`. Returns `None` if the device was released
     * or now backs a different file. Holding the descriptor keeps autoclear
     * from detaching it before we mount it.
     */
    pub fn reuse(device: &LoopDevice, image: &ImageId) -> Result<Option<LoopBinding>> {
        let fd = File::open(device.path()).map_err(|e| {
            anyhow::anyhow!("Failed to open {}: {}", device.path().display(), e)
        })?;
        let mut info = LoopInfo64::default();
        match unsafe { loop_get_status64(fd.as_raw_fd(), &mut info) } {
            Ok(_) if info.lo_device == image.dev && info.lo_inode == image.ino => {
                Ok(Some(LoopBinding {
                    device: *device,
                    _fd: fd,
                }))
            }
            Ok(_) | Err(Errno::ENXIO) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to query status of {}: {}",
                device.path().display(),
                e
            )),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.device.path()
    }
}

/**
 * Attach `image` to the device node at `path` with offset zero and
 * autoclear set. If anything fails after the backing file was set, the
 * attachment is cleared again. A device that turns out to be attached
 * already (EBUSY) gives `None`.
 */
pub fn associate(
    image: &File,
    device: &LoopDevice,
    path: &Path,
) -> Result<Option<LoopBinding>> {
    let fail = |what: String| Error::AssociationFailed(path.to_path_buf(), what);

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| fail(format!("failed to open device: {}", e)))?;

    trace!("Associating image to {}", path.display());
    match unsafe { loop_set_fd(fd.as_raw_fd(), image.as_raw_fd()) } {
        Ok(_) => {}
        Err(Errno::EBUSY) => return Ok(None),
        Err(e) => return Err(fail(format!("LOOP_SET_FD: {}", e)).into()),
    }

    let info = LoopInfo64 {
        lo_offset: 0,
        lo_flags: LO_FLAGS_AUTOCLEAR,
        ..LoopInfo64::default()
    };
    if let Err(e) = unsafe { loop_set_status64(fd.as_raw_fd(), &info) } {
        if let Err(clear) = unsafe { loop_clr_fd(fd.as_raw_fd()) } {
            warn!("Failed to clear {} after error: {}", path.display(), clear);
        }
        return Err(fail(format!("LOOP_SET_STATUS64: {}", e)).into());
    }

    debug!("Associated image with {}", path.display());
    Ok(Some(LoopBinding {
        device: *device,
        _fd: fd,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Pretends to be a set of loop devices.
    struct FakeProbe {
        slots: HashMap<u32, Slot>,
        created: RefCell<Vec<u32>>,
        fail_create: bool,
        /// Devices someone else attaches right after we probed them.
        raced: Vec<u32>,
        attempts: RefCell<Vec<u32>>,
    }

    impl FakeProbe {
        fn new(slots: &[(u32, Slot)]) -> FakeProbe {
            FakeProbe {
                slots: slots.iter().cloned().collect(),
                created: RefCell::new(vec![]),
                fail_create: false,
                raced: vec![],
                attempts: RefCell::new(vec![]),
            }
        }
    }

    impl DeviceProbe for FakeProbe {
        fn probe(&self, device: &LoopDevice) -> Slot {
            self.slots.get(&device.index).copied().unwrap_or(Slot::Missing)
        }

        fn create(&self, device: &LoopDevice) -> nix::Result<()> {
            if self.fail_create {
                return Err(Errno::EPERM);
            }
            self.created.borrow_mut().push(device.index);
            Ok(())
        }

        fn associate(
            &self,
            _image: &File,
            device: &LoopDevice,
        ) -> Result<Option<LoopBinding>> {
            self.attempts.borrow_mut().push(device.index);
            if self.raced.contains(&device.index) {
                return Ok(None);
            }
            Ok(Some(LoopBinding {
                device: *device,
                _fd: File::open("/dev/null")?,
            }))
        }
    }

    #[test]
    fn test_skips_bound_devices() -> Result<()> {
        let probe = FakeProbe::new(&[
            (0, Slot::Bound),
            (1, Slot::Bound),
            (2, Slot::Unbound),
            (3, Slot::Unbound),
        ]);
        let allocator = LoopAllocator::with_probe(probe, 8);
        assert_eq!(allocator.obtain()?, LoopDevice::new(2));
        assert!(allocator.probe.created.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_creates_missing_node() -> Result<()> {
        let probe = FakeProbe::new(&[(0, Slot::Bound), (1, Slot::Bound)]);
        let allocator = LoopAllocator::with_probe(probe, 8);
        assert_eq!(allocator.obtain()?, LoopDevice::new(2));
        assert_eq!(*allocator.probe.created.borrow(), vec![2]);
        Ok(())
    }

    #[test]
    fn test_exhausted_range() {
        let slots: Vec<(u32, Slot)> = (0..4).map(|i| (i, Slot::Bound)).collect();
        let allocator = LoopAllocator::with_probe(FakeProbe::new(&slots), 4);
        for _ in 0..3 {
            let err = allocator.obtain().expect_err("no device should be free");
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::NoDeviceAvailable(4))
            ));
        }
    }

    #[test]
    fn test_create_failure() {
        let mut probe = FakeProbe::new(&[(0, Slot::Bound)]);
        probe.fail_create = true;
        let allocator = LoopAllocator::with_probe(probe, 4);
        let err = allocator.obtain().expect_err("creation should fail");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DeviceCreateFailed(_, Errno::EPERM))
        ));
        assert_eq!(exit_code_for(&err), crate::error::EXIT_ABORT);
    }

    #[test]
    fn test_device_paths() {
        assert_eq!(LoopDevice::new(7).path(), PathBuf::from("/dev/loop7"));
        assert_eq!(LoopDevice::new(7).to_string(), "/dev/loop7");
        assert_eq!(LoopDevice::from_path("/dev/loop12"), Some(LoopDevice::new(12)));
        assert_eq!(LoopDevice::from_path("/dev/loop3\n"), Some(LoopDevice::new(3)));
        assert_eq!(LoopDevice::from_path("/dev/loop"), None);
        assert_eq!(LoopDevice::from_path("/dev/sda1"), None);
        assert_eq!(LoopDevice::from_path("/dev/loop1/../sda"), None);
        assert_eq!(LoopDevice::from_path(""), None);
    }

    #[test]
    fn test_attach_rescans_after_race() -> Result<()> {
        let mut probe = FakeProbe::new(&[(0, Slot::Bound), (1, Slot::Unbound)]);
        probe.raced = vec![1, 2];
        let allocator = LoopAllocator::with_probe(probe, 8);
        let image = File::open("/dev/null")?;
        let binding = allocator.attach(&image)?;
        assert_eq!(binding.device, LoopDevice::new(3));
        assert_eq!(*allocator.probe.attempts.borrow(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_attach_gives_up_at_the_end_of_the_range() -> Result<()> {
        let mut probe = FakeProbe::new(&[]);
        probe.raced = vec![0, 1, 2, 3];
        let allocator = LoopAllocator::with_probe(probe, 4);
        let image = File::open("/dev/null")?;
        let err = match allocator.attach(&image) {
            Ok(_) => panic!("every device was taken"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoDeviceAvailable(4))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_node_slot() {
        assert_eq!(SysProbe.probe(&LoopDevice::new(999_999)), Slot::Missing);
        let path = std::env::temp_dir()
            .join(format!("sexec-no-such-loop-{}", std::process::id()));
        assert_eq!(slot_at(&path), Slot::Missing);
    }

    #[test]
    fn test_non_loop_node_counts_as_taken() -> Result<()> {
        // a regular file answers the status query with ENOTTY, not ENXIO
        let path = std::env::temp_dir()
            .join(format!("sexec-not-a-loop-{}", std::process::id()));
        std::fs::write(&path, "")?;
        assert_eq!(slot_at(&path), Slot::Bound);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_slot_for_status() {
        assert_eq!(slot_for_status::<()>(Err(Errno::ENXIO)), Slot::Unbound);
        assert_eq!(slot_for_status(Ok(0)), Slot::Bound);
        assert_eq!(slot_for_status::<()>(Err(Errno::EBUSY)), Slot::Bound);
        assert_eq!(slot_for_status::<()>(Err(Errno::ENOTTY)), Slot::Bound);
        assert_eq!(slot_for_status::<()>(Err(Errno::EACCES)), Slot::Bound);
    }

    #[test]
    fn test_reuse_of_missing_device_fails() {
        let image = ImageId {
            uid: nix::unistd::Uid::from_raw(1000),
            dev: 2049,
            ino: 12,
        };
        assert!(LoopBinding::reuse(&LoopDevice::new(999_999), &image).is_err());
    }

    #[test]
    fn test_associate_failure_is_typed() -> Result<()> {
        let image = File::open("/dev/null")?;
        let device = LoopDevice::new(999_999);
        let err = match associate(&image, &device, &device.path()) {
            Ok(_) => panic!("association with a missing device must fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::AssociationFailed(..))
        ));
        Ok(())
    }
}
