//! Bindings for the loop(4) ioctl interface.
//!
//! These are the "bad" (non `_IOC` encoded) request numbers from
//! `linux/loop.h`.

use nix::sys::ioctl::ioctl_num_type;

pub const LOOP_SET_FD: ioctl_num_type = 0x4C00;
pub const LOOP_CLR_FD: ioctl_num_type = 0x4C01;
pub const LOOP_SET_STATUS64: ioctl_num_type = 0x4C04;
pub const LOOP_GET_STATUS64: ioctl_num_type = 0x4C05;

pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

pub const LO_NAME_SIZE: usize = 64;
pub const LO_KEY_SIZE: usize = 32;

/// Block device major number of loop devices.
pub const LOOP_MAJOR: u64 = 7;

/// `struct loop_info64`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        LoopInfo64 {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
nix::ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, LoopInfo64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_info64_matches_kernel_layout() {
        // 5 * u64 + 4 * u32 + 64 + 64 + 32 + 2 * u64
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }
}
