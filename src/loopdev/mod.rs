mod allocator;
mod ioctl;

pub use allocator::*;
