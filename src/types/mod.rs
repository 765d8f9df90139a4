mod image_id;
mod invoker;

pub use image_id::*;
pub use invoker::*;
