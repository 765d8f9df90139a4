mod lock;
mod mkdir;
mod mount;
mod output;
mod paths;
mod resolve_invoker;

pub use lock::*;
pub use mkdir::*;
pub use mount::*;
pub use output::*;
pub use paths::*;
pub use resolve_invoker::*;
