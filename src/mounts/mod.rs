mod layerer;
mod plan;

pub use layerer::*;
pub use plan::*;
