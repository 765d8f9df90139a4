mod fixture_launch;

pub use fixture_launch::*;
