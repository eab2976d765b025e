//! Server-side connection pooling

mod target;

pub use target::{dial_target, TargetPools, TARGET_DIAL_TIMEOUT};
