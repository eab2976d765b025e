//! I/O utilities for the relay paths

mod copy;

pub use copy::{copy_bidirectional_pooled, CopyResult};
