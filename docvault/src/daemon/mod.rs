//! Long-running scheduler process support.

pub mod shutdown;
