#![forbid(unsafe_code)]
//! synctrack public API facade.
//!
//! Re-exports the tracking engine from `st-core` through a stable external
//! interface. This is the crate replication hosts and the harness depend
//! on.

pub use st_core::*;
