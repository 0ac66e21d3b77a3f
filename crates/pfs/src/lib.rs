#![forbid(unsafe_code)]
//! PFS public API facade.
//!
//! Re-exports core functionality from `pfs-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI and
//! embedding tools) depend on.

pub use pfs_core::*;
