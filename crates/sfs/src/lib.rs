#![forbid(unsafe_code)]
//! SlateFS umbrella crate: re-exports the public API of `sfs-core`.

pub use sfs_core::*;
