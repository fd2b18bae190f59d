//! A layered filesystem driver for container images built on the kernel
//! overlay union mount, plus a persistent image-reference tag store.
//!
//! [`driver::Driver`] is the entry point for the filesystem side (`Init`,
//! `Create`, `Remove`, `Get`, `Put`, `Exists`, `Status`, `Diff`, `ApplyDiff`,
//! `DiffSize`, `Changes`, `Cleanup`). [`tagstore::Store`] is the independent
//! reference → image-id map.
//!
//! Collaborator traits in [`collab`] and [`archive`] mark the pieces that
//! belong to whatever embeds this driver (UID/GID remapping, MAC mount-label
//! policy, kernel/filesystem probing, archive transport) — each ships a
//! working default so the core plane here has something real to run
//! against.

pub mod archive;
pub mod chain;
pub mod collab;
pub mod diff;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod mount;
pub mod paths;
pub mod tagstore;

// Used by unit tests across modules, and by `status()`'s capability
// diagnostics, so it is not `#[cfg(test)]`-gated.
pub mod test_support;

pub use driver::{Driver, InitOptions};
pub use error::{Error, Result};
