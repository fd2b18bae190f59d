//! Test-only helpers shared by unit tests across modules and by the
//! integration tests under `tests/`.
//!
//! `TestDir` wraps `tempfile::TempDir` the way `nya3jp-cros-bazel`'s
//! `fileutil::SafeTempDir` wraps it (a named newtype with a `path()`
//! accessor); `is_root` is the teacher's own `main::is_root` check, lifted
//! verbatim. Most of this crate's logic is plain filesystem bookkeeping and
//! runs fine unprivileged, but real overlay mounts and whiteout device
//! nodes need `CAP_SYS_ADMIN`/`CAP_MKNOD`, which CI sandboxes routinely
//! lack — tests that need those gate on `is_root()` and skip otherwise.

use std::path::Path;

use tempfile::TempDir;

/// A throwaway directory, removed on drop.
pub struct TestDir(TempDir);

impl TestDir {
    pub fn new() -> Self {
        Self(tempfile::Builder::new().prefix("overlay2-test-").tempdir().unwrap())
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the current process can perform privileged operations (real
/// mounts, device-node creation). Tests that need this skip with a debug
/// log line instead of failing when it's false.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
