//! The top-level `Driver`: the core operations exposed upstream (§6),
//! composing the path layout, parent-chain store, mount manager, lifecycle
//! operations, and diff/apply plane into the single type an embedding
//! container runtime actually holds onto.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::archive::{Archiver, TarArchiver};
use crate::collab::{
    FsMagicProbe, IdMapper, IdentityIdMapper, IdentityMountLabelFormatter, KernelProbe,
    MountLabelFormatter, MountTable, ProcKernelProbe, ProcMountinfoTable, StatfsMagicProbe,
    MIN_KERNEL_VERSION,
};
use crate::diff::{self, Change};
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::mount::MountManager;
use crate::paths::{Layout, ALL_KINDS};

/// The collaborators `Init` wires up. Each field defaults to the concrete,
/// working implementation in [`crate::collab`]/[`crate::archive`]; callers
/// embedding this driver in a real container runtime override whichever
/// pieces their platform needs (a real UID/GID remap table, a SELinux-aware
/// label formatter, and so on).
pub struct InitOptions {
    pub id_mapper: Arc<dyn IdMapper>,
    pub archiver: Arc<dyn Archiver>,
    pub kernel_probe: Arc<dyn KernelProbe>,
    pub fs_magic_probe: Arc<dyn FsMagicProbe>,
    pub label_formatter: Arc<dyn MountLabelFormatter>,
    pub mount_table: Arc<dyn MountTable>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            id_mapper: Arc::new(IdentityIdMapper),
            archiver: Arc::new(TarArchiver),
            kernel_probe: Arc::new(ProcKernelProbe),
            fs_magic_probe: Arc::new(StatfsMagicProbe),
            label_formatter: Arc::new(IdentityMountLabelFormatter),
            mount_table: Arc::new(ProcMountinfoTable),
        }
    }
}

/// The layered filesystem driver. `String()` in the external interface
/// table is `Driver::name()`, returning `"overlay2"`.
pub struct Driver {
    layout: Layout,
    mount_manager: MountManager,
    id_mapper: Arc<dyn IdMapper>,
    archiver: Arc<dyn Archiver>,
    fs_magic_probe: Arc<dyn FsMagicProbe>,
}

impl Driver {
    /// §6 `Init`. Preconditions, in order: (a) `overlay` is listed in
    /// `/proc/filesystems` after a best-effort `modprobe overlay`; (b)
    /// kernel version ≥ 3.19.0; (c) root dir mkdir-able; (d) the four
    /// subdirectories mkdir-able. (a)/(b) failing yields
    /// [`Error::NotSupported`].
    pub fn init(root: impl AsRef<Path>, options: InitOptions) -> Result<Self> {
        let root = root.as_ref();

        if !options.kernel_probe.supports_overlay()? {
            return Err(Error::NotSupported("overlay filesystem module is not available".into()));
        }
        let version = options.kernel_probe.version()?;
        if version < MIN_KERNEL_VERSION {
            return Err(Error::NotSupported(format!(
                "kernel {:?} is older than the minimum supported {:?}",
                version, MIN_KERNEL_VERSION
            )));
        }

        let layout = Layout::new(root);
        std::fs::create_dir_all(layout.root())?;
        for kind in ALL_KINDS {
            std::fs::create_dir_all(layout.kind_root(kind))?;
        }

        info!("overlay2 driver initialised at {:?}", layout.root());

        Ok(Self {
            mount_manager: MountManager::new(
                options.id_mapper.clone(),
                options.label_formatter,
                options.mount_table,
            ),
            id_mapper: options.id_mapper,
            archiver: options.archiver,
            fs_magic_probe: options.fs_magic_probe,
            layout,
        })
    }

    /// `String()`.
    pub fn name(&self) -> &'static str {
        "overlay2"
    }

    pub fn create(&self, id: &str, parent: &str) -> Result<()> {
        lifecycle::create(&self.layout, &self.mount_manager, self.id_mapper.as_ref(), id, parent)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        lifecycle::remove(&self.layout, &self.mount_manager, id)
    }

    pub fn get(&self, id: &str, mount_label: &str) -> Result<std::path::PathBuf> {
        self.mount_manager.get(&self.layout, id, mount_label)
    }

    pub fn put(&self, id: &str) -> Result<()> {
        self.mount_manager.put(&self.layout, id)
    }

    pub fn exists(&self, id: &str) -> bool {
        lifecycle::exists(&self.layout, id)
    }

    pub fn status(&self) -> Result<Vec<(String, String)>> {
        lifecycle::status(&self.layout, self.fs_magic_probe.as_ref())
    }

    pub fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        diff::changes(&self.layout, id, parent)
    }

    pub fn diff(&self, id: &str, _parent: &str) -> Result<Box<dyn Read + Send>> {
        diff::diff(self.archiver.as_ref(), &self.layout, id)
    }

    pub fn apply_diff(&self, id: &str, _parent: &str, stream: Box<dyn Read>) -> Result<u64> {
        diff::apply_diff(self.archiver.as_ref(), &self.layout, id, stream)
    }

    pub fn diff_size(&self, id: &str, parent: &str) -> Result<u64> {
        diff::diff_size(&self.layout, id, parent)
    }

    /// §6 `Cleanup`: process-restart reconciliation of the in-memory
    /// active-mount table against actual kernel state. Never touches
    /// on-disk layers (§1 Non-goals: no orphan-layer GC).
    pub fn cleanup(&self) -> Result<()> {
        self.mount_manager.cleanup()
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::TestDir;

    struct AlwaysOverlay;
    impl KernelProbe for AlwaysOverlay {
        fn version(&self) -> Result<(u32, u32, u32)> {
            Ok((5, 15, 0))
        }
        fn supports_overlay(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn test_options() -> InitOptions {
        InitOptions {
            kernel_probe: Arc::new(AlwaysOverlay),
            ..InitOptions::default()
        }
    }

    #[test]
    fn init_rejects_old_kernel() {
        struct OldKernel;
        impl KernelProbe for OldKernel {
            fn version(&self) -> Result<(u32, u32, u32)> {
                Ok((3, 10, 0))
            }
            fn supports_overlay(&self) -> Result<bool> {
                Ok(true)
            }
        }
        let dir = TestDir::new();
        let opts = InitOptions { kernel_probe: Arc::new(OldKernel), ..InitOptions::default() };
        let err = Driver::init(dir.path(), opts).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn init_rejects_missing_overlay_module() {
        struct NoOverlay;
        impl KernelProbe for NoOverlay {
            fn version(&self) -> Result<(u32, u32, u32)> {
                Ok((5, 15, 0))
            }
            fn supports_overlay(&self) -> Result<bool> {
                Ok(false)
            }
        }
        let dir = TestDir::new();
        let opts = InitOptions { kernel_probe: Arc::new(NoOverlay), ..InitOptions::default() };
        let err = Driver::init(dir.path(), opts).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn name_is_overlay2() {
        let dir = TestDir::new();
        let driver = Driver::init(dir.path(), test_options()).unwrap();
        assert_eq!(driver.name(), "overlay2");
    }

    #[test]
    fn create_get_put_remove_for_root_layer() {
        let dir = TestDir::new();
        let driver = Driver::init(dir.path(), test_options()).unwrap();

        driver.create("a", "").unwrap();
        assert!(driver.exists("a"));

        let path = driver.get("a", "").unwrap();
        assert_eq!(path, driver.root().join("diff").join("a"));
        driver.put("a").unwrap();

        driver.remove("a").unwrap();
        assert!(!driver.exists("a"));
    }
}
