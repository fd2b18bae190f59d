//! Deterministic directory naming under the driver root.
//!
//! `R/layers/<id>`, `R/diff/<id>`, `R/mnt/<id>`, `R/work/<id>` — see §3 of
//! the design spec. Nothing here touches the filesystem; it only computes
//! paths, the same way `ciel-rs::overlayfs::OverlayFS` keeps `inst`/`base`/
//! `lower`/`upper`/`work` as plain `PathBuf`s and leaves creation to the
//! caller.

use std::path::{Path, PathBuf};

/// The four on-disk roles a layer id can be resolved under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `layers/<id>` — the parent-chain text file.
    Layers,
    /// `diff/<id>` — the writable upper / a root layer's own content.
    Diff,
    /// `mnt/<id>` — the union mount point.
    Mnt,
    /// `work/<id>` — overlay scratch directory.
    Work,
}

impl Kind {
    fn dirname(self) -> &'static str {
        match self {
            Kind::Layers => "layers",
            Kind::Diff => "diff",
            Kind::Mnt => "mnt",
            Kind::Work => "work",
        }
    }
}

/// The four top-level subdirectories a driver root is made of.
pub const ALL_KINDS: [Kind; 4] = [Kind::Layers, Kind::Diff, Kind::Mnt, Kind::Work];

/// Path layout rooted at a single driver root directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `dir(kind, id) = root / kind / id`.
    pub fn dir(&self, kind: Kind, id: &str) -> PathBuf {
        self.root.join(kind.dirname()).join(id)
    }

    pub fn layers(&self, id: &str) -> PathBuf {
        self.dir(Kind::Layers, id)
    }

    pub fn diff(&self, id: &str) -> PathBuf {
        self.dir(Kind::Diff, id)
    }

    pub fn mnt(&self, id: &str) -> PathBuf {
        self.dir(Kind::Mnt, id)
    }

    pub fn work(&self, id: &str) -> PathBuf {
        self.dir(Kind::Work, id)
    }

    /// The transient rename-target used by `Remove`'s atomicity boundary.
    pub fn removing(&self, kind: Kind, id: &str) -> PathBuf {
        self.root
            .join(kind.dirname())
            .join(format!("{id}-removing"))
    }

    /// The top-level subdirectory for a kind, e.g. `root/layers`.
    pub fn kind_root(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.dirname())
    }
}
