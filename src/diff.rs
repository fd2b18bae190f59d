//! Diff/apply data plane (§4.4): `Changes`, `Diff`, `ApplyDiff`, `DiffSize`.
//!
//! `Changes` classifies every entry under a layer's upper directory against
//! the composed lower view of `parent`'s ancestor chain, generalising
//! `ciel-rs::overlayfs::OverlayFS::diff`'s single-lower `Diff` enum
//! (`Symlink`/`OverrideDir`/`RenamedDir`/`NewDir`/`ModifiedDir`/
//! `WhiteoutFile`/`File`) to a full chain and collapsing it to the
//! Add/Modify/Delete shape the external interface table expects.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive::{ArchiveOptions, Archiver, OVERLAY_OPAQUE_XATTR, OVERLAY_REDIRECT_XATTR};
use crate::chain;
use crate::error::Result;
use crate::paths::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Path relative to the layer's own diff directory.
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Diff directories of `parent` and its own ancestor chain, nearest first —
/// the "composed lower view" a layer's upper is compared against.
fn lower_diff_dirs(layout: &Layout, parent: &str) -> Result<Vec<PathBuf>> {
    if parent.is_empty() {
        return Ok(Vec::new());
    }
    let mut ids = vec![parent.to_owned()];
    ids.extend(chain::read_chain(layout, parent)?.unwrap_or_default());
    Ok(ids.iter().map(|p| layout.diff(p)).collect())
}

/// §4.4 `Changes`.
pub fn changes(layout: &Layout, id: &str, parent: &str) -> Result<Vec<Change>> {
    let lowers = lower_diff_dirs(layout, parent)?;
    let upper = layout.diff(id);
    let mut out = Vec::new();

    // Held as the raw `walkdir::IntoIter`, not through `.skip(1)` (a plain
    // `std::iter::Skip` that doesn't expose `skip_current_dir`): an opaque
    // directory needs to prune its own subtree out of the walk, not just
    // skip one yielded entry.
    let mut it = WalkDir::new(&upper).into_iter();
    it.next(); // the root directory itself, never a reported change

    while let Some(entry) = it.next() {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let path = entry.path();
        let rel = path.strip_prefix(&upper).unwrap_or(path).to_path_buf();
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();

        if file_type.is_char_device() && meta.rdev() == 0 {
            out.push(Change { path: rel, kind: ChangeKind::Delete });
            continue;
        }

        if file_type.is_dir() {
            if let Some(v) = xattr::get(path, OVERLAY_OPAQUE_XATTR)? {
                if v == b"y" {
                    // The lower subtree at this path is fully shadowed;
                    // report the directory itself as modified, once, and
                    // prune the walk so none of its children are visited
                    // (and independently classified) at all.
                    out.push(Change { path: rel, kind: ChangeKind::Modify });
                    it.skip_current_dir();
                    continue;
                }
            }
            if let Some(raw) = xattr::get(path, OVERLAY_REDIRECT_XATTR)? {
                out.push(Change { path: redirect_source(path, &upper, &raw), kind: ChangeKind::Delete });
                out.push(Change { path: rel, kind: ChangeKind::Modify });
                continue;
            }
        }

        let existed = lowers.iter().any(|l| l.join(&rel).exists());
        out.push(Change {
            path: rel,
            kind: if existed { ChangeKind::Modify } else { ChangeKind::Add },
        });
    }

    Ok(out)
}

fn redirect_source(path: &Path, upper: &Path, raw: &[u8]) -> PathBuf {
    let from = String::from_utf8_lossy(raw).into_owned();
    let from_path = PathBuf::from(&from);
    if from_path.is_absolute() {
        from_path.strip_prefix("/").unwrap_or(&from_path).to_path_buf()
    } else {
        let mut candidate = path.to_path_buf();
        candidate.pop();
        candidate.push(&from_path);
        candidate.strip_prefix(upper).unwrap_or(&candidate).to_path_buf()
    }
}

/// §4.4 `Diff`: a tar stream of `diff/<id>` with overlay whiteout
/// translation (see [`crate::archive`]).
pub fn diff(archiver: &dyn Archiver, layout: &Layout, id: &str) -> Result<Box<dyn Read + Send>> {
    archiver.tar_with_options(&layout.diff(id), &ArchiveOptions::default())
}

/// §4.4 `ApplyDiff`: materialises a received stream into `diff/<id>`,
/// returning the number of bytes consumed.
pub fn apply_diff(
    archiver: &dyn Archiver,
    layout: &Layout,
    id: &str,
    stream: Box<dyn Read>,
) -> Result<u64> {
    fs::create_dir_all(layout.diff(id))?;
    archiver.untar_uncompressed(stream, &layout.diff(id), &ArchiveOptions::default())
}

/// §4.4 `DiffSize`: the on-disk size `Diff`'s tar stream would carry,
/// before compression. Whiteouts contribute 0.
pub fn diff_size(layout: &Layout, id: &str, parent: &str) -> Result<u64> {
    let upper = layout.diff(id);
    let mut total = 0u64;
    for change in changes(layout, id, parent)? {
        if change.kind == ChangeKind::Delete {
            continue;
        }
        let path = upper.join(&change.path);
        if let Ok(meta) = fs::symlink_metadata(&path) {
            total += meta.len();
        }
    }
    Ok(total)
}
