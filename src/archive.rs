//! The `Archiver` collaborator (§6) and its concrete, working default,
//! `TarArchiver`, which gives the diff/apply data plane (§4.4) something
//! real to run against.
//!
//! Grounded in two things already present in the retrieval pack:
//! `ciel-rs::overlayfs::OverlayFS::diff`'s whiteout/opaque/redirect
//! detection via `xattr` + `FileTypeExt::is_char_device`, and the
//! `.wh.`/`.wh..opq` tar whiteout convention used by
//! `labtable-oci-unpack::unpacker::layers` (`WHITEOUT_PREFIX`,
//! `WHITEOUT_OPAQUE`). Device-node materialisation on apply follows the
//! `mknod`/`SFlag`/`makedev` pattern in
//! `GuillemCastro-libcontainer-rs::filesystem`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tar::{EntryType, Header};
use walkdir::WalkDir;

use crate::error::Result;

/// Marks an overlay whiteout entry when re-encoded as a tar entry name.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marks an opaque directory when re-encoded as a tar entry name.
pub const WHITEOUT_OPAQUE: &str = ".wh..opq";
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
pub const OVERLAY_REDIRECT_XATTR: &str = "trusted.overlay.redirect";

/// Options accepted by [`Archiver`]. UID/GID remapping here is the blunt
/// "stamp every entry with this owner" form — the full mapping-table policy
/// lives with whoever constructs the driver (§1, out of scope for the
/// core).
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub uid_gid: Option<(u32, u32)>,
}

/// Archive encode/decode of a directory tree, with overlay whiteout
/// awareness.
pub trait Archiver: Send + Sync {
    /// Streams `root`'s contents out as a tar archive, translating overlay
    /// whiteout char-devices and opaque-directory markers into the
    /// `.wh.`/`.wh..opq` tar convention.
    fn tar_with_options(&self, root: &Path, opts: &ArchiveOptions) -> Result<Box<dyn Read + Send>>;

    /// Reads an uncompressed tar stream into `root`, translating
    /// `.wh.`/`.wh..opq` entries back into overlay whiteout char-devices and
    /// opaque xattrs. Returns the number of bytes consumed from `stream`.
    fn untar_uncompressed(
        &self,
        stream: Box<dyn Read>,
        root: &Path,
        opts: &ArchiveOptions,
    ) -> Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn tar_with_options(&self, root: &Path, opts: &ArchiveOptions) -> Result<Box<dyn Read + Send>> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in WalkDir::new(root).into_iter().skip(1) {
            let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path);
            let meta = fs::symlink_metadata(path)?;
            let file_type = meta.file_type();

            if file_type.is_char_device() && meta.rdev() == 0 {
                append_whiteout(&mut builder, rel, opts)?;
                continue;
            }

            if file_type.is_dir() {
                let opaque = xattr::get(path, OVERLAY_OPAQUE_XATTR)?;
                append_dir(&mut builder, rel, &meta, opts)?;
                if matches!(opaque.as_deref(), Some(b"y")) {
                    append_opaque_marker(&mut builder, rel, opts)?;
                }
            } else if file_type.is_symlink() {
                let target = fs::read_link(path)?;
                append_symlink(&mut builder, rel, &target, &meta, opts)?;
            } else if file_type.is_file() {
                append_file(&mut builder, rel, path, &meta, opts)?;
            }
            // Other special file types (fifo, socket, real device nodes)
            // never occur inside a layer's diff directory in practice; if
            // they did, they'd be silently skipped here rather than
            // misrepresented as a whiteout.
        }
        let bytes = builder.into_inner()?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn untar_uncompressed(
        &self,
        stream: Box<dyn Read>,
        root: &Path,
        _opts: &ArchiveOptions,
    ) -> Result<u64> {
        let counted = CountingReader::new(stream);
        let counted_ref = counted.count.clone();
        let mut archive = tar::Archive::new(counted);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(true);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name == ".wh..opq" {
                let dir = root.join(path.parent().unwrap_or_else(|| Path::new("")));
                fs::create_dir_all(&dir)?;
                xattr::set(&dir, OVERLAY_OPAQUE_XATTR, b"y")?;
                continue;
            }

            if let Some(real_name) = name.strip_prefix(WHITEOUT_PREFIX) {
                let parent = path.parent().unwrap_or_else(|| Path::new(""));
                let dest_dir = root.join(parent);
                fs::create_dir_all(&dest_dir)?;
                let dest = dest_dir.join(real_name);
                let _ = fs::remove_file(&dest);
                mknod(&dest, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0))?;
                continue;
            }

            let dest = root.join(&path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest)?;
        }

        drop(archive);
        Ok(std::sync::Arc::try_unwrap(counted_ref)
            .map(|c| c.into_inner())
            .unwrap_or(0))
    }
}

fn append_whiteout(
    builder: &mut tar::Builder<Vec<u8>>,
    rel: &Path,
    opts: &ArchiveOptions,
) -> Result<()> {
    let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let archive_path = rel.with_file_name(format!("{WHITEOUT_PREFIX}{name}"));
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o000);
    set_owner(&mut header, opts);
    header.set_cksum();
    builder.append_data(&mut header, archive_path, io::empty())?;
    Ok(())
}

fn append_opaque_marker(
    builder: &mut tar::Builder<Vec<u8>>,
    rel: &Path,
    opts: &ArchiveOptions,
) -> Result<()> {
    let archive_path = rel.join(WHITEOUT_OPAQUE.trim_start_matches('/'));
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o000);
    set_owner(&mut header, opts);
    header.set_cksum();
    builder.append_data(&mut header, archive_path, io::empty())?;
    Ok(())
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    rel: &Path,
    meta: &fs::Metadata,
    opts: &ArchiveOptions,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(meta.mode());
    set_owner_or(&mut header, opts, meta.uid(), meta.gid());
    header.set_cksum();
    builder.append_data(&mut header, rel, io::empty())?;
    Ok(())
}

fn append_symlink(
    builder: &mut tar::Builder<Vec<u8>>,
    rel: &Path,
    target: &Path,
    meta: &fs::Metadata,
    opts: &ArchiveOptions,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    header.set_mode(meta.mode());
    set_owner_or(&mut header, opts, meta.uid(), meta.gid());
    builder.append_link(&mut header, rel, target)?;
    Ok(())
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    rel: &Path,
    path: &Path,
    meta: &fs::Metadata,
    opts: &ArchiveOptions,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(meta.len());
    header.set_mode(meta.mode());
    set_owner_or(&mut header, opts, meta.uid(), meta.gid());
    header.set_cksum();
    let mut file = File::open(path)?;
    builder.append_data(&mut header, rel, &mut file)?;
    Ok(())
}

fn set_owner(header: &mut Header, opts: &ArchiveOptions) {
    set_owner_or(header, opts, 0, 0);
}

fn set_owner_or(header: &mut Header, opts: &ArchiveOptions, uid: u32, gid: u32) {
    let (uid, gid) = opts.uid_gid.unwrap_or((uid, gid));
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
}

/// Wraps a reader, counting total bytes read through an `Arc<Mutex<u64>>`
/// so the count survives being moved into `tar::Archive`. Mirrors
/// `labtable-oci-unpack`'s `PositionTracker`.
struct CountingReader<R> {
    inner: R,
    count: std::sync::Arc<Counter>,
}

struct Counter(std::sync::atomic::AtomicU64);

impl Counter {
    fn into_inner(self) -> u64 {
        self.0.into_inner()
    }
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            count: std::sync::Arc::new(Counter(std::sync::atomic::AtomicU64::new(0))),
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.0.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(n)
    }
}
