//! Collaborator traits for the pieces §6 calls out as external to the core:
//! UID/GID remapping, kernel/filesystem probing, MAC mount-label splicing,
//! and mount-table queries. Each trait ships a real, working default
//! implementation — the core plane this crate *does* own (mounting,
//! chaining, diffing) needs something genuine to run against, even though
//! the policy behind each collaborator is someone else's concern.

use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use nix::unistd::{self, Gid, Uid};

use crate::error::Result;

/// UID/GID remapping, as used by a user-namespaced container runtime.
pub trait IdMapper: Send + Sync {
    /// Resolves the uid/gid that should own root-owned driver directories.
    fn root_uid_gid(&self) -> (u32, u32);

    /// `mkdir -p` with the given mode, owned by `root_uid_gid()`.
    fn mkdir_all_as(&self, path: &Path, mode: u32) -> Result<()> {
        fs::create_dir_all(path)?;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(mode);
        fs::set_permissions(path, perms)?;
        let (uid, gid) = self.root_uid_gid();
        unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        Ok(())
    }
}

/// No remapping: directories are owned by the real uid/gid the process runs
/// as. Real remap tables belong to the container runtime embedding this
/// driver, not to the driver itself (§1 scope).
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityIdMapper;

impl IdMapper for IdentityIdMapper {
    fn root_uid_gid(&self) -> (u32, u32) {
        (unistd::getuid().as_raw(), unistd::getgid().as_raw())
    }
}

/// Kernel version and overlay-support probing, used by `Init`.
pub trait KernelProbe: Send + Sync {
    /// `(major, minor, patch)` of the running kernel.
    fn version(&self) -> Result<(u32, u32, u32)>;

    /// Whether `overlay` is listed in `/proc/filesystems`, attempting
    /// `modprobe overlay` first and ignoring its exit status (mirrors the
    /// Go driver's best-effort module load).
    fn supports_overlay(&self) -> Result<bool>;
}

/// Reads `/proc/filesystems` and `uname`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcKernelProbe;

impl KernelProbe for ProcKernelProbe {
    fn version(&self) -> Result<(u32, u32, u32)> {
        let uname = nix::sys::utsname::uname();
        let release = uname.release().to_string_lossy().into_owned();
        Ok(parse_kernel_version(&release))
    }

    fn supports_overlay(&self) -> Result<bool> {
        let _ = std::process::Command::new("modprobe")
            .arg("overlay")
            .status();
        let contents = fs::read_to_string("/proc/filesystems").unwrap_or_default();
        Ok(contents.lines().any(|l| l.trim_end() == "overlay" || l.ends_with("\toverlay")))
    }
}

fn parse_kernel_version(release: &str) -> (u32, u32, u32) {
    let core = release.split(|c: char| !c.is_ascii_digit() && c != '.').next().unwrap_or("");
    let mut parts = core.split('.').map(|p| p.parse().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major, minor, patch)
}

/// Minimum supported kernel version for overlay (§6 Init preconditions).
pub const MIN_KERNEL_VERSION: (u32, u32, u32) = (3, 19, 0);

/// Backing filesystem type probing, used by `Status`.
pub trait FsMagicProbe: Send + Sync {
    fn magic_name(&self, path: &Path) -> Result<String>;
}

/// Well-known `statfs` magic numbers, named the way `/proc/filesystems`
/// and `mount(8)` would.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatfsMagicProbe;

impl FsMagicProbe for StatfsMagicProbe {
    fn magic_name(&self, path: &Path) -> Result<String> {
        let stat = nix::sys::statfs::statfs(path)?;
        let magic = stat.filesystem_type().0;
        Ok(magic_name(magic).to_owned())
    }
}

fn magic_name(magic: i64) -> &'static str {
    match magic {
        0xEF53 => "ext4",
        0x58465342 => "xfs",
        0x9123_683e_u32 as i64 => "btrfs",
        0x0102_1994 => "tmpfs",
        0x794c_7630 => "overlayfs",
        0x6175_6673 => "aufs",
        0x5346_4658 => "xfs",
        0x65735546 => "fuse",
        0xF15F_F15F => "ecryptfs",
        0x2fc1_2fc1 => "zfs",
        _ => "unknown",
    }
}

/// Splices MAC policy labels (SELinux/AppArmor) into an overlay options
/// string. The identity implementation leaves the options untouched; a
/// real MAC-aware caller supplies its own.
pub trait MountLabelFormatter: Send + Sync {
    fn format(&self, options: &str, mount_label: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMountLabelFormatter;

impl MountLabelFormatter for IdentityMountLabelFormatter {
    fn format(&self, options: &str, mount_label: &str) -> String {
        if mount_label.is_empty() {
            options.to_owned()
        } else {
            format!("{options},context=\"{mount_label}\"")
        }
    }
}

/// Queries the kernel mount table, used to recover idempotently from a
/// crashed previous process (§4.3.2).
pub trait MountTable: Send + Sync {
    fn mounted(&self, path: &Path) -> Result<bool>;
}

/// Parses `/proc/self/mountinfo`, exactly the way the teacher's own
/// `is_mounted` free function in `overlayfs.rs` already does.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMountinfoTable;

impl MountTable for ProcMountinfoTable {
    fn mounted(&self, path: &Path) -> Result<bool> {
        is_mounted(path, "overlay")
    }
}

pub(crate) fn is_mounted(mountpoint: &Path, fs_type: &str) -> Result<bool> {
    let mountpoint: PathBuf = mountpoint
        .canonicalize()
        .unwrap_or_else(|_| mountpoint.to_path_buf());
    let fs_type = OsString::from(fs_type);
    let mountinfo_content = fs::read("/proc/self/mountinfo")?;
    let parser = libmount::mountinfo::Parser::new(&mountinfo_content);

    for mount in parser {
        let mount = match mount {
            Ok(m) => m,
            Err(e) => {
                debug!("skipping unparseable mountinfo line: {e}");
                continue;
            }
        };
        if mount.mount_point == mountpoint && mount.fstype == fs_type {
            return Ok(true);
        }
    }
    Ok(false)
}
