//! The mount manager (§4.3): a single mutex-protected active-mount table,
//! ref-counted `Get`/`Put`, and union-mount construction (§4.3.1) with a
//! crash-recovery mount-table check (§4.3.2).
//!
//! The mutex is held across the union-mount syscall and the post-mount
//! chown of `work/<id>`, exactly as §5's locking discipline requires: the
//! refcount transition and the kernel-visible mount state must agree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::chain;
use crate::collab::{IdMapper, MountLabelFormatter, MountTable};
use crate::error::{Error, Result};
use crate::paths::Layout;

/// The kernel's mount-options buffer is historically bounded to one page.
/// This driver enforces a conservative 4096-byte limit rather than
/// splitting lower layers across chained mounts (§9 known bound).
pub const MAX_OPTIONS_LEN: usize = 4096;

/// Refcount + current merged path for one currently-acquired layer id.
#[derive(Debug, Clone)]
pub struct ActiveMount {
    pub refcount: u64,
    pub path: PathBuf,
}

/// Ref-counted overlay mount table, shared between `Get`/`Put` and the
/// layer lifecycle's `Remove`.
pub struct MountManager {
    active: Mutex<HashMap<String, ActiveMount>>,
    id_mapper: Arc<dyn IdMapper>,
    label_formatter: Arc<dyn MountLabelFormatter>,
    mount_table: Arc<dyn MountTable>,
}

impl MountManager {
    pub fn new(
        id_mapper: Arc<dyn IdMapper>,
        label_formatter: Arc<dyn MountLabelFormatter>,
        mount_table: Arc<dyn MountTable>,
    ) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            id_mapper,
            label_formatter,
            mount_table,
        }
    }

    /// Inserts an empty active-mount record (refcount 0, empty path) for a
    /// freshly created id, as §4.2 `Create` requires. A no-op if a record
    /// already exists (shouldn't happen for a genuinely new id, but Create
    /// already verified that above it).
    pub fn register(&self, id: &str) {
        self.active
            .lock()
            .unwrap()
            .entry(id.to_owned())
            .or_insert_with(|| ActiveMount {
                refcount: 0,
                path: PathBuf::new(),
            });
    }

    /// §4.3 `Get`.
    pub fn get(&self, layout: &Layout, id: &str, mount_label: &str) -> Result<PathBuf> {
        // Missing chain file degrades to empty chain but never creates one.
        let parent_chain = chain::read_chain(layout, id)?.unwrap_or_default();

        let mut active = self.active.lock().unwrap();
        let entry = active.entry(id.to_owned()).or_insert_with(|| ActiveMount {
            refcount: 0,
            path: PathBuf::new(),
        });

        if parent_chain.is_empty() {
            // §3 invariant 5: an empty-chain layer is never mounted.
            entry.path = layout.diff(id);
        } else {
            entry.path = layout.mnt(id);
            if entry.refcount == 0 {
                let already_mounted = self.mount_table.mounted(&entry.path)?;
                if !already_mounted {
                    self.mount_overlay(layout, id, &parent_chain, mount_label)?;
                } else {
                    debug!("{id}: recovered already-mounted overlay at {:?}", entry.path);
                }
                let work = layout.work(id);
                self.id_mapper.mkdir_all_as(&work, 0o755)?;
            }
        }

        entry.refcount += 1;
        Ok(entry.path.clone())
    }

    /// §4.3 `Put`.
    pub fn put(&self, layout: &Layout, id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap();

        let Some(entry) = active.get_mut(id) else {
            // Recovery path for a stale mount left by a previous process:
            // best-effort unmount, tolerating "not mounted".
            if chain::exists(layout, id) {
                let target = layout.mnt(id);
                if self.mount_table.mounted(&target).unwrap_or(false) {
                    if let Err(e) = unmount_overlay(&target) {
                        debug!("{id}: best-effort recovery unmount of {target:?} failed: {e}");
                    }
                }
            }
            return Ok(());
        };

        if entry.refcount > 1 {
            entry.refcount -= 1;
            return Ok(());
        }

        let parent_chain = chain::read_chain(layout, id)?.unwrap_or_default();
        if !parent_chain.is_empty() {
            unmount_overlay(&entry.path)?;
        }
        active.remove(id);
        Ok(())
    }

    /// Used by `Remove` (§4.2): if the id is actively mounted with
    /// `refcount > 0`, returns `false` (caller should no-op, see §9). If
    /// `refcount == 0` or there is no active record, unmounts if needed,
    /// drops the record, and returns `true` (caller may proceed with
    /// directory removal).
    pub fn try_clear_for_remove(&self, layout: &Layout, id: &str) -> Result<bool> {
        let mut active = self.active.lock().unwrap();

        match active.get(id) {
            Some(entry) if entry.refcount > 0 => Ok(false),
            Some(_) => {
                let parent_chain = chain::read_chain(layout, id)?.unwrap_or_default();
                if !parent_chain.is_empty() {
                    let target = layout.mnt(id);
                    if self.mount_table.mounted(&target).unwrap_or(false) {
                        unmount_overlay(&target)?;
                    }
                }
                active.remove(id);
                Ok(true)
            }
            None => Ok(true),
        }
    }

    /// Process-restart reconciliation (§6 `Cleanup`): drop any in-memory
    /// record whose recorded path is no longer actually mounted, or whose
    /// refcount is the transient zero the data model calls out. Never
    /// touches on-disk layers.
    pub fn cleanup(&self) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        let mut stale = Vec::new();
        for (id, entry) in active.iter() {
            if entry.refcount == 0 {
                stale.push(id.clone());
                continue;
            }
            // diff/<id> paths (empty-chain layers) are never mounted and
            // are consistent by construction; only mnt/<id> paths can go
            // stale across a process restart.
            if entry.path.ends_with(id) && !self.mount_table.mounted(&entry.path).unwrap_or(true) {
                debug!("{id}: dropping stale active-mount record, {:?} is not mounted", entry.path);
                stale.push(id.clone());
            }
        }
        for id in stale {
            active.remove(&id);
        }
        Ok(())
    }

    fn mount_overlay(
        &self,
        layout: &Layout,
        id: &str,
        parent_chain: &[String],
        mount_label: &str,
    ) -> Result<()> {
        let lowerdirs = parent_chain
            .iter()
            .map(|p| layout.diff(p).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let upper = layout.diff(id);
        let work = layout.work(id);
        let target = layout.mnt(id);

        let options = format!(
            "lowerdir={lowerdirs},upperdir={},workdir={}",
            upper.display(),
            work.display()
        );
        let options = self.label_formatter.format(&options, mount_label);

        if options.len() > MAX_OPTIONS_LEN {
            return Err(Error::OptionsTooLong {
                id: id.to_owned(),
                len: options.len(),
                max: MAX_OPTIONS_LEN,
            });
        }

        mount(
            Some(Path::new("overlay")),
            &target,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|source| Error::MountFailed {
            target: target.clone(),
            source,
        })
    }
}

fn unmount_overlay(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
