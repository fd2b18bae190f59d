//! Layer lifecycle: `Create`, `Remove`, `Exists`, `Status` (§4.2).

use std::fs;

use log::debug;

use crate::chain;
use crate::collab::{FsMagicProbe, IdMapper};
use crate::error::{Error, Result};
use crate::mount::MountManager;
use crate::paths::{Kind, Layout, ALL_KINDS};

/// §4.2 `Create`. Fails with [`Error::AlreadyExists`] if any of the four
/// per-id paths already exists, [`Error::NotFound`] if `parent` is
/// non-empty and absent.
pub fn create(
    layout: &Layout,
    mount_manager: &MountManager,
    id_mapper: &dyn IdMapper,
    id: &str,
    parent: &str,
) -> Result<()> {
    for kind in ALL_KINDS {
        if layout.dir(kind, id).exists() {
            return Err(Error::already_exists(id));
        }
    }

    id_mapper.mkdir_all_as(&layout.diff(id), 0o755)?;
    id_mapper.mkdir_all_as(&layout.mnt(id), 0o755)?;
    id_mapper.mkdir_all_as(&layout.work(id), 0o755)?;

    if let Err(e) = chain::write_chain(layout, id, parent) {
        // Roll back the directories we just created so a failed Create
        // doesn't leave a half-formed layer that `Exists` still sees as
        // absent but whose directories linger on disk.
        let _ = fs::remove_dir_all(layout.diff(id));
        let _ = fs::remove_dir_all(layout.mnt(id));
        let _ = fs::remove_dir_all(layout.work(id));
        return Err(e);
    }

    mount_manager.register(id);
    Ok(())
}

/// §4.2 `Remove`. Mutually exclusive with the mount manager's table
/// operations via [`MountManager::try_clear_for_remove`]. A no-op
/// returning success when the id is actively acquired (§9 documented
/// caveat).
pub fn remove(layout: &Layout, mount_manager: &MountManager, id: &str) -> Result<()> {
    if !mount_manager.try_clear_for_remove(layout, id)? {
        debug!("{id}: remove requested while still acquired, no-op (see design notes)");
        return Ok(());
    }

    for kind in [Kind::Mnt, Kind::Diff, Kind::Work] {
        remove_one(layout, kind, id)?;
    }

    chain::remove_chain(layout, id)
}

fn remove_one(layout: &Layout, kind: Kind, id: &str) -> Result<()> {
    let live = layout.dir(kind, id);
    let removing = layout.removing(kind, id);

    match fs::rename(&live, &removing) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    // The rename above is the atomicity boundary: any concurrent Get now
    // observes "not found". The actual tree deletion that follows is
    // best-effort; leftover `-removing` debris on failure doesn't violate
    // any invariant Get/Exists depend on.
    if let Err(e) = fs::remove_dir_all(&removing) {
        debug!("{id}: failed to delete {removing:?} after rename: {e}");
    }
    Ok(())
}

/// §4.2 `Exists`.
pub fn exists(layout: &Layout, id: &str) -> bool {
    chain::exists(layout, id)
}

/// §4.2 `Status`, expanded per `[SUPPLEMENT]` in SPEC_FULL with crate
/// version and capability diagnostics.
pub fn status(layout: &Layout, fs_magic: &dyn FsMagicProbe) -> Result<Vec<(String, String)>> {
    let backing_fs = fs_magic
        .magic_name(layout.root())
        .unwrap_or_else(|_| "unknown".to_owned());
    let layer_count = chain::count_layers(layout)?;

    Ok(vec![
        ("Root Dir".to_owned(), layout.root().display().to_string()),
        ("Backing Filesystem".to_owned(), backing_fs),
        ("Layers".to_owned(), layer_count.to_string()),
        ("Driver".to_owned(), "overlay2".to_owned()),
        ("Version".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
        (
            "Supports d_type".to_owned(),
            crate::test_support::is_root().to_string(),
        ),
    ])
}
