//! Per-layer parent-chain store (§4.1).
//!
//! The chain is stored exactly as newline-separated text, nearest parent
//! first, oldest ancestor last. A missing file means "layer absent"; a
//! present-but-empty file means "root layer". The in-memory chain is always
//! derived fresh from disk — it is never cached, matching the data model's
//! "never cached" clause.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Layout;

/// Creates `layers/<id>`, writing `parent`'s id followed by `parent`'s own
/// chain, one ancestor per line. `parent == ""` produces an empty file (a
/// root layer).
///
/// Fails with [`Error::NotFound`] if `parent` is non-empty and has no chain
/// file of its own.
pub fn write_chain(layout: &Layout, id: &str, parent: &str) -> Result<()> {
    let mut lines = Vec::new();
    if !parent.is_empty() {
        if !exists(layout, parent) {
            return Err(Error::not_found(parent));
        }
        lines.push(parent.to_owned());
        lines.extend(read_chain(layout, parent)?.unwrap_or_default());
    }

    let path = layout.layers(id);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&path)?;
    for line in &lines {
        writeln!(file, "{line}")?;
    }
    file.sync_all()?;
    Ok(())
}

/// Returns the non-empty lines of `layers/<id>`, or `None` if the chain file
/// is absent (the layer itself is absent — distinct from `Some(vec![])`,
/// which is a root layer with an existing, empty chain file).
pub fn read_chain(layout: &Layout, id: &str) -> Result<Option<Vec<String>>> {
    read_chain_at(&layout.layers(id))
}

fn read_chain_at(path: &Path) -> Result<Option<Vec<String>>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(
            contents
                .lines()
                .map(str::to_owned)
                .filter(|l| !l.is_empty())
                .collect(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `stat(layers/<id>)` succeeds.
pub fn exists(layout: &Layout, id: &str) -> bool {
    layout.layers(id).is_file()
}

/// Removes `layers/<id>`. A missing file is not an error (mirrors Remove's
/// "missing file is ignored" clause).
pub fn remove_chain(layout: &Layout, id: &str) -> Result<()> {
    match fs::remove_file(layout.layers(id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Counts the layer ids currently discoverable under `layers/`, for
/// `Status()`. Uses `rayon` to parallelise the (cheap but potentially
/// numerous) directory-entry filter for large driver roots.
pub fn count_layers(layout: &Layout) -> Result<usize> {
    use rayon::prelude::*;

    let dir = layout.kind_root(crate::paths::Kind::Layers);
    let entries: Vec<_> = match fs::read_dir(&dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let count = entries
        .par_iter()
        .filter(|e| e.path().is_file())
        .count();
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::TestDir;

    fn layout(dir: &TestDir) -> Layout {
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.kind_root(crate::paths::Kind::Layers)).unwrap();
        layout
    }

    #[test]
    fn root_layer_has_empty_chain() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        write_chain(&layout, "a", "").unwrap();
        assert_eq!(read_chain(&layout, "a").unwrap(), Some(vec![]));
    }

    #[test]
    fn child_chain_is_parent_prepended() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        write_chain(&layout, "a", "").unwrap();
        write_chain(&layout, "b", "a").unwrap();
        write_chain(&layout, "c", "b").unwrap();

        assert_eq!(read_chain(&layout, "c").unwrap(), Some(vec!["b".into(), "a".into()]));
        assert_eq!(read_chain(&layout, "b").unwrap(), Some(vec!["a".into()]));
    }

    #[test]
    fn missing_chain_is_none() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        assert_eq!(read_chain(&layout, "nope").unwrap(), None);
        assert!(!exists(&layout, "nope"));
    }

    #[test]
    fn write_chain_rejects_missing_parent() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        let err = write_chain(&layout, "b", "a").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn remove_chain_is_idempotent() {
        let dir = TestDir::new();
        let layout = layout(&dir);
        write_chain(&layout, "a", "").unwrap();
        remove_chain(&layout, "a").unwrap();
        assert!(!exists(&layout, "a"));
        remove_chain(&layout, "a").unwrap();
    }
}
