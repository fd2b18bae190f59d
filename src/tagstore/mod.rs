//! Persistent reference → image-id tag store (§4.4 / §4.5, the
//! distilled spec's second, independent core).
//!
//! On-disk form: `{ "Repositories": { repo-name: { full-ref: image-id } } }`
//! with both levels of keys sorted ascending — `BTreeMap` gives that for
//! free through `serde_json`, the same "content-addressed store, JSON
//! sidecar, atomic rename" shape the pack's `pyroth-sbx` OCI store uses for
//! its own blob bookkeeping (there backed by SQLite; here the distilled
//! spec is explicit that the canonical form is JSON, so that's what's
//! implemented).

mod reference;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub use reference::{parse as parse_reference, Reference};

use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDisk {
    #[serde(rename = "Repositories")]
    repositories: BTreeMap<String, BTreeMap<String, String>>,
}

/// A persistent reference → image-id map, backed by a single JSON file.
pub struct Store {
    path: PathBuf,
    data: Mutex<OnDisk>,
}

impl Store {
    /// Opens (or initialises) the store at `path`. A missing file is
    /// treated as an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OnDisk::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, data: Mutex::new(data) })
    }

    /// Inserts or replaces a binding. With `force = false`, an existing
    /// binding to a *different* id fails with [`Error::Conflict`] (message
    /// prefixed `Conflict:`, matching the contract callers depend on).
    pub fn add(&self, raw_reference: &str, image_id: &str, force: bool) -> Result<()> {
        let reference = reference::parse(raw_reference);
        let mut data = self.data.lock().unwrap();
        let repo = data.repositories.entry(reference.name.clone()).or_default();

        if let Some(existing) = repo.get(&reference.full) {
            if existing != image_id && !force {
                return Err(Error::Conflict(format!(
                    "tag {} is already set to image {existing}",
                    reference.full
                )));
            }
        }

        repo.insert(reference.full.clone(), image_id.to_owned());
        self.persist(&data)
    }

    /// Returns the image id bound to `raw_reference`. Bare names resolve
    /// to `:latest`.
    pub fn get(&self, raw_reference: &str) -> Result<String> {
        let reference = reference::parse(raw_reference);
        let data = self.data.lock().unwrap();
        data.repositories
            .get(&reference.name)
            .and_then(|repo| repo.get(&reference.full))
            .cloned()
            .ok_or_else(|| Error::DoesNotExist(raw_reference.to_owned()))
    }

    /// Removes a binding. Deleting the last reference under a repo name
    /// leaves no empty repo entry behind.
    pub fn delete(&self, raw_reference: &str) -> Result<()> {
        let reference = reference::parse(raw_reference);
        let mut data = self.data.lock().unwrap();

        let removed = data
            .repositories
            .get_mut(&reference.name)
            .map(|repo| repo.remove(&reference.full).is_some())
            .unwrap_or(false);

        if !removed {
            return Err(Error::DoesNotExist(raw_reference.to_owned()));
        }

        let repo_now_empty = data
            .repositories
            .get(&reference.name)
            .map(BTreeMap::is_empty)
            .unwrap_or(false);
        if repo_now_empty {
            data.repositories.remove(&reference.name);
        }

        self.persist(&data)
    }

    /// All references currently bound to `image_id`, unordered.
    pub fn references(&self, image_id: &str) -> Vec<String> {
        let data = self.data.lock().unwrap();
        data.repositories
            .values()
            .flat_map(|repo| {
                repo.iter()
                    .filter(|(_, id)| id.as_str() == image_id)
                    .map(|(full, _)| full.clone())
            })
            .collect()
    }

    /// All `(reference, image_id)` pairs under a repo name.
    pub fn references_by_name(&self, name: &str) -> Vec<(String, String)> {
        let data = self.data.lock().unwrap();
        data.repositories
            .get(name)
            .map(|repo| repo.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Persists the full map: write to a temp file, fsync, rename over the
    /// target. The on-disk encoding is the canonical sorted-keys form —
    /// byte-identical across re-loads given identical mutations.
    fn persist(&self, data: &OnDisk) -> Result<()> {
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = tmp_path(&self.path);
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::TestDir;

    fn store(dir: &TestDir) -> Store {
        Store::open(dir.path().join("repositories.json")).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = TestDir::new();
        let s = store(&dir);
        s.add("busybox:latest", "sha256:91e5", false).unwrap();
        assert_eq!(s.get("busybox:latest").unwrap(), "sha256:91e5");
    }

    #[test]
    fn bare_name_resolves_through_latest() {
        let dir = TestDir::new();
        let s = store(&dir);
        s.add("user/repo", "id1", false).unwrap();
        assert_eq!(s.get("user/repo").unwrap(), "id1");
        assert_eq!(s.get("user/repo:latest").unwrap(), "id1");
    }

    #[test]
    fn get_unknown_is_does_not_exist() {
        let dir = TestDir::new();
        let s = store(&dir);
        let err = s.get("nope:latest").unwrap_err();
        assert!(matches!(err, Error::DoesNotExist(_)));
    }

    #[test]
    fn add_conflict_without_force() {
        let dir = TestDir::new();
        let s = store(&dir);
        s.add("a:latest", "id1", false).unwrap();
        let err = s.add("a:latest", "id2", false).unwrap_err();
        match err {
            Error::Conflict(msg) => assert!(msg.starts_with("tag")),
            other => panic!("expected Conflict, got {other:?}"),
        }
        // Message surfaced to callers always begins with "Conflict:"
        // thanks to the Error::Conflict Display impl.
        let err = s.add("a:latest", "id2", false).unwrap_err();
        assert!(err.to_string().starts_with("Conflict:"));

        s.add("a:latest", "id2", true).unwrap();
        assert_eq!(s.get("a:latest").unwrap(), "id2");
    }

    #[test]
    fn delete_removes_empty_repo_entry() {
        let dir = TestDir::new();
        let s = store(&dir);
        s.add("solo:latest", "id1", false).unwrap();
        s.delete("solo:latest").unwrap();
        let err = s.get("solo:latest").unwrap_err();
        assert!(matches!(err, Error::DoesNotExist(_)));

        let err = s.delete("solo:latest").unwrap_err();
        assert!(matches!(err, Error::DoesNotExist(_)));
    }

    #[test]
    fn references_and_references_by_name() {
        let dir = TestDir::new();
        let s = store(&dir);
        s.add("repo:a", "id1", false).unwrap();
        s.add("repo:b", "id1", false).unwrap();
        s.add("repo:c", "id2", false).unwrap();

        let mut refs = s.references("id1");
        refs.sort();
        assert_eq!(refs, vec!["repo:a".to_string(), "repo:b".to_string()]);

        let mut by_name = s.references_by_name("repo");
        by_name.sort();
        assert_eq!(
            by_name,
            vec![
                ("repo:a".to_string(), "id1".to_string()),
                ("repo:b".to_string(), "id1".to_string()),
                ("repo:c".to_string(), "id2".to_string()),
            ]
        );
    }

    #[test]
    fn persists_across_reload() {
        let dir = TestDir::new();
        let path = dir.path().join("repositories.json");
        {
            let s = Store::open(&path).unwrap();
            s.add("a:latest", "id1", false).unwrap();
            s.add("b:latest", "id2", false).unwrap();
            s.delete("a:latest").unwrap();
        }
        let reloaded = Store::open(&path).unwrap();
        assert_eq!(reloaded.get("b:latest").unwrap(), "id2");
        assert!(reloaded.get("a:latest").is_err());
    }
}
