//! End-to-end scenarios S1-S6, numbered the same way the design notes do.
//! S1-S3 need a real overlay mount (`CAP_SYS_ADMIN`) and skip under an
//! unprivileged test runner; S4-S6 are the tag store and always run.

use std::fs;
use std::sync::{Arc, Once};

use overlay2_rs::collab::KernelProbe;
use overlay2_rs::error::Error;
use overlay2_rs::tagstore::Store;
use overlay2_rs::{Driver, InitOptions};

static INIT_LOGGER: Once = Once::new();

/// Installs a real logger so the `debug!`/`warn!` lines the mount manager
/// and lifecycle emit (best-effort cleanup, stale-mount recovery) are
/// visible under `cargo test -- --nocapture` instead of going nowhere.
fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
    });
}

struct AlwaysOverlay;
impl KernelProbe for AlwaysOverlay {
    fn version(&self) -> overlay2_rs::Result<(u32, u32, u32)> {
        Ok((5, 15, 0))
    }
    fn supports_overlay(&self) -> overlay2_rs::Result<bool> {
        Ok(true)
    }
}

fn driver(root: &std::path::Path) -> Driver {
    let opts = InitOptions {
        kernel_probe: Arc::new(AlwaysOverlay),
        ..InitOptions::default()
    };
    Driver::init(root, opts).unwrap()
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[test]
fn s1_chain_composition() {
    if !is_root() {
        eprintln!("skipping s1_chain_composition: requires CAP_SYS_ADMIN");
        return;
    }
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let d = driver(dir.path());

    d.create("a", "").unwrap();
    d.create("b", "a").unwrap();
    d.create("c", "b").unwrap();

    fs::write(d.root().join("diff").join("a").join("f"), b"from-a").unwrap();

    let mnt = d.get("c", "").unwrap();
    assert_eq!(mnt, d.root().join("mnt").join("c"));
    assert_eq!(fs::read_to_string(mnt.join("f")).unwrap(), "from-a");
    d.put("c").unwrap();
}

#[test]
fn s2_copy_up() {
    if !is_root() {
        eprintln!("skipping s2_copy_up: requires CAP_SYS_ADMIN");
        return;
    }
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let d = driver(dir.path());

    d.create("a", "").unwrap();
    d.create("b", "a").unwrap();
    d.create("c", "b").unwrap();
    fs::write(d.root().join("diff").join("a").join("f"), b"from-a").unwrap();

    let mnt = d.get("c", "").unwrap();
    fs::write(mnt.join("f"), b"truncated").unwrap();
    d.put("c").unwrap();

    let changes = d.changes("c", "b").unwrap();
    assert!(changes
        .iter()
        .any(|c| c.path == std::path::Path::new("f") && c.kind == overlay2_rs::diff::ChangeKind::Modify));
    assert_eq!(
        fs::read_to_string(d.root().join("diff").join("c").join("f")).unwrap(),
        "truncated"
    );
    assert_eq!(
        fs::read_to_string(d.root().join("diff").join("a").join("f")).unwrap(),
        "from-a"
    );
}

#[test]
fn s3_refcount() {
    if !is_root() {
        eprintln!("skipping s3_refcount: requires CAP_SYS_ADMIN");
        return;
    }
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let d = driver(dir.path());
    d.create("a", "").unwrap();
    d.create("b", "a").unwrap();

    let m1 = d.get("b", "").unwrap();
    let m2 = d.get("b", "").unwrap();
    assert_eq!(m1, m2);

    d.put("b").unwrap();
    d.put("b").unwrap();
}

#[test]
fn s4_tag_store_canonical_form() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repositories.json");
    let store = Store::open(&path).unwrap();

    let entries = [
        ("registry:5000/foobar:HEAD", "sha256:4700"),
        ("registry:5000/foobar:alternate", "sha256:ae30"),
        ("registry:5000/foobar:latest", "sha256:6153"),
        ("registry:5000/foobar:master", "sha256:6c99"),
        ("jess/hollywood:latest", "sha256:ae7a"),
        ("registry@sha256:367e", "sha256:2412"),
        ("busybox:latest", "sha256:91e5"),
    ];
    for (reference, id) in entries {
        store.add(reference, id, false).unwrap();
    }

    let on_disk = fs::read_to_string(&path).unwrap();
    let reloaded: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
    let repos = reloaded.get("Repositories").unwrap().as_object().unwrap();

    let repo_keys: Vec<_> = repos.keys().cloned().collect();
    let mut sorted_repo_keys = repo_keys.clone();
    sorted_repo_keys.sort();
    assert_eq!(repo_keys, sorted_repo_keys, "repo keys must be ascending");

    for refs in repos.values() {
        let refs = refs.as_object().unwrap();
        let keys: Vec<_> = refs.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "reference keys must be ascending within a repo");
    }

    let foobar = &repos["registry:5000/foobar"];
    assert_eq!(foobar["registry:5000/foobar:HEAD"], "sha256:4700");
    assert_eq!(foobar["registry:5000/foobar:latest"], "sha256:6153");
    assert_eq!(repos["busybox"]["busybox:latest"], "sha256:91e5");
    assert_eq!(
        repos["registry"]["registry@sha256:367e"],
        "sha256:2412"
    );
}

#[test]
fn s5_tag_store_conflict_then_force() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("repositories.json")).unwrap();
    store
        .add("registry:5000/foobar:latest", "sha256:6153", false)
        .unwrap();

    let err = store
        .add("registry:5000/foobar:latest", "sha256:newnew", false)
        .unwrap_err();
    match err {
        Error::Conflict(msg) => assert!(msg.starts_with("tag")),
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert!(err_to_string_starts_with_conflict(&store));

    store
        .add("registry:5000/foobar:latest", "sha256:newnew", true)
        .unwrap();
    assert_eq!(
        store.get("registry:5000/foobar:latest").unwrap(),
        "sha256:newnew"
    );
}

fn err_to_string_starts_with_conflict(store: &Store) -> bool {
    let err = store
        .add("registry:5000/foobar:latest", "sha256:yet-another", false)
        .unwrap_err();
    err.to_string().starts_with("Conflict:")
}

#[test]
fn s6_tag_store_bare_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("repositories.json")).unwrap();
    store.add("user/repo", "id1", false).unwrap();
    assert_eq!(store.get("user/repo").unwrap(), "id1");
    assert_eq!(store.get("user/repo:latest").unwrap(), "id1");
}
