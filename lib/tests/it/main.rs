//! Integration tests for treestore-lib.

use std::collections::BTreeSet;

use anyhow::Result;
use similar_asserts::assert_eq as assert_similar;

use treestore_lib::checksum::Checksum;
use treestore_lib::delta::{
    self, apply_delta_from_path, generate_delta, ApplyOptions, DeltaGenerateOptions,
};
use treestore_lib::objects::{DirTree, TreeFile};
use treestore_lib::prune::{prune, PruneOptions};
use treestore_lib::pull::{pull_local, PullOptions};
use treestore_lib::sign::generate_ed25519_keypair;
use treestore_lib::traversal::{traverse_commit, TraverseOptions};
use treestore_lib::{is_not_found, Error, ObjectName, ObjectType};

mod fixture;
use fixture::{Fixture, TIMESTAMP};

fn assert_err_contains<T: std::fmt::Debug>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().expect("expecting an error"));
    if !msg.contains(s) {
        panic!(r#"error message "{msg}" did not contain "{s}""#);
    }
}

/// Scenario: commit a two-file tree and inspect the resulting forest.
#[test]
fn test_commit_two_file_tree() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"hello\n", 0o644)?;
    fixture.write_symlink("tree", "b", "a")?;
    let commit = fixture.commit_src("tree", "main", TIMESTAMP)?;

    let objects = fixture.srcrepo.list_objects()?;
    let count = |t: ObjectType| objects.iter().filter(|o| o.objtype == t).count();
    assert_eq!(count(ObjectType::File), 2);
    assert_eq!(count(ObjectType::DirTree), 1);
    assert_eq!(count(ObjectType::DirMeta), 1);
    assert_eq!(count(ObjectType::Commit), 1);

    // The commit's root contents checksum is the hash of the canonical
    // dirtree record.
    let c = fixture.srcrepo.load_commit(&commit)?;
    let tree = fixture.srcrepo.load_dirtree(&c.root_tree)?;
    assert_eq!(tree.checksum()?, c.root_tree);
    assert_eq!(tree.files.len(), 2);
    assert_eq!(tree.files[0].name, "a");
    assert_eq!(tree.files[1].name, "b");

    let refs = fixture.srcrepo.list_refs(None)?;
    assert_eq!(refs.len(), 1);
    assert_eq!(refs.get("main").map(String::as_str), Some(commit.to_hex().as_str()));

    // Content round-trips.
    let (header, content) = fixture.srcrepo.load_file(&tree.files[0].checksum)?;
    assert_eq!(content, b"hello\n");
    assert_eq!(header.mode & 0o7777, 0o644);
    assert_eq!((header.uid, header.gid), (0, 0));
    let (link_header, link_content) = fixture.srcrepo.load_file(&tree.files[1].checksum)?;
    assert!(link_header.is_symlink());
    assert_eq!(link_header.symlink_target, "a");
    assert!(link_content.is_empty());

    // And the whole repository passes fsck.
    let report = treestore_lib::fsck::fsck(&fixture.srcrepo, None)?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

/// Scenario: recommitting the identical tree changes the commit
/// checksum but not the content checksum.
#[test]
fn test_content_checksum_across_recommit() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"data", 0o644)?;
    let c1 = fixture.commit_src_with_subject("tree", "main", 1_700_000_000, "one")?;
    let c2 = fixture.commit_src_with_subject("tree", "main", 1_700_000_100, "two")?;
    assert_ne!(c1, c2);
    let commit1 = fixture.srcrepo.load_commit(&c1)?;
    let commit2 = fixture.srcrepo.load_commit(&c2)?;
    assert_eq!(commit1.content_checksum()?, commit2.content_checksum()?);
    // The second commit has the first as parent.
    assert_eq!(commit2.parent, Some(c1));
    Ok(())
}

/// Scenario: a dirtree containing a path-traversal name is rejected as
/// corrupted.
#[test]
fn test_invalid_dirtree_rejected() {
    let tree = DirTree {
        files: vec![TreeFile {
            name: "../x".into(),
            checksum: Checksum::new([7; 32]),
        }],
        dirs: vec![],
    };
    let bytes = tree.to_bytes();
    let err = DirTree::parse(&bytes).err().expect("parse must fail");
    let msg = format!("{err:#}");
    assert!(msg.contains("Invalid filename"), "{msg}");
    let e = err.downcast_ref::<Error>().expect("typed error");
    assert!(matches!(e, Error::Corrupted(_)));
}

fn write_zeros_tree(fixture: &Fixture, tree: &str, mutated: bool) -> Result<()> {
    let mut contents = vec![0u8; 1024 * 1024];
    if mutated {
        for b in contents[10..20].iter_mut() {
            *b = 0xff;
        }
    }
    let _ = fixture.treedir(tree)?;
    fixture.write_file(tree, "a", &contents, 0o644)?;
    Ok(())
}

/// Scenario: delta round-trip between two commits differing by a small
/// in-place edit; the changed file travels as rollsum copy runs.
#[test]
fn test_static_delta_roundtrip() -> Result<()> {
    let fixture = Fixture::new()?;
    write_zeros_tree(&fixture, "t1", false)?;
    write_zeros_tree(&fixture, "t2", true)?;
    let from = fixture.commit_src("t1", "main", TIMESTAMP)?;
    // Seed the destination with the source commit before it is
    // superseded.
    let _ = pull_local(
        &fixture.destrepo,
        &fixture.path.join("src/repo"),
        &["main".to_string()],
        &PullOptions::flat(),
        None,
    )?;
    let to = fixture.commit_src("t2", "main", TIMESTAMP + 10)?;

    let options = DeltaGenerateOptions {
        timestamp: Some(TIMESTAMP + 20),
        ..Default::default()
    };
    let superblock = generate_delta(&fixture.srcrepo, Some(&from), &to, &options, None)?;
    assert_eq!(superblock.from, Some(from));
    assert_eq!(superblock.to, to);
    assert_eq!(superblock.parts.len(), 1);
    // The changed megabyte travels as copy runs, not as payload: the
    // compressed part must be far smaller than the file.
    assert!(superblock.parts[0].compressed_size < 64 * 1024);
    assert!(superblock.fallbacks.is_empty());

    // The delta index records the new pair.
    let index = delta::read_delta_index(&fixture.srcrepo, &to)?;
    assert_eq!(index, vec![(Some(from), to)]);

    let delta_dir = fixture
        .path
        .join("src/repo")
        .join(delta::delta_relpath(Some(&from), &to));
    let stats = apply_delta_from_path(&fixture.destrepo, &delta_dir, &ApplyOptions::default(), None)?;
    assert_eq!(stats.parts_applied, 1);
    assert!(stats.parts_failed.is_empty());

    // The destination now holds the complete target commit.
    assert!(!fixture.destrepo.commit_is_partial(&to)?);
    let dest_commit = fixture.destrepo.load_commit(&to)?;
    let src_commit = fixture.srcrepo.load_commit(&to)?;
    assert_eq!(dest_commit, src_commit);
    let tree = fixture.destrepo.load_dirtree(&dest_commit.root_tree)?;
    let content = fixture.destrepo.load_file_content(&tree.files[0].checksum)?;
    assert_eq!(content.len(), 1024 * 1024);
    assert_eq!(&content[10..20], &[0xff; 10]);
    assert_eq!(&content[..10], &[0u8; 10]);
    Ok(())
}

/// Scenario: an opcode whose length exceeds the payload bounds fails
/// with `InvalidDelta` at opcode index 0, leaving no staged writes.
#[test]
fn test_delta_bound_violation() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"x", 0o644)?;
    let to = fixture.commit_src("tree", "main", TIMESTAMP)?;
    let commit = fixture.srcrepo.load_commit(&to)?;
    let meta_bytes = fixture
        .srcrepo
        .load_metadata(&ObjectName::new(commit.root_meta, ObjectType::DirMeta))?;

    // Hand-assemble a one-part delta whose splice claims one byte more
    // than the payload holds.
    let mut evil = treestore_lib::delta::test_support::PartAssembler::new(meta_bytes.clone());
    evil.splice_meta(
        ObjectName::new(commit.root_meta, ObjectType::DirMeta),
        meta_bytes.len() as u64 + 1,
        0,
    );
    let (part_bytes, header) = evil.finish()?;
    let superblock = treestore_lib::delta::Superblock {
        metadata: Default::default(),
        timestamp: TIMESTAMP,
        from: None,
        to,
        commit,
        detached_metadata: None,
        parts: vec![header],
        fallbacks: vec![],
        endianness: Default::default(),
    };
    let delta_dir = fixture.path.join("evil-delta");
    std::fs::create_dir(&delta_dir)?;
    std::fs::write(delta_dir.join("superblock"), superblock.serialize()?)?;
    std::fs::write(delta_dir.join("0"), part_bytes)?;

    let opts = ApplyOptions {
        strict: true,
        ..Default::default()
    };
    let r = apply_delta_from_path(&fixture.destrepo, &delta_dir, &opts, None);
    let err = r.err().expect("apply must fail");
    let msg = format!("{err:#}");
    assert!(msg.contains("opcode index 0"), "{msg}");
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::InvalidDelta(_))),
        "{msg}"
    );

    // No staging directories survive the failure.
    let staging: Vec<_> = std::fs::read_dir(fixture.path.join("dest/repo/tmp"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("staging-"))
        .collect();
    assert!(staging.is_empty(), "{staging:?}");
    Ok(())
}

/// Scenario: pruning after dropping refs removes exactly the orphaned
/// closure, and pruning is idempotent.
#[test]
fn test_prune_unreferenced_commits() -> Result<()> {
    let fixture = Fixture::new()?;
    // Two commits sharing most content.
    let _ = fixture.treedir("t1")?;
    for i in 0..10 {
        fixture.write_file("t1", &format!("file{i}"), format!("data{i}").as_bytes(), 0o644)?;
    }
    let c1 = fixture.commit_src("t1", "old", TIMESTAMP)?;
    let _ = fixture.treedir("t2")?;
    for i in 0..10 {
        fixture.write_file("t2", &format!("file{i}"), format!("data{i}").as_bytes(), 0o644)?;
    }
    fixture.write_file("t2", "extra", b"only in c2", 0o644)?;
    let c2 = fixture.commit_src("t2", "scratch", TIMESTAMP + 1)?;
    // Detach c2 from any ref.
    fixture.srcrepo.set_ref("scratch", None)?;

    let refs_only = PruneOptions {
        refs_only: true,
        ..Default::default()
    };
    let stats = prune(&fixture.srcrepo, &refs_only, None)?;
    assert!(stats.objects_pruned > 0);
    // c1's closure survives; c2 and its unique objects are gone.
    assert!(fixture
        .srcrepo
        .has_object(&ObjectName::new(c1, ObjectType::Commit))?);
    assert!(!fixture
        .srcrepo
        .has_object(&ObjectName::new(c2, ObjectType::Commit))?);
    let reachable = traverse_commit(
        &fixture.srcrepo,
        &c1,
        &TraverseOptions::default(),
        None,
    )?;
    let existing: BTreeSet<ObjectName> = fixture.srcrepo.list_objects()?;
    assert_similar!(reachable, existing);

    // Idempotence: a second run frees nothing.
    let stats = prune(&fixture.srcrepo, &refs_only, None)?;
    assert_eq!(stats.objects_pruned, 0);
    assert_eq!(stats.bytes_freed, 0);

    // Dropping the last ref empties the repository.
    fixture.srcrepo.set_ref("old", None)?;
    let _ = prune(&fixture.srcrepo, &refs_only, None)?;
    assert!(fixture.srcrepo.list_objects()?.is_empty());
    Ok(())
}

/// Reachability is monotone in the parent-chain depth.
#[test]
fn test_reachability_monotone() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("t1")?;
    fixture.write_file("t1", "a", b"v1", 0o644)?;
    let _ = fixture.commit_src("t1", "main", TIMESTAMP)?;
    fixture.write_file("t1", "a", b"v2", 0o644)?;
    let _ = fixture.commit_src("t1", "main", TIMESTAMP + 1)?;
    fixture.write_file("t1", "a", b"v3", 0o644)?;
    let head = fixture.commit_src("t1", "main", TIMESTAMP + 2)?;

    let at = |depth: i32| -> Result<BTreeSet<ObjectName>> {
        traverse_commit(
            &fixture.srcrepo,
            &head,
            &TraverseOptions {
                maxdepth: depth,
                commit_only: false,
            },
            None,
        )
    };
    let d0 = at(0)?;
    let d1 = at(1)?;
    let unbounded = at(-1)?;
    assert!(d0.is_subset(&d1));
    assert!(d1.is_subset(&unbounded));
    assert!(d0.len() < unbounded.len());
    assert_eq!(
        unbounded
            .iter()
            .filter(|o| o.objtype == ObjectType::Commit)
            .count(),
        3
    );
    Ok(())
}

/// A partial commit's traversal tolerates missing dirtrees and returns
/// the largest reachable subset.
#[test]
fn test_partial_commit_tolerance() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("t1")?;
    fixture.write_file("t1", "sub/inner", b"nested", 0o644)?;
    fixture.write_file("t1", "top", b"top", 0o644)?;
    let commit = fixture.commit_src("t1", "main", TIMESTAMP)?;

    // Remove the subdirectory's dirtree object.
    let c = fixture.srcrepo.load_commit(&commit)?;
    let root = fixture.srcrepo.load_dirtree(&c.root_tree)?;
    let sub_tree = root.dirs[0].tree_checksum;
    let subtree_name = ObjectName::new(sub_tree, ObjectType::DirTree);

    // Without the partial marker, traversal errors.
    fixture.srcrepo.delete_object(&subtree_name)?;
    let r = traverse_commit(&fixture.srcrepo, &commit, &TraverseOptions::default(), None);
    assert!(is_not_found(&r.err().expect("must fail")));

    // With it, the subtree is silently skipped.
    fixture.srcrepo.set_commit_partial(&commit, true)?;
    assert!(fixture.srcrepo.commit_is_partial(&commit)?);
    let reachable =
        traverse_commit(&fixture.srcrepo, &commit, &TraverseOptions::default(), None)?;
    assert!(reachable.contains(&ObjectName::new(commit, ObjectType::Commit)));
    assert!(!reachable.contains(&subtree_name));
    // Prune of the partial repository succeeds.
    let _ = prune(&fixture.srcrepo, &PruneOptions::default(), None)?;
    Ok(())
}

/// Signed envelopes bind the exact superblock bytes.
#[test]
fn test_signed_delta() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"signed content", 0o644)?;
    let to = fixture.commit_src("tree", "main", TIMESTAMP)?;

    let (public, secret) = generate_ed25519_keypair()?;
    let options = DeltaGenerateOptions {
        sign_key: Some(secret),
        timestamp: Some(TIMESTAMP),
        ..Default::default()
    };
    let _ = generate_delta(&fixture.srcrepo, None, &to, &options, None)?;
    let delta_dir = fixture
        .path
        .join("src/repo")
        .join(delta::delta_relpath(None, &to));

    // Valid signature, trusted key: applies.
    let trusted = ApplyOptions {
        trusted_keys: vec![public.clone()],
        ..Default::default()
    };
    let stats = apply_delta_from_path(&fixture.destrepo, &delta_dir, &trusted, None)?;
    assert!(stats.parts_failed.is_empty());
    assert!(fixture
        .destrepo
        .has_object(&ObjectName::new(to, ObjectType::Commit))?);

    // A different trusted key rejects.
    let (other_public, _) = generate_ed25519_keypair()?;
    let wrong = ApplyOptions {
        trusted_keys: vec![other_public],
        ..Default::default()
    };
    let r = apply_delta_from_path(&fixture.destrepo, &delta_dir, &wrong, None);
    assert!(matches!(
        r.err().and_then(|e| e.downcast::<Error>().ok()),
        Some(Error::SignatureInvalid(_))
    ));

    // Flipping one byte of the wrapped superblock invalidates all
    // signatures.
    let sb_path = delta_dir.join("superblock");
    let mut raw = std::fs::read(&sb_path)?;
    let mid = raw.len() / 2;
    raw[mid] ^= 1;
    std::fs::write(&sb_path, raw)?;
    let r = apply_delta_from_path(&fixture.destrepo, &delta_dir, &trusted, None);
    assert!(matches!(
        r.err().and_then(|e| e.downcast::<Error>().ok()),
        Some(Error::SignatureInvalid(_))
    ));
    Ok(())
}

/// Local pull into a remote namespace plus checkout.
#[test]
fn test_pull_and_checkout() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "bin/app", b"#!/bin/sh\necho hi\n", 0o755)?;
    fixture.write_file("tree", "share/doc/README", b"docs", 0o644)?;
    fixture.write_symlink("tree", "app", "bin/app")?;
    let commit = fixture.commit_src("tree", "main", TIMESTAMP)?;

    let options = PullOptions {
        depth: 0,
        remote: Some("origin".to_string()),
    };
    let pulled = pull_local(
        &fixture.destrepo,
        &fixture.path.join("src/repo"),
        &["main".to_string()],
        &options,
        None,
    )?;
    assert_eq!(pulled, vec![commit]);
    let refs = fixture.destrepo.list_refs(Some("origin:"))?;
    assert_eq!(refs.get("main").map(String::as_str), Some(commit.to_hex().as_str()));

    // Everything arrived.
    let reachable = traverse_commit(
        &fixture.destrepo,
        &commit,
        &TraverseOptions::default(),
        None,
    )?;
    for obj in &reachable {
        assert!(fixture.destrepo.has_object(obj)?, "missing {obj}");
    }

    // Check out and compare.
    let target = fixture.path.join("co");
    fixture.destrepo.checkout_commit(
        &commit,
        &target,
        &treestore_lib::repo::CheckoutOptions {
            restore_ownership: false,
        },
        None,
    )?;
    assert_eq!(std::fs::read(target.join("bin/app"))?, b"#!/bin/sh\necho hi\n");
    assert_eq!(std::fs::read(target.join("share/doc/README"))?, b"docs");
    let link = std::fs::read_link(target.join("app"))?;
    assert_eq!(link, std::path::PathBuf::from("bin/app"));
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(target.join("bin/app"))?.permissions().mode();
    assert_eq!(mode & 0o7777, 0o755);
    Ok(())
}

/// Refspec-addressed refs, exclusive creation, and deletion.
#[test]
fn test_ref_store() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"x", 0o644)?;
    let commit = fixture.commit_src("tree", "exampleos/x86_64/standard", TIMESTAMP)?;

    let refs = fixture.srcrepo.list_refs(None)?;
    assert_eq!(refs.len(), 1);
    assert!(refs.contains_key("exampleos/x86_64/standard"));

    // Exclusive creation collides.
    let r = fixture.srcrepo.create_ref("exampleos/x86_64/standard", &commit);
    assert!(matches!(
        r.err().and_then(|e| e.downcast::<Error>().ok()),
        Some(Error::AlreadyExists(_))
    ));
    fixture.srcrepo.create_ref("other", &commit)?;

    // A ref may not point at a missing commit.
    let bogus = Checksum::new([0xab; 32]);
    assert!(is_not_found(
        &fixture
            .srcrepo
            .set_ref("dangling", Some(&bogus))
            .err()
            .expect("must fail")
    ));

    // Invalid names are rejected before touching the filesystem.
    assert!(fixture.srcrepo.set_ref("../escape", Some(&commit)).is_err());
    assert!(fixture.srcrepo.set_ref("a//b", Some(&commit)).is_err());

    fixture.srcrepo.set_ref("other", None)?;
    assert!(fixture.srcrepo.try_resolve_ref("other")?.is_none());
    Ok(())
}

/// Collection-scoped mirror refs keep objects alive through prune.
#[test]
fn test_collection_refs() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"collection data", 0o644)?;
    let commit = fixture.commit_src("tree", "main", TIMESTAMP)?;
    fixture
        .srcrepo
        .set_collection_ref("org.example.Os", "main", Some(&commit))?;
    fixture.srcrepo.set_ref("main", None)?;

    let refs_only = PruneOptions {
        refs_only: true,
        ..Default::default()
    };
    let stats = prune(&fixture.srcrepo, &refs_only, None)?;
    assert_eq!(stats.objects_pruned, 0);
    assert!(fixture
        .srcrepo
        .has_object(&ObjectName::new(commit, ObjectType::Commit))?);
    Ok(())
}

/// Detached metadata is mutable and not part of the commit hash.
#[test]
fn test_detached_metadata() -> Result<()> {
    use treestore_lib::Value;
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"x", 0o644)?;
    let commit = fixture.commit_src("tree", "main", TIMESTAMP)?;

    assert!(fixture
        .srcrepo
        .read_commit_detached_metadata(&commit)?
        .is_none());
    let mut meta = std::collections::BTreeMap::new();
    meta.insert("signature".to_string(), Value::Bytes(vec![1, 2, 3]));
    fixture
        .srcrepo
        .write_commit_detached_metadata(&commit, Some(&meta))?;
    assert_eq!(
        fixture.srcrepo.read_commit_detached_metadata(&commit)?,
        Some(meta)
    );
    // Updating detached metadata does not change the commit checksum.
    assert!(fixture
        .srcrepo
        .has_object(&ObjectName::new(commit, ObjectType::Commit))?);
    fixture
        .srcrepo
        .write_commit_detached_metadata(&commit, None)?;
    assert!(fixture
        .srcrepo
        .read_commit_detached_metadata(&commit)?
        .is_none());
    Ok(())
}

/// Commit deletion leaves a tombstone when configured.
#[test]
fn test_tombstone_commits() -> Result<()> {
    let fixture = Fixture::new()?;
    // Flip the config knob and reopen.
    let config_path = fixture.path.join("src/repo/config");
    let mut config = std::fs::read_to_string(&config_path)?;
    config.push_str("tombstone-commits=true\n");
    std::fs::write(&config_path, config)?;
    let repo = treestore_lib::Repo::open(&fixture.path.join("src/repo"))?;
    assert!(repo.config().tombstone_commits);

    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"doomed", 0o644)?;
    let commit = fixture.commit_src("tree", "main", TIMESTAMP)?;
    repo.set_ref("main", None)?;
    repo.delete_commit(&commit)?;
    assert!(!repo.has_object(&ObjectName::new(commit, ObjectType::Commit))?);
    let tombstone = ObjectName::new(commit, ObjectType::TombstoneCommit);
    assert!(repo.has_object(&tombstone)?);
    // Prune keeps tombstones.
    let _ = prune(&repo, &PruneOptions::default(), None)?;
    assert!(repo.has_object(&tombstone)?);
    Ok(())
}

/// Identical payloads under different metadata produce a payload link
/// when the threshold is configured, and prune applies the
/// link-liveness rule.
#[test]
fn test_payload_links() -> Result<()> {
    let fixture = Fixture::new()?;
    let config_path = fixture.path.join("dest/repo/config");
    let mut config = std::fs::read_to_string(&config_path)?;
    config.push_str("payload-link-threshold=1\n");
    std::fs::write(&config_path, config)?;
    let repo = treestore_lib::Repo::open(&fixture.path.join("dest/repo"))?;

    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "one", b"shared payload bytes", 0o644)?;
    fixture.write_file("tree", "two", b"shared payload bytes", 0o755)?;
    let options = treestore_lib::commit::CommitOptions {
        subject: "links".into(),
        timestamp: Some(TIMESTAMP),
        owner_uid: Some(0),
        owner_gid: Some(0),
        ..Default::default()
    };
    let commit =
        treestore_lib::commit::commit_filesystem(&repo, &fixture.path.join("tree"), &options, None)?;
    repo.set_ref("main", Some(&commit))?;

    let links: Vec<_> = repo
        .list_objects()?
        .into_iter()
        .filter(|o| o.objtype == ObjectType::PayloadLink)
        .collect();
    assert_eq!(links.len(), 1);

    // The target is reachable and above the threshold, so the link
    // survives a prune.
    let _ = prune(&repo, &PruneOptions::default(), None)?;
    assert!(repo.has_object(&links[0])?);

    // Once nothing is reachable, the link goes too.
    repo.set_ref("main", None)?;
    let _ = prune(
        &repo,
        &PruneOptions {
            refs_only: true,
            ..Default::default()
        },
        None,
    )?;
    assert!(repo.list_objects()?.is_empty());
    Ok(())
}

/// The free-space guard refuses transactions under the threshold.
#[test]
fn test_min_free_space() -> Result<()> {
    let fixture = Fixture::new()?;
    let config_path = fixture.path.join("src/repo/config");
    let mut config = std::fs::read_to_string(&config_path)?;
    config.push_str("min-free-space-size=1000TB\n");
    std::fs::write(&config_path, config)?;
    let repo = treestore_lib::Repo::open(&fixture.path.join("src/repo"))?;
    let r = repo.prepare_transaction(None);
    assert_err_contains(r, "min-free-space");
    Ok(())
}

/// Remote configuration: add, list, reject reserved names, remove with
/// cache cleanup.
#[test]
fn test_remotes() -> Result<()> {
    let fixture = Fixture::new()?;
    let repo = &fixture.srcrepo;
    repo.add_remote("origin", "file:///srv/repo", false)?;
    assert_err_contains(
        repo.add_remote("origin", "file:///other", false),
        "already exists",
    );
    // Reserved suffix, undefined summary-cache behavior otherwise.
    assert_err_contains(
        repo.add_remote("tricky.sig", "file:///x", false),
        ".sig",
    );
    let remotes = repo.list_remotes()?;
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].name, "origin");
    assert_eq!(remotes[0].url, "file:///srv/repo");
    assert!(!remotes[0].gpg_verify);

    // Summary-cache entries for removed remotes are cleaned up.
    std::fs::create_dir_all(fixture.path.join("src/repo/tmp/cache/summaries"))?;
    std::fs::write(fixture.path.join("src/repo/tmp/cache/summaries/origin"), b"s")?;
    std::fs::write(
        fixture.path.join("src/repo/tmp/cache/summaries/origin.sig"),
        b"g",
    )?;
    repo.remove_remote("origin")?;
    assert!(repo.list_remotes()?.is_empty());
    assert!(!fixture
        .path
        .join("src/repo/tmp/cache/summaries/origin")
        .exists());
    assert!(!fixture
        .path
        .join("src/repo/tmp/cache/summaries/origin.sig")
        .exists());
    assert!(is_not_found(
        &repo.get_remote("origin").err().expect("must fail")
    ));
    Ok(())
}

/// The stale summary cache of an unknown remote is collected by prune.
#[test]
fn test_prune_summary_cache() -> Result<()> {
    let fixture = Fixture::new()?;
    std::fs::create_dir_all(fixture.path.join("src/repo/tmp/cache/summaries"))?;
    let stale = fixture.path.join("src/repo/tmp/cache/summaries/gone");
    std::fs::write(&stale, b"stale")?;
    let _ = prune(&fixture.srcrepo, &PruneOptions::default(), None)?;
    assert!(!stale.exists());
    Ok(())
}

/// Deltas whose target commit was pruned are collected too.
#[test]
fn test_prune_stale_deltas() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"delta target", 0o644)?;
    let to = fixture.commit_src("tree", "main", TIMESTAMP)?;
    let _ = generate_delta(
        &fixture.srcrepo,
        None,
        &to,
        &DeltaGenerateOptions {
            timestamp: Some(TIMESTAMP),
            ..Default::default()
        },
        None,
    )?;
    let delta_dir = fixture
        .path
        .join("src/repo")
        .join(delta::delta_relpath(None, &to));
    assert!(delta_dir.join("superblock").exists());

    fixture.srcrepo.set_ref("main", None)?;
    let stats = prune(
        &fixture.srcrepo,
        &PruneOptions {
            refs_only: true,
            ..Default::default()
        },
        None,
    )?;
    assert!(stats.bytes_freed > 0);
    assert!(!delta_dir.exists());
    assert!(delta::read_delta_index(&fixture.srcrepo, &to)?.is_empty());
    Ok(())
}

/// Inline-parts deltas carry their part bodies inside the superblock.
#[test]
fn test_inline_delta() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"inline me", 0o644)?;
    let to = fixture.commit_src("tree", "main", TIMESTAMP)?;
    let options = DeltaGenerateOptions {
        inline_parts: true,
        timestamp: Some(TIMESTAMP),
        ..Default::default()
    };
    let superblock = generate_delta(&fixture.srcrepo, None, &to, &options, None)?;
    assert_eq!(superblock.parts.len(), 1);
    let delta_dir = fixture
        .path
        .join("src/repo")
        .join(delta::delta_relpath(None, &to));
    assert!(!delta_dir.join("0").exists());
    let stats = apply_delta_from_path(&fixture.destrepo, &delta_dir, &ApplyOptions::default(), None)?;
    assert_eq!(stats.parts_applied, 1);
    assert!(fixture
        .destrepo
        .has_object(&ObjectName::new(to, ObjectType::Commit))?);
    Ok(())
}

/// Stats-only application validates the stream without writing.
#[test]
fn test_delta_stats_only() -> Result<()> {
    let fixture = Fixture::new()?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "a", b"do not write me", 0o644)?;
    let to = fixture.commit_src("tree", "main", TIMESTAMP)?;
    let _ = generate_delta(
        &fixture.srcrepo,
        None,
        &to,
        &DeltaGenerateOptions {
            timestamp: Some(TIMESTAMP),
            ..Default::default()
        },
        None,
    )?;
    let delta_dir = fixture
        .path
        .join("src/repo")
        .join(delta::delta_relpath(None, &to));
    let options = ApplyOptions {
        stats_only: true,
        ..Default::default()
    };
    let stats = apply_delta_from_path(&fixture.destrepo, &delta_dir, &options, None)?;
    assert_eq!(stats.parts_applied, 1);
    assert!(stats.objects_written > 0);
    // Nothing was actually created.
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

/// Determinism: identical inputs and options reproduce the superblock
/// bit for bit.
#[test]
fn test_delta_determinism() -> Result<()> {
    let fixture = Fixture::new()?;
    write_zeros_tree(&fixture, "t1", false)?;
    write_zeros_tree(&fixture, "t2", true)?;
    let from = fixture.commit_src("t1", "main", TIMESTAMP)?;
    let to = fixture.commit_src("t2", "main", TIMESTAMP + 10)?;
    let options = DeltaGenerateOptions {
        timestamp: Some(TIMESTAMP + 20),
        ..Default::default()
    };
    let sb1 = generate_delta(&fixture.srcrepo, Some(&from), &to, &options, None)?;
    let sb2 = generate_delta(&fixture.srcrepo, Some(&from), &to, &options, None)?;
    assert_eq!(sb1.serialize()?, sb2.serialize()?);
    Ok(())
}

/// CLI smoke test: init, commit, refs, log, show over the real binary
/// surface.
#[tokio::test]
async fn test_cli_surface() -> Result<()> {
    let fixture = Fixture::new()?;
    let repo_path = fixture.path.join("cli-repo");
    std::fs::create_dir(&repo_path)?;
    let _ = fixture.treedir("tree")?;
    fixture.write_file("tree", "hello", b"world\n", 0o644)?;

    let run = |args: Vec<String>| treestore_lib::cli::run_from_iter(args);
    let repo_arg = format!("--repo={repo_path}");
    run(vec![
        "treestore".into(),
        "init".into(),
        repo_arg.clone(),
        "--mode=archive".into(),
    ])
    .await?;
    run(vec![
        "treestore".into(),
        "commit".into(),
        repo_arg.clone(),
        "-b".into(),
        "main".into(),
        "-s".into(),
        "first".into(),
        "--owner-uid=0".into(),
        "--owner-gid=0".into(),
        format!("--timestamp={TIMESTAMP}"),
        fixture.path.join("tree").to_string(),
    ])
    .await?;
    run(vec!["treestore".into(), "fsck".into(), repo_arg.clone()]).await?;
    run(vec!["treestore".into(), "log".into(), repo_arg.clone(), "main".into()]).await?;
    run(vec!["treestore".into(), "show".into(), repo_arg.clone(), "main".into()]).await?;
    run(vec![
        "treestore".into(),
        "static-delta".into(),
        "generate".into(),
        repo_arg.clone(),
        "--to=main".into(),
    ])
    .await?;
    run(vec![
        "treestore".into(),
        "static-delta".into(),
        "list".into(),
        repo_arg.clone(),
    ])
    .await?;
    // Missing objects surface the distinguished exit code.
    let err = run(vec![
        "treestore".into(),
        "show".into(),
        repo_arg.clone(),
        "nosuchref".into(),
    ])
    .await
    .err()
    .expect("must fail");
    assert_eq!(treestore_lib::cli::exit_code_for_error(&err), 77);
    Ok(())
}
