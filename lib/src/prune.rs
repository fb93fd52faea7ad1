//! The prune engine: computing the reachable set and deleting
//! everything else.

use std::collections::BTreeSet;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::delta;
use crate::objects::{ObjectName, ObjectType};
use crate::repo::{Repo, SUMMARY_CACHE};
use crate::traversal::{traverse_commits_union, TraverseOptions};
use crate::util::{check_cancelled, Cancellable};
use crate::Result;

/// Options for [`prune`].
#[derive(Debug, Clone, Copy)]
pub struct PruneOptions {
    /// Dry run: compute and tally, delete nothing.
    pub no_prune: bool,
    /// Only commits named by a ref are roots; otherwise every commit
    /// object present is a root.
    pub refs_only: bool,
    /// Only traverse commit objects, not their content.
    pub commit_only: bool,
    /// Parent-chain depth to keep; −1 is unbounded.
    pub depth: i32,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            no_prune: false,
            refs_only: false,
            commit_only: false,
            depth: -1,
        }
    }
}

/// Totals reported by [`prune`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PruneStats {
    /// Loose objects examined.
    pub objects_total: u64,
    /// Objects deleted (or that would be, in a dry run).
    pub objects_pruned: u64,
    /// Bytes freed (or that would be).
    pub bytes_freed: u64,
}

fn ref_targets(repo: &Repo) -> Result<Vec<Checksum>> {
    let mut out = Vec::new();
    for base in ["refs/heads", "refs/remotes", "refs/mirrors"] {
        let mut refs = std::collections::BTreeMap::new();
        repo.list_refs_in_base(Utf8Path::new(base), &mut refs)?;
        for target in refs.values() {
            out.push(Checksum::from_hex(target).context("Parsing ref target")?);
        }
    }
    Ok(out)
}

/// Delete loose objects not reachable from the configured roots.
#[context("Pruning repository")]
pub fn prune(
    repo: &Repo,
    options: &PruneOptions,
    cancellable: Option<&Cancellable>,
) -> Result<PruneStats> {
    let _lock = repo.lock_exclusive()?;
    let all_objects = repo.list_objects()?;

    let roots: Vec<Checksum> = if options.refs_only {
        ref_targets(repo)?
    } else {
        all_objects
            .iter()
            .filter(|o| o.objtype == ObjectType::Commit)
            .map(|o| o.checksum)
            .collect()
    };
    let topts = TraverseOptions {
        maxdepth: options.depth,
        commit_only: options.commit_only,
    };
    let mut reachable = traverse_commits_union(repo, roots, &topts, cancellable)?;

    // Xattr sidecar objects are reachable through their file object.
    for obj in all_objects.iter() {
        if obj.objtype == ObjectType::FileXattrsLink
            && reachable.contains(&ObjectName::new(obj.checksum, ObjectType::File))
        {
            let _ = reachable.insert(*obj);
            if let Ok(target) = resolve_link_checksum(repo, obj) {
                let _ = reachable.insert(ObjectName::new(target, ObjectType::FileXattrs));
            }
        }
    }

    let mut stats = PruneStats {
        objects_total: all_objects.len() as u64,
        ..Default::default()
    };
    for obj in all_objects.iter() {
        check_cancelled(cancellable, "prune")?;
        if reachable.contains(obj) {
            continue;
        }
        match obj.objtype {
            // Tombstones outlive their commit.
            ObjectType::TombstoneCommit => continue,
            ObjectType::PayloadLink => {
                if payload_link_is_live(repo, obj, &reachable)? {
                    continue;
                }
            }
            _ => {}
        }
        // Query the size before unlinking so accounting stays accurate.
        let size = repo.object_size(obj)?;
        stats.objects_pruned += 1;
        stats.bytes_freed += size;
        if options.no_prune {
            continue;
        }
        if obj.objtype == ObjectType::Commit {
            repo.set_commit_partial(&obj.checksum, false)?;
        }
        repo.delete_object(obj)?;
        debug!("Pruned {obj}");
    }

    if !options.no_prune {
        stats.bytes_freed += prune_static_deltas(repo, None, cancellable)?;
        prune_summary_cache(repo)?;
    }
    Ok(stats)
}

fn resolve_link_checksum(repo: &Repo, link: &ObjectName) -> Result<Checksum> {
    let path = repo.object_relpath(link);
    let target = repo.dir().read_link(&path)?;
    let target = Utf8PathBuf::try_from(target).context("Non-UTF-8 link target")?;
    let name = target
        .file_name()
        .and_then(|n| n.split_once('.').map(|(stem, _)| stem))
        .ok_or_else(|| anyhow::anyhow!("Invalid link target in {link}"))?;
    let prefix = target
        .parent()
        .and_then(|p| p.file_name())
        .ok_or_else(|| anyhow::anyhow!("Invalid link target in {link}"))?;
    Checksum::from_hex(&format!("{prefix}{name}"))
}

/// A payload link is kept iff its target file object is reachable and
/// large enough to be worth deduplicating.  Note the consequence: a
/// link to a small reachable object is still deleted.
fn payload_link_is_live(
    repo: &Repo,
    link: &ObjectName,
    reachable: &BTreeSet<ObjectName>,
) -> Result<bool> {
    let Some(threshold) = repo.config().payload_link_threshold else {
        return Ok(false);
    };
    let target = match resolve_link_checksum(repo, link) {
        Ok(t) => t,
        Err(_) => return Ok(false),
    };
    let target = ObjectName::new(target, ObjectType::File);
    if !reachable.contains(&target) {
        return Ok(false);
    }
    Ok(repo.object_size(&target)? > threshold)
}

/// Delete static deltas whose target commit no longer exists, or (with
/// `only_commit`) every delta targeting that commit.  Returns bytes
/// freed.
pub fn prune_static_deltas(
    repo: &Repo,
    only_commit: Option<&Checksum>,
    cancellable: Option<&Cancellable>,
) -> Result<u64> {
    let mut freed = 0u64;
    let Some(deltas) = repo.dir().open_dir_optional("deltas")? else {
        return Ok(0);
    };
    let mut doomed: Vec<(Utf8PathBuf, Checksum)> = Vec::new();
    for prefix_entry in deltas.entries()? {
        check_cancelled(cancellable, "delta prune")?;
        let prefix_entry = prefix_entry?;
        if !prefix_entry.file_type()?.is_dir() {
            continue;
        }
        let prefix = prefix_entry.file_name();
        let Some(prefix) = prefix.to_str().map(ToOwned::to_owned) else {
            continue;
        };
        let subdir = prefix_entry.open_dir()?;
        for entry in subdir.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok((_from, to)) = delta::parse_delta_name(&prefix, name) else {
                continue;
            };
            let dead = match only_commit {
                Some(c) => to == *c,
                None => !repo.has_object(&ObjectName::new(to, ObjectType::Commit))?,
            };
            if dead {
                doomed.push((format!("deltas/{prefix}/{name}").into(), to));
            }
        }
    }
    for (relpath, to) in doomed {
        freed += dir_size(repo, &relpath)?;
        repo.dir()
            .remove_dir_all(&relpath)
            .with_context(|| format!("Removing {relpath}"))?;
        debug!("Pruned static delta {relpath}");
        let index = delta::delta_index_relpath(&to);
        if let Some(meta) = repo.dir().symlink_metadata_optional(&index)? {
            freed += meta.len();
            repo.dir().remove_file(&index)?;
        }
    }
    Ok(freed)
}

fn dir_size(repo: &Repo, relpath: &Utf8Path) -> Result<u64> {
    let dir = repo.dir().open_dir(relpath)?;
    let mut total = 0u64;
    for entry in dir.entries()? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Garbage-collect summary-cache entries for remotes that no longer
/// exist.
fn prune_summary_cache(repo: &Repo) -> Result<()> {
    let Some(cache) = repo.dir().open_dir_optional(SUMMARY_CACHE)? else {
        return Ok(());
    };
    let remotes: BTreeSet<String> = repo
        .list_remotes()?
        .into_iter()
        .map(|r| r.name)
        .collect();
    for entry in cache.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // `<remote>` and `<remote>.sig` live side by side; remote names
        // ending in ".sig" are rejected at configuration time, so the
        // trim is unambiguous.
        let remote = name.strip_suffix(".sig").unwrap_or(name);
        if !remotes.contains(remote) {
            cache.remove_file(name)?;
            debug!("Pruned summary cache entry {name}");
        }
    }
    Ok(())
}
