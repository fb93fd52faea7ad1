//! Merkle traversal: computing the reachable object closure of commits.
//!
//! The traversal primitive is an in-place iterator over one dirtree,
//! yielding files first and then subdirectories; consumers push
//! subdirectory tree checksums onto a work queue to recurse.  Commit
//! traversal wraps it, optionally following the parent chain to a
//! caller-supplied depth and tolerating missing subtrees of commits
//! marked partial.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Context;
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::objects::{DirTree, ObjectName, ObjectType, TreeDir, TreeFile};
use crate::repo::Repo;
use crate::util::{check_cancelled, Cancellable};
use crate::{is_not_found, Result};

/// One step of the dirtree iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStep<'a> {
    /// A file or symlink child: name plus content checksum.
    File(&'a TreeFile),
    /// A subdirectory child: name plus dirtree and dirmeta checksums.
    Dir(&'a TreeDir),
}

/// The in-place cursor over one dirtree's children: files, then
/// subdirectories, then end.
#[derive(Debug)]
pub struct DirTreeIter<'a> {
    tree: &'a DirTree,
    file_idx: usize,
    dir_idx: usize,
}

impl<'a> DirTreeIter<'a> {
    /// Start iterating `tree`.
    pub fn new(tree: &'a DirTree) -> Self {
        Self {
            tree,
            file_idx: 0,
            dir_idx: 0,
        }
    }
}

impl<'a> Iterator for DirTreeIter<'a> {
    type Item = TreeStep<'a>;

    fn next(&mut self) -> Option<TreeStep<'a>> {
        if let Some(f) = self.tree.files.get(self.file_idx) {
            self.file_idx += 1;
            return Some(TreeStep::File(f));
        }
        if let Some(d) = self.tree.dirs.get(self.dir_idx) {
            self.dir_idx += 1;
            return Some(TreeStep::Dir(d));
        }
        None
    }
}

/// Options for commit traversal.
#[derive(Debug, Clone, Copy)]
pub struct TraverseOptions {
    /// How many parents to follow: 0 traverses only the named commit,
    /// −1 is unbounded.
    pub maxdepth: i32,
    /// Record only commit objects, suppressing dirtree recursion.
    pub commit_only: bool,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        Self {
            maxdepth: -1,
            commit_only: false,
        }
    }
}

/// Compute the set of objects reachable from `start`.
///
/// A missing start commit yields an empty set rather than an error, to
/// tolerate partial repositories; missing dirtrees below a commit
/// marked partial are silently skipped.
pub fn traverse_commit(
    repo: &Repo,
    start: &Checksum,
    options: &TraverseOptions,
    cancellable: Option<&Cancellable>,
) -> Result<BTreeSet<ObjectName>> {
    Ok(traverse_inner(repo, start, options, false, cancellable)?.0)
}

/// Like [`traverse_commit`], but additionally maps every reachable
/// object to the set of commits that transitively reference it, for
/// provenance queries.
pub fn traverse_commit_with_parents(
    repo: &Repo,
    start: &Checksum,
    options: &TraverseOptions,
    cancellable: Option<&Cancellable>,
) -> Result<(
    BTreeSet<ObjectName>,
    BTreeMap<ObjectName, BTreeSet<Checksum>>,
)> {
    traverse_inner(repo, start, options, true, cancellable)
}

#[context("Traversing from commit {start}")]
fn traverse_inner(
    repo: &Repo,
    start: &Checksum,
    options: &TraverseOptions,
    want_parents: bool,
    cancellable: Option<&Cancellable>,
) -> Result<(
    BTreeSet<ObjectName>,
    BTreeMap<ObjectName, BTreeSet<Checksum>>,
)> {
    let mut out = BTreeSet::new();
    let mut parents: BTreeMap<ObjectName, BTreeSet<Checksum>> = BTreeMap::new();
    let mut commit_csum = *start;
    let mut depth = 0i64;
    loop {
        check_cancelled(cancellable, "traversal")?;
        let commit = match repo.load_commit(&commit_csum) {
            Ok(c) => c,
            // Tolerate a missing commit: pulls may be interrupted before
            // the parent chain is complete.
            Err(e) if is_not_found(&e) => {
                debug!("Commit {commit_csum} not present; stopping traversal");
                break;
            }
            Err(e) => return Err(e),
        };
        let mut record = |name: ObjectName| {
            let _ = out.insert(name);
            if want_parents {
                let _ = parents.entry(name).or_default().insert(commit_csum);
            }
        };
        record(ObjectName::new(commit_csum, ObjectType::Commit));
        let metaname = ObjectName::new(commit_csum, ObjectType::CommitMeta);
        if repo.has_object(&metaname)? {
            record(metaname);
        }
        if !options.commit_only {
            let tolerate_missing = repo.commit_is_partial(&commit_csum)?;
            record(ObjectName::new(commit.root_meta, ObjectType::DirMeta));
            let mut queue: VecDeque<Checksum> = VecDeque::new();
            queue.push_back(commit.root_tree);
            let mut seen: BTreeSet<Checksum> = BTreeSet::new();
            while let Some(tree_csum) = queue.pop_front() {
                check_cancelled(cancellable, "traversal")?;
                if !seen.insert(tree_csum) {
                    continue;
                }
                let tree = match repo.load_dirtree(&tree_csum) {
                    Ok(t) => t,
                    Err(e) if tolerate_missing && is_not_found(&e) => {
                        debug!("Skipping missing dirtree {tree_csum} of partial commit");
                        continue;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("In commit {commit_csum}"))
                    }
                };
                record(ObjectName::new(tree_csum, ObjectType::DirTree));
                for step in DirTreeIter::new(&tree) {
                    match step {
                        TreeStep::File(f) => {
                            record(ObjectName::new(f.checksum, ObjectType::File))
                        }
                        TreeStep::Dir(d) => {
                            record(ObjectName::new(d.meta_checksum, ObjectType::DirMeta));
                            queue.push_back(d.tree_checksum);
                        }
                    }
                }
            }
        }
        match commit.parent {
            Some(parent) if options.maxdepth < 0 || depth < options.maxdepth as i64 => {
                depth += 1;
                commit_csum = parent;
            }
            _ => break,
        }
    }
    Ok((out, parents))
}

/// Compute the union of objects reachable from several commits, e.g.
/// every commit named by a ref.
pub fn traverse_commits_union(
    repo: &Repo,
    starts: impl IntoIterator<Item = Checksum>,
    options: &TraverseOptions,
    cancellable: Option<&Cancellable>,
) -> Result<BTreeSet<ObjectName>> {
    let mut out = BTreeSet::new();
    for start in starts {
        out.append(&mut traverse_commit(repo, &start, options, cancellable)?);
    }
    Ok(out)
}
