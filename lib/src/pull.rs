//! Pulling commits between local repositories.
//!
//! Network transports are out of scope; a "remote" here is a
//! filesystem path (optionally configured as a `file://` remote).  The
//! destination commit is marked partial for the duration of the copy
//! so interrupted pulls stay prunable and resumable.

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::objects::ObjectType;
use crate::repo::Repo;
use crate::traversal::{traverse_commit, TraverseOptions};
use crate::util::{check_cancelled, Cancellable};
use crate::Result;

/// Options for [`pull_local`].
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Parent-chain depth to pull; 0 pulls only the named commits, −1
    /// is unbounded.
    pub depth: i32,
    /// When set, refs are written into this remote's namespace
    /// (`refs/remotes/<name>/...`) instead of local heads.
    pub remote: Option<String>,
}

impl PullOptions {
    /// Options for a flat (depth 0) pull into local heads.
    pub fn flat() -> Self {
        Self::default()
    }
}

/// Pull `refs` from the repository at `src_path` into `dest`,
/// returning the commit checksum of each pulled ref in order.
#[context("Pulling from {src_path}")]
pub fn pull_local(
    dest: &Repo,
    src_path: &Utf8Path,
    refs: &[String],
    options: &PullOptions,
    cancellable: Option<&Cancellable>,
) -> Result<Vec<Checksum>> {
    let src = Repo::open(src_path)?;
    let mut result = Vec::with_capacity(refs.len());
    for r in refs {
        let checksum = src.resolve_rev(r)?;
        pull_commit(dest, &src, &checksum, options, cancellable)
            .with_context(|| format!("Pulling {r}"))?;
        let refspec = match &options.remote {
            Some(remote) => format!("{remote}:{r}"),
            None => r.clone(),
        };
        dest.set_ref(&refspec, Some(&checksum))?;
        result.push(checksum);
    }
    Ok(result)
}

fn pull_commit(
    dest: &Repo,
    src: &Repo,
    checksum: &Checksum,
    options: &PullOptions,
    cancellable: Option<&Cancellable>,
) -> Result<()> {
    let topts = TraverseOptions {
        maxdepth: options.depth,
        commit_only: false,
    };
    let reachable = traverse_commit(src, checksum, &topts, cancellable)?;
    anyhow::ensure!(
        !reachable.is_empty(),
        "Commit {checksum} is not present in the source repository"
    );

    dest.set_commit_partial(checksum, true)?;
    let txn = dest.prepare_transaction(cancellable)?;
    let mut copied = 0u32;
    for obj in &reachable {
        check_cancelled(cancellable, "pull")?;
        if dest.has_object(obj)? {
            continue;
        }
        match obj.objtype {
            ObjectType::File => {
                let (header, payload) = src.load_file(&obj.checksum)?;
                let size = payload.len() as u64;
                let _ = txn.write_content(
                    Some(&obj.checksum),
                    &header,
                    &mut &payload[..],
                    size,
                    cancellable,
                )?;
            }
            _ => {
                let data = src.load_metadata(obj)?;
                let _ = txn.write_metadata(obj.objtype, Some(&obj.checksum), &data)?;
            }
        }
        copied += 1;
    }
    let _ = txn.commit(cancellable)?;
    // Propagate partialness rather than clearing it blindly: the
    // source itself may hold an incomplete closure.
    if !src.commit_is_partial(checksum)? {
        dest.set_commit_partial(checksum, false)?;
    }
    debug!("Pulled {checksum}: {copied} new objects");
    Ok(())
}
