//! Assembling commits: building the Merkle forest from an on-disk
//! directory tree or programmatically via [`MutableTree`].

use std::collections::BTreeMap;

use anyhow::Context;
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, MetadataExt};
use fn_error_context::context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::objects::{
    validate_filename, Commit, DirMeta, DirTree, FileHeader, ObjectType, TreeDir, TreeFile,
};
use crate::repo::{Repo, Transaction};
use crate::util::{check_cancelled, Cancellable};
use crate::variant::Value;
use crate::Result;

/// An in-memory directory tree under construction.  Files hold
/// already-written content-object checksums; directories are nested
/// trees plus a dirmeta checksum.
#[derive(Debug, Default)]
pub struct MutableTree {
    files: BTreeMap<String, Checksum>,
    subdirs: BTreeMap<String, MutableTree>,
    metadata_checksum: Option<Checksum>,
}

impl MutableTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file child.
    pub fn replace_file(&mut self, name: &str, checksum: Checksum) -> Result<()> {
        validate_filename(name)?;
        let _ = self.files.insert(name.to_string(), checksum);
        Ok(())
    }

    /// Get or create a subdirectory child.
    pub fn ensure_dir(&mut self, name: &str) -> Result<&mut MutableTree> {
        validate_filename(name)?;
        Ok(self.subdirs.entry(name.to_string()).or_default())
    }

    /// Set this directory's dirmeta checksum.
    pub fn set_metadata_checksum(&mut self, checksum: Checksum) {
        self.metadata_checksum = Some(checksum);
    }

    /// Recursively write dirtree objects for this tree, returning the
    /// root dirtree checksum.  Directories without an explicit dirmeta
    /// get the default (root-owned 0755) one.
    pub fn write(&self, txn: &Transaction<'_>) -> Result<Checksum> {
        let mut dirs = Vec::with_capacity(self.subdirs.len());
        for (name, sub) in &self.subdirs {
            let tree_checksum = sub.write(txn)?;
            let meta_checksum = match sub.metadata_checksum {
                Some(c) => c,
                None => txn.write_metadata(
                    ObjectType::DirMeta,
                    None,
                    &DirMeta::default_dir().to_bytes(),
                )?,
            };
            dirs.push(TreeDir {
                name: name.clone(),
                tree_checksum,
                meta_checksum,
            });
        }
        let files = self
            .files
            .iter()
            .map(|(name, checksum)| TreeFile {
                name: name.clone(),
                checksum: *checksum,
            })
            .collect();
        let tree = DirTree { files, dirs };
        txn.write_metadata(ObjectType::DirTree, None, &tree.to_bytes())
    }
}

/// Options controlling commit assembly.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// One-line summary.
    pub subject: String,
    /// Long-form description.
    pub body: String,
    /// Schemaless metadata hashed into the commit.
    pub metadata: BTreeMap<String, Value>,
    /// Parent commit.
    pub parent: Option<Checksum>,
    /// Commit timestamp; defaults to the current time.
    pub timestamp: Option<u64>,
    /// Override the recorded owner uid of every filesystem entry.
    pub owner_uid: Option<u32>,
    /// Override the recorded owner gid of every filesystem entry.
    pub owner_gid: Option<u32>,
    /// Record extended attributes of source files.  Off by default:
    /// ambient filesystem labels would otherwise leak into the
    /// recorded tree.
    pub record_xattrs: bool,
}

/// Write a commit object referencing an already-written root tree.
pub fn write_commit(
    txn: &Transaction<'_>,
    root_tree: Checksum,
    root_meta: Checksum,
    options: &CommitOptions,
) -> Result<Checksum> {
    let commit = Commit {
        metadata: options.metadata.clone(),
        parent: options.parent,
        related: Vec::new(),
        subject: options.subject.clone(),
        body: options.body.clone(),
        timestamp: options
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64),
        root_tree,
        root_meta,
    };
    txn.write_metadata(ObjectType::Commit, None, &commit.to_bytes()?)
}

/// Commit the contents of `src` into the repository, returning the new
/// commit's checksum.  The caller updates refs separately.
#[context("Committing {src}")]
pub fn commit_filesystem(
    repo: &Repo,
    src: &Utf8Path,
    options: &CommitOptions,
    cancellable: Option<&Cancellable>,
) -> Result<Checksum> {
    let dir = Dir::open_ambient_dir(src, cap_std::ambient_authority())
        .with_context(|| format!("Opening {src}"))?;
    let txn = repo.prepare_transaction(cancellable)?;
    let mut root = MutableTree::new();
    write_directory(&txn, &dir, &mut root, options, cancellable)?;
    let root_tree = root.write(&txn)?;
    let root_meta = root
        .metadata_checksum
        .expect("root dirmeta recorded by walk");
    let checksum = write_commit(&txn, root_tree, root_meta, options)?;
    let stats = txn.commit(cancellable)?;
    debug!(
        "Committed {checksum}: {} metadata, {} content objects",
        stats.metadata_objects_written, stats.content_objects_written
    );
    Ok(checksum)
}

fn dirmeta_for(meta: &cap_std::fs::Metadata, options: &CommitOptions) -> DirMeta {
    DirMeta {
        uid: options.owner_uid.unwrap_or_else(|| meta.uid()),
        gid: options.owner_gid.unwrap_or_else(|| meta.gid()),
        mode: libc::S_IFDIR | (meta.mode() & 0o7777),
        xattrs: Vec::new(),
    }
}

fn write_directory(
    txn: &Transaction<'_>,
    dir: &Dir,
    tree: &mut MutableTree,
    options: &CommitOptions,
    cancellable: Option<&Cancellable>,
) -> Result<()> {
    check_cancelled(cancellable, "commit")?;
    let self_meta = dir.dir_metadata()?;
    let dirmeta = dirmeta_for(&self_meta, options);
    tree.set_metadata_checksum(txn.write_metadata(
        ObjectType::DirMeta,
        None,
        &dirmeta.to_bytes(),
    )?);

    // Deterministic walk order.
    let mut names: Vec<String> = Vec::new();
    for entry in dir.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 filename {name:?}"))?
            .to_string();
        names.push(name);
    }
    names.sort();

    for name in names {
        check_cancelled(cancellable, "commit")?;
        let meta = dir.symlink_metadata(&name)?;
        if meta.is_dir() {
            let subdir = dir.open_dir(&name)?;
            let subtree = tree.ensure_dir(&name)?;
            write_directory(txn, &subdir, subtree, options, cancellable)?;
        } else if meta.is_symlink() {
            let target = dir.read_link(&name)?;
            let target = camino::Utf8PathBuf::try_from(target)
                .context("Non-UTF-8 symlink target")?;
            let header = FileHeader::new_symlink(
                options.owner_uid.unwrap_or_else(|| meta.uid()),
                options.owner_gid.unwrap_or_else(|| meta.gid()),
                target.as_str(),
            );
            let checksum = txn.write_content(None, &header, &mut std::io::empty(), 0, cancellable)?;
            tree.replace_file(&name, checksum)?;
        } else if meta.is_file() {
            let devino = (meta.dev(), meta.ino());
            if let Some(checksum) = txn.devino_lookup(devino.0, devino.1) {
                tree.replace_file(&name, checksum)?;
                continue;
            }
            let mut f = dir.open(&name)?;
            let xattrs = if options.record_xattrs {
                crate::repo::xattrs::fget_all(&f)?
            } else {
                Vec::new()
            };
            let header = FileHeader {
                uid: options.owner_uid.unwrap_or_else(|| meta.uid()),
                gid: options.owner_gid.unwrap_or_else(|| meta.gid()),
                mode: libc::S_IFREG | (meta.mode() & 0o7777),
                symlink_target: String::new(),
                xattrs,
            };
            let checksum = txn.write_content(None, &header, &mut f, meta.len(), cancellable)?;
            txn.devino_insert(devino.0, devino.1, checksum);
            tree.replace_file(&name, checksum)?;
        }
        // Sockets, fifos and devices are not representable; skip them.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutable_tree_shape() {
        let mut t = MutableTree::new();
        t.replace_file("a", Checksum::new([1; 32])).unwrap();
        let sub = t.ensure_dir("sub").unwrap();
        sub.replace_file("b", Checksum::new([2; 32])).unwrap();
        assert!(t.replace_file("../evil", Checksum::new([3; 32])).is_err());
        assert!(t.ensure_dir("..").is_err());
        assert_eq!(t.files.len(), 1);
        assert_eq!(t.subdirs.len(), 1);
    }
}
