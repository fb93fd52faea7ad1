//! Shared test fixture: a tempdir holding an archive source
//! repository, a bare-user-only destination repository, and staging
//! trees to commit.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use treestore_lib::checksum::Checksum;
use treestore_lib::commit::{commit_filesystem, CommitOptions};
use treestore_lib::repo::{Repo, RepoMode};

#[derive(Debug)]
pub struct Fixture {
    // Just holds a reference
    _tempdir: tempfile::TempDir,
    pub path: Utf8PathBuf,
    pub srcrepo: Repo,
    pub destrepo: Repo,
}

/// A fixed timestamp so commits are reproducible.
pub const TIMESTAMP: u64 = 1_700_000_000;

impl Fixture {
    pub fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path: Utf8PathBuf = Utf8Path::from_path(tempdir.path())
            .expect("utf8 tempdir")
            .to_path_buf();
        std::fs::create_dir_all(path.join("src/repo"))?;
        std::fs::create_dir_all(path.join("dest/repo"))?;
        let srcrepo = Repo::create(&path.join("src/repo"), RepoMode::Archive)?;
        let destrepo = Repo::create(&path.join("dest/repo"), RepoMode::BareUserOnly)?;
        Ok(Self {
            _tempdir: tempdir,
            path,
            srcrepo,
            destrepo,
        })
    }

    /// Create (or extend) a staging tree under the fixture directory.
    pub fn treedir(&self, name: &str) -> Result<Utf8PathBuf> {
        let dir = self.path.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_file(&self, tree: &str, rel: &str, contents: &[u8], mode: u32) -> Result<()> {
        let path = self.path.join(tree).join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn write_symlink(&self, tree: &str, rel: &str, target: &str) -> Result<()> {
        let path = self.path.join(tree).join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &path)?;
        Ok(())
    }

    /// Commit a staging tree into the source repository as root-owned
    /// content and update `branch`.
    pub fn commit_src(&self, tree: &str, branch: &str, timestamp: u64) -> Result<Checksum> {
        self.commit_src_with_subject(tree, branch, timestamp, "test commit")
    }

    pub fn commit_src_with_subject(
        &self,
        tree: &str,
        branch: &str,
        timestamp: u64,
        subject: &str,
    ) -> Result<Checksum> {
        let options = CommitOptions {
            subject: subject.to_string(),
            parent: self.srcrepo.try_resolve_ref(branch)?,
            timestamp: Some(timestamp),
            owner_uid: Some(0),
            owner_gid: Some(0),
            ..Default::default()
        };
        let checksum = commit_filesystem(&self.srcrepo, &self.path.join(tree), &options, None)
            .context("Committing fixture tree")?;
        self.srcrepo.set_ref(branch, Some(&checksum))?;
        Ok(checksum)
    }
}
