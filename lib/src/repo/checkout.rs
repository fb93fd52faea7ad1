//! Materializing a commit back into a POSIX directory tree.

use anyhow::Context;
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, OpenOptions};
use fn_error_context::context;
use std::io::Write;

use super::Repo;
use crate::checksum::Checksum;
use crate::error::Error;
use crate::util::{check_cancelled, Cancellable};
use crate::Result;

/// Options for [`Repo::checkout_commit`].
#[derive(Debug, Clone)]
pub struct CheckoutOptions {
    /// Restore uid/gid and xattrs.  Failing to do so surfaces
    /// `PermissionDenied`; this defaults to on only when running as
    /// root.
    pub restore_ownership: bool,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            restore_ownership: rustix::process::geteuid().is_root(),
        }
    }
}

impl Repo {
    /// Check out `commit` into `target`, which is created and must not
    /// already exist.
    #[context("Checking out into {target}")]
    pub fn checkout_commit(
        &self,
        commit: &Checksum,
        target: &Utf8Path,
        options: &CheckoutOptions,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        let _lock = self.lock_shared()?;
        let commit = self.load_commit(commit)?;
        std::fs::create_dir(target).with_context(|| format!("Creating {target}"))?;
        let dir = Dir::open_ambient_dir(target, cap_std::ambient_authority())?;
        self.checkout_tree(&commit.root_tree, &commit.root_meta, &dir, options, cancellable)
    }

    fn checkout_tree(
        &self,
        tree: &Checksum,
        meta: &Checksum,
        dir: &Dir,
        options: &CheckoutOptions,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        check_cancelled(cancellable, "checkout")?;
        let dirtree = self.load_dirtree(tree)?;
        let dirmeta = self.load_dirmeta(meta)?;
        for file in &dirtree.files {
            check_cancelled(cancellable, "checkout")?;
            let (header, content) = self.load_file(&file.checksum)?;
            if header.is_symlink() {
                dir.symlink(&header.symlink_target, &file.name)?;
            } else {
                let mut opts = OpenOptions::new();
                let _ = opts.create_new(true).write(true);
                let mut f = dir
                    .open_with(&file.name, &opts)
                    .with_context(|| format!("Creating {}", file.name))?;
                f.write_all(&content)?;
                rustix::fs::fchmod(
                    &f,
                    rustix::fs::Mode::from_raw_mode(header.mode & 0o7777),
                )?;
                if options.restore_ownership {
                    restore_ownership(&f, header.uid, header.gid)?;
                    for (name, value) in &header.xattrs {
                        let name = std::str::from_utf8(name).context("Non-UTF-8 xattr name")?;
                        super::xattrs::fset(&f, name, value)
                            .with_context(|| format!("Setting xattr {name}"))?;
                    }
                }
            }
        }
        for sub in &dirtree.dirs {
            dir.create_dir(&sub.name)?;
            let subdir = dir.open_dir(&sub.name)?;
            self.checkout_tree(&sub.tree_checksum, &sub.meta_checksum, &subdir, options, cancellable)?;
        }
        // Apply this directory's own metadata last, after children are
        // in place.
        rustix::fs::fchmod(
            dir,
            rustix::fs::Mode::from_raw_mode(dirmeta.mode & 0o7777),
        )?;
        if options.restore_ownership {
            restore_ownership(dir, dirmeta.uid, dirmeta.gid)?;
        }
        Ok(())
    }
}

fn restore_ownership(f: impl std::os::fd::AsFd, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::fchown(f, Some(uid), Some(gid)).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => anyhow::Error::from(Error::PermissionDenied(
            format!("Restoring ownership {uid}:{gid}"),
        )),
        _ => e.into(),
    })
}
