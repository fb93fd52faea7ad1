//! Transactional object writes.
//!
//! Writes during a transaction go into a staging directory under
//! `tmp/`; `commit()` moves them atomically (per-object rename) into
//! `objects/` and releases the lock.  Partially written objects are
//! either absent or complete: every staged file is created via a
//! tempfile and renamed into place.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::Context;
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::{Dir, DirBuilder};
use cap_std_ext::cap_tempfile::TempFile;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tracing::debug;

use super::{xattrs, Repo, RepoLock, RepoMode, USER_META_XATTR};
use crate::checksum::{sha256, Checksum, Hasher};
use crate::error::Error;
use crate::objects::{
    filemeta_to_bytes, write_framed_header, xattrs_to_bytes, FileHeader, ObjectName, ObjectType,
    MAX_METADATA_SIZE,
};
use crate::util::{check_cancelled, Cancellable};
use crate::Result;

/// A decently large buffer; system calls are expensive.
const BUF_CAPACITY: usize = 131072;

/// Counters accumulated over one transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    /// Metadata objects written (commit, dirtree, dirmeta, ...).
    pub metadata_objects_written: u32,
    /// Content objects written.
    pub content_objects_written: u32,
    /// Total uncompressed content bytes written.
    pub content_bytes_written: u64,
}

/// An open transaction.  Dropped without [`Transaction::commit`], all
/// staged writes are discarded.
pub struct Transaction<'r> {
    repo: &'r Repo,
    staging_relpath: Utf8PathBuf,
    staging: Dir,
    _lock: RepoLock<'r>,
    devino: RefCell<HashMap<(u64, u64), Checksum>>,
    payload_index: RefCell<HashMap<Checksum, Checksum>>,
    stats: RefCell<TransactionStats>,
    committed: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("staging", &self.staging_relpath)
            .finish()
    }
}

impl Repo {
    fn check_free_space(&self) -> Result<()> {
        let config = self.config();
        let st = rustix::fs::fstatvfs(self.dir())?;
        let avail = st.f_bavail.saturating_mul(st.f_frsize);
        let required = match (config.min_free_space_percent, config.min_free_space_size) {
            (_, Some(bytes)) => bytes,
            (Some(pct), None) => st
                .f_blocks
                .saturating_mul(st.f_frsize)
                .saturating_mul(pct as u64)
                / 100,
            // Neither key set: default to 3%.
            (None, None) => st.f_blocks.saturating_mul(st.f_frsize) * 3 / 100,
        };
        if avail < required {
            anyhow::bail!(
                "min-free-space constraint would be exceeded: {avail} bytes available, {required} required"
            );
        }
        Ok(())
    }

    /// Begin a transaction: acquire the exclusive repository lock,
    /// check the free-space constraint, and reserve a staging
    /// directory.
    #[context("Preparing transaction")]
    pub fn prepare_transaction(
        &self,
        cancellable: Option<&Cancellable>,
    ) -> Result<Transaction<'_>> {
        check_cancelled(cancellable, "transaction prepare")?;
        let lock = self.lock_exclusive()?;
        self.check_free_space()?;
        let staging_relpath = Utf8PathBuf::from(format!("tmp/staging-{}", uuid::Uuid::new_v4()));
        self.dir().create_dir(&staging_relpath)?;
        let staging = self.dir().open_dir(&staging_relpath)?;
        debug!("Staging transaction in {staging_relpath}");
        Ok(Transaction {
            repo: self,
            staging_relpath,
            staging,
            _lock: lock,
            devino: RefCell::new(HashMap::new()),
            payload_index: RefCell::new(HashMap::new()),
            stats: RefCell::new(TransactionStats::default()),
            committed: false,
        })
    }
}

impl<'r> Transaction<'r> {
    fn loose_filename(&self, name: &ObjectName) -> String {
        let (prefix, rest) = name.checksum.to_hex_parts();
        let ext = match (name.objtype, self.repo.mode()) {
            (ObjectType::File, RepoMode::Archive) => "filez",
            (t, _) => t.extension(),
        };
        format!("{prefix}{rest}.{ext}")
    }

    fn is_staged(&self, name: &ObjectName) -> Result<bool> {
        Ok(self
            .staging
            .symlink_metadata_optional(self.loose_filename(name))?
            .is_some())
    }

    fn have_object(&self, name: &ObjectName) -> Result<bool> {
        Ok(self.repo.has_object(name)? || self.is_staged(name)?)
    }

    /// Write a metadata object.  Commit, dirtree, dirmeta and
    /// file-xattrs records are content-addressed: the store computes
    /// the actual checksum and an `expected` mismatch fails the write.
    /// Detached metadata and tombstones are named by their commit, so
    /// `expected` is required and trusted.
    pub fn write_metadata(
        &self,
        objtype: ObjectType,
        expected: Option<&Checksum>,
        data: &[u8],
    ) -> Result<Checksum> {
        anyhow::ensure!(objtype.is_meta(), "Not a metadata object type: {objtype}");
        if data.len() > MAX_METADATA_SIZE {
            return Err(Error::invalid_arg(format!(
                "Metadata object of {} bytes exceeds maximum",
                data.len()
            )));
        }
        let checksum = match objtype {
            ObjectType::CommitMeta | ObjectType::TombstoneCommit => *expected.ok_or_else(|| {
                Error::invalid_arg(format!("A target checksum is required for {objtype}"))
            })?,
            _ => {
                let actual = sha256(data)?;
                if let Some(expected) = expected {
                    if *expected != actual {
                        return Err(Error::ChecksumMismatch {
                            objtype,
                            expected: expected.to_hex(),
                            actual: actual.to_hex(),
                        }
                        .into());
                    }
                }
                actual
            }
        };
        let name = ObjectName::new(checksum, objtype);
        if self.have_object(&name)? {
            return Ok(checksum);
        }
        self.staging
            .atomic_write(self.loose_filename(&name), data)
            .with_context(|| format!("Staging {name}"))?;
        self.stats.borrow_mut().metadata_objects_written += 1;
        Ok(checksum)
    }

    /// Look up the device+inode cache.  The cache is scoped to this
    /// transaction and discarded on abort.
    pub fn devino_lookup(&self, dev: u64, ino: u64) -> Option<Checksum> {
        self.devino.borrow().get(&(dev, ino)).copied()
    }

    /// Record a (device, inode) → checksum association.
    pub fn devino_insert(&self, dev: u64, ino: u64, checksum: Checksum) {
        let _ = self.devino.borrow_mut().insert((dev, ino), checksum);
    }

    fn validate_content_header(&self, header: &FileHeader) -> Result<()> {
        let fmt = header.mode & libc::S_IFMT;
        if fmt != libc::S_IFREG && fmt != libc::S_IFLNK {
            return Err(Error::invalid_arg(format!(
                "Invalid content mode {:o}; only regular files and symlinks are supported",
                header.mode
            )));
        }
        if self.repo.mode() == RepoMode::BareUserOnly {
            let perms = header.mode & 0o7777;
            if perms & !0o775 != 0 {
                return Err(Error::invalid_arg(format!(
                    "Invalid mode {perms:o} in bare-user-only repository; permissions must be a subset of 0775"
                )));
            }
        }
        Ok(())
    }

    fn apply_bare_file_metadata(&self, tmpf: &mut TempFile, header: &FileHeader) -> Result<()> {
        match self.repo.mode() {
            RepoMode::Bare => {
                std::os::unix::fs::fchown(
                    tmpf.as_file_mut(),
                    Some(header.uid),
                    Some(header.gid),
                )
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::PermissionDenied => anyhow::Error::from(
                        Error::PermissionDenied(format!(
                            "Changing ownership to {}:{}",
                            header.uid, header.gid
                        )),
                    ),
                    _ => e.into(),
                })?;
                rustix::fs::fchmod(
                    tmpf.as_file_mut(),
                    rustix::fs::Mode::from_raw_mode(header.mode & 0o7777),
                )?;
                for (name, value) in &header.xattrs {
                    let name = std::str::from_utf8(name).context("Non-UTF-8 xattr name")?;
                    xattrs::fset(tmpf.as_file_mut(), name, value)
                        .with_context(|| format!("Setting xattr {name}"))?;
                }
            }
            RepoMode::BareUser | RepoMode::BareSplitXattrs => {
                let split = self.repo.mode() == RepoMode::BareSplitXattrs;
                let empty = Vec::new();
                let xattrs = if split { &empty } else { &header.xattrs };
                let meta = filemeta_to_bytes(header.uid, header.gid, header.mode, xattrs);
                xattrs::fset(tmpf.as_file_mut(), USER_META_XATTR, &meta)
                    .context("Writing metadata xattr")?;
                rustix::fs::fchmod(tmpf.as_file_mut(), rustix::fs::Mode::from_raw_mode(0o644))?;
            }
            RepoMode::BareUserOnly => {
                rustix::fs::fchmod(
                    tmpf.as_file_mut(),
                    rustix::fs::Mode::from_raw_mode(header.mode & 0o7777),
                )?;
            }
            RepoMode::Archive => unreachable!("archive payloads carry metadata in the header"),
        }
        Ok(())
    }

    /// Stage the split-xattrs sidecar objects for `checksum`.
    fn write_split_xattrs(&self, checksum: &Checksum, header: &FileHeader) -> Result<()> {
        if header.xattrs.is_empty() {
            return Ok(());
        }
        let data = xattrs_to_bytes(&header.xattrs);
        let xattrs_csum = self.write_metadata(ObjectType::FileXattrs, None, &data)?;
        let (prefix, rest) = xattrs_csum.to_hex_parts();
        let link = ObjectName::new(*checksum, ObjectType::FileXattrsLink);
        let target = format!("../{prefix}/{rest}.file-xattrs");
        if !self.have_object(&link)? {
            self.staging.symlink(&target, self.loose_filename(&link))?;
        }
        Ok(())
    }

    /// Write a file content object per the write-object contract: the
    /// store computes the actual checksum as it consumes the stream; on
    /// mismatch with `expected` the write fails and nothing is
    /// persisted.  Writing an object that already exists is a no-op
    /// success.
    #[context("Writing content object")]
    pub fn write_content(
        &self,
        expected: Option<&Checksum>,
        header: &FileHeader,
        content: &mut dyn Read,
        size: u64,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        check_cancelled(cancellable, "content write")?;
        self.validate_content_header(header)?;
        if header.is_symlink() {
            anyhow::ensure!(size == 0, "Symlink content must be empty");
            return self.write_symlink(expected, header);
        }

        let record = header.to_bytes();
        let mut hasher = Hasher::new()?;
        let _ = write_framed_header(&mut hasher, &record)?;

        let link_payload = self
            .repo
            .config()
            .payload_link_threshold
            .filter(|&t| size >= t)
            .map(|_| Hasher::new())
            .transpose()?;
        let mut payload_hasher = link_payload;

        let mut tmpf = TempFile::new(&self.staging).context("Allocating tempfile")?;
        enum Sink<'a, 'd> {
            Raw(&'a mut TempFile<'d>),
            Deflate(flate2::write::DeflateEncoder<&'a mut TempFile<'d>>),
        }
        let mut buf = vec![0u8; BUF_CAPACITY];
        let mut total = 0u64;
        {
            let mut sink = match self.repo.mode() {
                RepoMode::Archive => {
                    let archive_record = header.to_archive_bytes(size);
                    let _ = write_framed_header(&mut tmpf, &archive_record)?;
                    Sink::Deflate(flate2::write::DeflateEncoder::new(
                        &mut tmpf,
                        flate2::Compression::default(),
                    ))
                }
                _ => Sink::Raw(&mut tmpf),
            };

            loop {
                check_cancelled(cancellable, "content write")?;
                let n = content.read(&mut buf).context("Reading content")?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                if total > size {
                    return Err(Error::corrupted(format!(
                        "Content stream exceeds declared size {size}"
                    )));
                }
                hasher.update(&buf[..n])?;
                if let Some(ph) = payload_hasher.as_mut() {
                    ph.update(&buf[..n])?;
                }
                match &mut sink {
                    Sink::Raw(w) => w.write_all(&buf[..n])?,
                    Sink::Deflate(w) => w.write_all(&buf[..n])?,
                }
            }
            if total != size {
                return Err(Error::corrupted(format!(
                    "Content stream of {total} bytes does not match declared size {size}"
                )));
            }
            if let Sink::Deflate(w) = sink {
                let _ = w.finish()?;
            }
        }

        let actual = hasher.finish()?;
        if let Some(expected) = expected {
            if *expected != actual {
                return Err(Error::ChecksumMismatch {
                    objtype: ObjectType::File,
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                }
                .into());
            }
        }
        let name = ObjectName::new(actual, ObjectType::File);
        if self.have_object(&name)? {
            return Ok(actual);
        }
        if self.repo.mode() != RepoMode::Archive {
            self.apply_bare_file_metadata(&mut tmpf, header)?;
        }
        tmpf.replace(self.loose_filename(&name))
            .with_context(|| format!("Staging {name}"))?;
        if self.repo.mode() == RepoMode::BareSplitXattrs {
            self.write_split_xattrs(&actual, header)?;
        }
        if let Some(ph) = payload_hasher {
            self.maybe_write_payload_link(&actual, ph.finish()?)?;
        }
        {
            let mut stats = self.stats.borrow_mut();
            stats.content_objects_written += 1;
            stats.content_bytes_written += size;
        }
        Ok(actual)
    }

    /// If another object with an identical payload was written in this
    /// transaction, record a payload link pointing at it.
    fn maybe_write_payload_link(
        &self,
        object: &Checksum,
        payload_checksum: Checksum,
    ) -> Result<()> {
        let mut index = self.payload_index.borrow_mut();
        match index.get(&payload_checksum) {
            Some(existing) => {
                let link = ObjectName::new(payload_checksum, ObjectType::PayloadLink);
                if !self.have_object(&link)? {
                    let target_name = ObjectName::new(*existing, ObjectType::File);
                    let (prefix, _) = existing.to_hex_parts();
                    let target = format!("../{prefix}/{}", {
                        let f = self.loose_filename(&target_name);
                        f[2..].to_string()
                    });
                    self.staging.symlink(&target, self.loose_filename(&link))?;
                    debug!("Recorded payload link {payload_checksum} -> {existing}");
                }
            }
            None => {
                let _ = index.insert(payload_checksum, *object);
            }
        }
        Ok(())
    }

    fn write_symlink(&self, expected: Option<&Checksum>, header: &FileHeader) -> Result<Checksum> {
        let record = header.to_bytes();
        let mut hasher = Hasher::new()?;
        let _ = write_framed_header(&mut hasher, &record)?;
        let actual = hasher.finish()?;
        if let Some(expected) = expected {
            if *expected != actual {
                return Err(Error::ChecksumMismatch {
                    objtype: ObjectType::File,
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                }
                .into());
            }
        }
        let name = ObjectName::new(actual, ObjectType::File);
        if self.have_object(&name)? {
            return Ok(actual);
        }
        let filename = self.loose_filename(&name);
        match self.repo.mode() {
            RepoMode::Archive => {
                let mut tmpf = TempFile::new(&self.staging)?;
                let archive_record = header.to_archive_bytes(0);
                let _ = write_framed_header(&mut tmpf, &archive_record)?;
                let enc = flate2::write::DeflateEncoder::new(
                    &mut tmpf,
                    flate2::Compression::default(),
                );
                let _ = enc.finish()?;
                tmpf.replace(&filename)?;
            }
            RepoMode::Bare => {
                self.staging.symlink(&header.symlink_target, &filename)?;
                let full = self
                    .repo
                    .path()
                    .join(&self.staging_relpath)
                    .join(&filename);
                std::os::unix::fs::lchown(&full, Some(header.uid), Some(header.gid)).map_err(
                    |e| match e.kind() {
                        std::io::ErrorKind::PermissionDenied => {
                            anyhow::Error::from(Error::PermissionDenied(format!(
                                "Changing ownership to {}:{}",
                                header.uid, header.gid
                            )))
                        }
                        _ => anyhow::Error::from(e),
                    },
                )?;
            }
            RepoMode::BareUserOnly => {
                self.staging.symlink(&header.symlink_target, &filename)?;
            }
            RepoMode::BareUser | RepoMode::BareSplitXattrs => {
                let mut tmpf = TempFile::new(&self.staging)?;
                tmpf.write_all(header.symlink_target.as_bytes())?;
                self.apply_bare_file_metadata(&mut tmpf, header)?;
                tmpf.replace(&filename)?;
                if self.repo.mode() == RepoMode::BareSplitXattrs {
                    self.write_split_xattrs(&actual, header)?;
                }
            }
        }
        self.stats.borrow_mut().content_objects_written += 1;
        Ok(actual)
    }

    /// Make all staged objects visible: move each into `objects/` with
    /// an atomic rename, discard the staging directory, and release
    /// the lock.  The set becomes visible in arbitrary per-object
    /// order; each individual object is atomic.
    #[context("Committing transaction")]
    pub fn commit(mut self, cancellable: Option<&Cancellable>) -> Result<TransactionStats> {
        let objects = self.repo.dir().open_dir("objects")?;
        let b = DirBuilder::new();
        // Snapshot the staged names before renaming anything out of
        // the directory being iterated.
        let mut staged = Vec::new();
        for entry in self.staging.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| Error::corrupted("Invalid staged object name"))?
                .to_string();
            staged.push(name);
        }
        staged.sort();
        for name in staged {
            check_cancelled(cancellable, "transaction commit")?;
            let (prefix, rest) = name.split_at(2);
            let _ = objects.ensure_dir_with(prefix, &b)?;
            self.staging
                .rename(&name, &objects, format!("{prefix}/{rest}"))
                .with_context(|| format!("Publishing {name}"))?;
        }
        self.repo.dir().remove_dir_all(&self.staging_relpath)?;
        self.committed = true;
        let stats = *self.stats.borrow();
        debug!(
            "Transaction complete: {} metadata, {} content objects",
            stats.metadata_objects_written, stats.content_objects_written
        );
        Ok(stats)
    }

    /// Discard all staged writes.
    pub fn abort(self) {
        // Drop does the work.
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.repo.dir().remove_dir_all(&self.staging_relpath) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to clean staging directory: {e}");
                }
            }
        }
    }
}
