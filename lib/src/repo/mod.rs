//! The object store backend: on-disk layout, loose-object access,
//! repository configuration, locking, refs and transactions.
//!
//! Layout relative to the repository root:
//!
//! ```text
//! config                      key/value configuration
//! objects/<aa>/<rest>.<ext>   loose objects, two-hex-char fan-out
//! refs/heads/<name>           mutable pointers
//! refs/remotes/<remote>/<name>
//! refs/mirrors/<collection-id>/<name>
//! state/<csum>.commitpartial  partial-commit markers
//! deltas/, delta-indexes/     static deltas
//! tmp/                        staging area for in-flight writes
//! ```

mod checkout;
mod write;
pub(crate) mod xattrs;

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, DirBuilder};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::checksum::Checksum;
use crate::error::Error;
use crate::objects::{Commit, DirMeta, DirTree, FileHeader, ObjectName, ObjectType, Xattrs};
use crate::objects::{parse_filemeta, read_framed_header, MAX_METADATA_SIZE};
use crate::refs::{validate_collection_id, validate_ref, validate_remote_name};
use crate::variant::Value;
use crate::Result;

pub use checkout::CheckoutOptions;
pub use write::{Transaction, TransactionStats};

/// The xattr carrying serialized file metadata in the bare-user
/// encodings.
pub(crate) const USER_META_XATTR: &str = "user.treemeta";

const CONFIG: &str = "config";
const OBJECTS: &str = "objects";
const STATE: &str = "state";
const TMP: &str = "tmp";
const LOCKFILE: &str = ".lock";
/// Per-remote summary cache, `<name>` next to `<name>.sig`.
pub(crate) const SUMMARY_CACHE: &str = "tmp/cache/summaries";

/// On-disk encoding families.  The integer values are ABI-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RepoMode {
    /// Files stored with real uid/gid and xattrs; requires root to
    /// write faithfully.
    Bare = 0,
    /// uid/gid/mode/xattrs stored in a `user.treemeta` xattr; the
    /// payload is the real file bytes.
    BareUser = 1,
    /// Like bare-user, but stores no metadata sidecar at all and
    /// rejects non-regular/non-symlink content and unusual permission
    /// bits.
    BareUserOnly = 2,
    /// Like bare-user, but xattrs live in separate objects addressed
    /// by their own checksum.
    BareSplitXattrs = 3,
    /// Compressed; all metadata in the object header.
    Archive = 4,
}

impl RepoMode {
    /// The config-file string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bare => "bare",
            Self::BareUser => "bare-user",
            Self::BareUserOnly => "bare-user-only",
            Self::BareSplitXattrs => "bare-split-xattrs",
            Self::Archive => "archive",
        }
    }

    /// Parse the config-file string.
    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bare" => Self::Bare,
            "bare-user" => Self::BareUser,
            "bare-user-only" => Self::BareUserOnly,
            "bare-split-xattrs" => Self::BareSplitXattrs,
            // The legacy alias is still accepted on read.
            "archive" | "archive-z2" => Self::Archive,
            o => return Err(Error::invalid_arg(format!("Invalid repo mode {o:?}"))),
        })
    }

    /// Whether file content is stored as real files (as opposed to a
    /// header-framed stream).
    pub fn is_bare(&self) -> bool {
        !matches!(self, Self::Archive)
    }
}

/// Configuration of one remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Remote name.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// Whether commit signatures are required.
    pub gpg_verify: bool,
    /// Whether summary signatures are required.
    pub gpg_verify_summary: bool,
}

/// Parsed repository configuration (the `[core]` section).
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// On-disk encoding.
    pub mode: RepoMode,
    /// Lower bound on free space, as a percentage of the filesystem.
    pub min_free_space_percent: Option<u32>,
    /// Lower bound on free space, in bytes.
    pub min_free_space_size: Option<u64>,
    /// Optional collection ID claimed by this repository.
    pub collection_id: Option<String>,
    /// Minimum payload size for payload-link deduplication; absent
    /// disables it.
    pub payload_link_threshold: Option<u64>,
    /// Whether explicit commit deletion leaves a tombstone object.
    pub tombstone_commits: bool,
    /// Ordered repo-finder names consulted by remote discovery
    /// (an external collaborator); parsed and validated here only.
    pub default_repo_finders: Vec<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            mode: RepoMode::Bare,
            min_free_space_percent: None,
            min_free_space_size: None,
            collection_id: None,
            payload_link_threshold: None,
            tombstone_commits: false,
            default_repo_finders: Vec::new(),
        }
    }
}

/// Parse a size value with an optional decimal suffix (`kB`, `MB`,
/// `GB`, `TB`).
fn parse_size(s: &str) -> Result<u64> {
    let (digits, mult) = match s.find(|c: char| !c.is_ascii_digit()) {
        None => (s, 1u64),
        Some(pos) => {
            let mult = match &s[pos..] {
                "kB" | "KB" => 1_000u64,
                "MB" => 1_000_000,
                "GB" => 1_000_000_000,
                "TB" => 1_000_000_000_000,
                o => return Err(Error::invalid_arg(format!("Invalid size suffix {o:?}"))),
            };
            (&s[..pos], mult)
        }
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_arg(format!("Invalid size {s:?}")))?;
    n.checked_mul(mult)
        .ok_or_else(|| Error::invalid_arg(format!("Size {s:?} overflows")))
}

impl RepoConfig {
    fn parse(contents: &str) -> Result<Self> {
        let ini = tini::Ini::from_string(contents).context("Parsing repo config")?;
        let version: String = ini
            .get("core", "repo_version")
            .ok_or_else(|| Error::corrupted("Repo config missing repo_version"))?;
        if version != "1" {
            return Err(Error::corrupted(format!(
                "Unsupported repo_version {version}"
            )));
        }
        let mode = ini
            .get::<String>("core", "mode")
            .map(|m| RepoMode::from_str(&m))
            .transpose()?
            .unwrap_or(RepoMode::Bare);
        let min_free_space_percent = ini
            .get::<String>("core", "min-free-space-percent")
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| Error::invalid_arg(format!("Invalid min-free-space-percent {v:?}")))
                    .and_then(|p| {
                        if p > 99 {
                            Err(Error::invalid_arg(format!(
                                "Invalid min-free-space-percent {p}; must be <= 99"
                            )))
                        } else {
                            Ok(p)
                        }
                    })
            })
            .transpose()?;
        let min_free_space_size = ini
            .get::<String>("core", "min-free-space-size")
            .map(|v| parse_size(&v))
            .transpose()?;
        if min_free_space_percent.is_some() && min_free_space_size.is_some() {
            return Err(Error::invalid_arg(
                "Only one of min-free-space-percent and min-free-space-size may be set",
            ));
        }
        let collection_id = ini.get::<String>("core", "collection-id");
        if let Some(cid) = collection_id.as_deref() {
            validate_collection_id(cid)?;
        }
        let payload_link_threshold = ini
            .get::<String>("core", "payload-link-threshold")
            .map(|v| parse_size(&v))
            .transpose()?;
        let tombstone_commits = ini
            .get::<String>("core", "tombstone-commits")
            .map(|v| v == "true")
            .unwrap_or(false);
        let default_repo_finders = ini
            .get::<String>("core", "default-repo-finders")
            .map(|v| {
                v.split(';')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            mode,
            min_free_space_percent,
            min_free_space_size,
            collection_id,
            payload_link_threshold,
            tombstone_commits,
            default_repo_finders,
        })
    }
}

#[derive(Debug, Default)]
struct LockState {
    file: Option<std::fs::File>,
    shared: usize,
    exclusive: usize,
}

/// A held repository lock; released on drop.
#[derive(Debug)]
pub struct RepoLock<'a> {
    repo: &'a Repo,
    exclusive: bool,
}

impl Drop for RepoLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.repo.unlock(self.exclusive) {
            tracing::warn!("Failed to release repository lock: {e}");
        }
    }
}

/// An opened repository.
pub struct Repo {
    path: Utf8PathBuf,
    dir: Dir,
    config: RepoConfig,
    lock: Mutex<LockState>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.path)
            .field("mode", &self.config.mode)
            .finish()
    }
}

impl Repo {
    /// Initialize a new repository at `path` (which must exist and be a
    /// directory) and open it.  Errors if one already exists there.
    #[context("Creating repo at {path}")]
    pub fn create(path: &Utf8Path, mode: RepoMode) -> Result<Repo> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("Opening {path}"))?;
        if dir.try_exists(CONFIG)? {
            return Err(Error::AlreadyExists(format!("Repository at {path}")).into());
        }
        let b = DirBuilder::new();
        for d in [
            OBJECTS,
            "refs",
            "refs/heads",
            "refs/remotes",
            "refs/mirrors",
            STATE,
            TMP,
            "deltas",
            "delta-indexes",
        ] {
            let _ = dir.ensure_dir_with(d, &b)?;
        }
        let ini = tini::Ini::new()
            .section("core")
            .item("repo_version", "1")
            .item("mode", mode.as_str());
        dir.atomic_write(CONFIG, ini.to_string().into_bytes())?;
        drop(dir);
        Self::open(path)
    }

    /// Open an existing repository.
    #[context("Opening repo at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Repo> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("Opening {path}"))?;
        let contents = dir
            .read_to_string(CONFIG)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::not_found(format!("Repository at {path}")),
                _ => e.into(),
            })?;
        let config = RepoConfig::parse(&contents)?;
        Ok(Repo {
            path: path.to_owned(),
            dir,
            config,
            lock: Mutex::new(LockState::default()),
        })
    }

    /// The repository root path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The on-disk encoding.
    pub fn mode(&self) -> RepoMode {
        self.config.mode
    }

    /// The parsed configuration.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    fn do_flock(&self, state: &mut LockState, exclusive: bool) -> Result<()> {
        if state.file.is_none() {
            let f = self
                .dir
                .open_with(
                    LOCKFILE,
                    cap_std::fs::OpenOptions::new().create(true).write(true),
                )?
                .into_std();
            state.file = Some(f);
        }
        // Unwrap safety: assigned above.
        let f = state.file.as_ref().unwrap();
        let op = if exclusive {
            rustix::fs::FlockOperation::LockExclusive
        } else {
            rustix::fs::FlockOperation::LockShared
        };
        rustix::fs::flock(f, op).context("Locking repository")?;
        Ok(())
    }

    /// Acquire the repository lock in shared (reader) mode.  Locks are
    /// reentrant within the process.
    pub fn lock_shared(&self) -> Result<RepoLock<'_>> {
        let mut state = self.lock.lock().expect("lock poisoned");
        if state.shared == 0 && state.exclusive == 0 {
            self.do_flock(&mut state, false)?;
        }
        state.shared += 1;
        Ok(RepoLock {
            repo: self,
            exclusive: false,
        })
    }

    /// Acquire the repository lock in exclusive (writer) mode.  An
    /// upgrade from a held shared lock releases and re-acquires.
    pub fn lock_exclusive(&self) -> Result<RepoLock<'_>> {
        let mut state = self.lock.lock().expect("lock poisoned");
        if state.exclusive == 0 {
            self.do_flock(&mut state, true)?;
        }
        state.exclusive += 1;
        Ok(RepoLock {
            repo: self,
            exclusive: true,
        })
    }

    fn unlock(&self, exclusive: bool) -> Result<()> {
        let mut state = self.lock.lock().expect("lock poisoned");
        if exclusive {
            state.exclusive = state.exclusive.saturating_sub(1);
        } else {
            state.shared = state.shared.saturating_sub(1);
        }
        if let Some(f) = state.file.as_ref() {
            if state.exclusive == 0 && state.shared > 0 {
                rustix::fs::flock(f, rustix::fs::FlockOperation::LockShared)?;
            } else if state.exclusive == 0 && state.shared == 0 {
                rustix::fs::flock(f, rustix::fs::FlockOperation::Unlock)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loose object access
    // ------------------------------------------------------------------

    /// The repository-relative path of a loose object.
    pub fn object_relpath(&self, name: &ObjectName) -> Utf8PathBuf {
        let (prefix, rest) = name.checksum.to_hex_parts();
        let ext = match (name.objtype, self.config.mode) {
            (ObjectType::File, RepoMode::Archive) => "filez",
            (t, _) => t.extension(),
        };
        format!("{OBJECTS}/{prefix}/{rest}.{ext}").into()
    }

    /// Whether the named object is present.
    pub fn has_object(&self, name: &ObjectName) -> Result<bool> {
        let path = self.object_relpath(name);
        Ok(self.dir.symlink_metadata_optional(&path)?.is_some())
    }

    /// The on-disk size in bytes of a loose object.
    pub fn object_size(&self, name: &ObjectName) -> Result<u64> {
        let path = self.object_relpath(name);
        let meta = self
            .dir
            .symlink_metadata_optional(&path)?
            .ok_or_else(|| Error::not_found(format!("Object {name}")))?;
        Ok(meta.len())
    }

    /// Delete a loose object.  The prune engine is the sole caller that
    /// should do this for reachable-set reasons.
    pub fn delete_object(&self, name: &ObjectName) -> Result<()> {
        let path = self.object_relpath(name);
        self.dir
            .remove_file(&path)
            .with_context(|| format!("Deleting {name}"))?;
        Ok(())
    }

    /// Explicitly delete a commit object, leaving a tombstone if the
    /// repository is configured for them.
    pub fn delete_commit(&self, checksum: &Checksum) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        self.delete_object(&ObjectName::new(*checksum, ObjectType::Commit))?;
        self.set_commit_partial(checksum, false)?;
        if self.config.tombstone_commits {
            let txn = self.prepare_transaction(None)?;
            let _ = txn.write_metadata(
                ObjectType::TombstoneCommit,
                Some(checksum),
                checksum.as_bytes(),
            )?;
            let _ = txn.commit(None)?;
        }
        Ok(())
    }

    /// Load the raw bytes of a metadata object.
    pub fn load_metadata(&self, name: &ObjectName) -> Result<Vec<u8>> {
        anyhow::ensure!(name.objtype.is_meta(), "Not a metadata object: {name}");
        let path = self.object_relpath(name);
        let data = match self.dir.open_optional(&path)? {
            Some(mut f) => {
                let mut buf = Vec::new();
                let n = f
                    .by_ref()
                    .take(MAX_METADATA_SIZE as u64 + 1)
                    .read_to_end(&mut buf)?;
                if n > MAX_METADATA_SIZE {
                    return Err(Error::corrupted(format!(
                        "Object {name} exceeds maximum metadata size"
                    )));
                }
                buf
            }
            None => return Err(Error::not_found(format!("Object {name}"))),
        };
        Ok(data)
    }

    /// Load and parse a commit object.
    pub fn load_commit(&self, checksum: &Checksum) -> Result<Commit> {
        let name = ObjectName::new(*checksum, ObjectType::Commit);
        let data = self.load_metadata(&name)?;
        Commit::parse(&data).with_context(|| format!("Parsing {name}"))
    }

    /// Load and parse a dirtree object.
    pub fn load_dirtree(&self, checksum: &Checksum) -> Result<DirTree> {
        let name = ObjectName::new(*checksum, ObjectType::DirTree);
        let data = self.load_metadata(&name)?;
        DirTree::parse(&data).with_context(|| format!("Parsing {name}"))
    }

    /// Load and parse a dirmeta object.
    pub fn load_dirmeta(&self, checksum: &Checksum) -> Result<DirMeta> {
        let name = ObjectName::new(*checksum, ObjectType::DirMeta);
        let data = self.load_metadata(&name)?;
        DirMeta::parse(&data).with_context(|| format!("Parsing {name}"))
    }

    fn load_bare_xattrs(&self, path: &Utf8Path) -> Result<Xattrs> {
        let f = self
            .dir
            .open(path)
            .with_context(|| format!("Opening {path}"))?;
        xattrs::fget_all(&f)
    }

    fn load_split_xattrs(&self, checksum: &Checksum) -> Result<Xattrs> {
        let link = ObjectName::new(*checksum, ObjectType::FileXattrsLink);
        let link_path = self.object_relpath(&link);
        match self.dir.symlink_metadata_optional(&link_path)? {
            None => Ok(Vec::new()),
            Some(_) => {
                let target = self.dir.read_link(&link_path)?;
                let target = Utf8PathBuf::try_from(target).context("Non-UTF-8 link target")?;
                let name = target
                    .file_name()
                    .and_then(|n| n.strip_suffix(".file-xattrs"))
                    .ok_or_else(|| Error::corrupted(format!("Invalid xattr link {link_path}")))?;
                let prefix = target
                    .parent()
                    .and_then(|p| p.file_name())
                    .ok_or_else(|| Error::corrupted(format!("Invalid xattr link {link_path}")))?;
                let csum = Checksum::from_hex(&format!("{prefix}{name}"))?;
                let data =
                    self.load_metadata(&ObjectName::new(csum, ObjectType::FileXattrs))?;
                crate::objects::parse_xattrs(&data)
            }
        }
    }

    /// Load a file content object, returning its metadata header and
    /// payload bytes.  For symlinks the payload is empty and the target
    /// is carried in the header.
    pub fn load_file(&self, checksum: &Checksum) -> Result<(FileHeader, Vec<u8>)> {
        let (header, size) = self.query_file_info(checksum)?;
        if header.is_symlink() {
            return Ok((header, Vec::new()));
        }
        let name = ObjectName::new(*checksum, ObjectType::File);
        let path = self.object_relpath(&name);
        let payload = match self.config.mode {
            RepoMode::Archive => {
                let mut f = self.dir.open(&path)?;
                let _ = read_framed_header(&mut f)
                    .with_context(|| format!("Reading header of {name}"))?;
                let mut payload = Vec::new();
                let n = flate2::read::DeflateDecoder::new(f)
                    .take(size + 1)
                    .read_to_end(&mut payload)
                    .with_context(|| format!("Decompressing {name}"))?;
                if n as u64 != size {
                    return Err(Error::corrupted(format!(
                        "Object {name}: payload size {n} does not match declared {size}"
                    )));
                }
                payload
            }
            _ => self.dir.read(&path)?,
        };
        Ok((header, payload))
    }

    /// Load just the payload bytes of a regular-file content object.
    pub fn load_file_content(&self, checksum: &Checksum) -> Result<Vec<u8>> {
        Ok(self.load_file(checksum)?.1)
    }

    /// Query the metadata header and uncompressed payload size of a
    /// file content object without reading its payload.
    pub fn query_file_info(&self, checksum: &Checksum) -> Result<(FileHeader, u64)> {
        let name = ObjectName::new(*checksum, ObjectType::File);
        let path = self.object_relpath(&name);
        let meta = self
            .dir
            .symlink_metadata_optional(&path)?
            .ok_or_else(|| Error::not_found(format!("Object {name}")))?;
        match self.config.mode {
            RepoMode::Archive => {
                let mut f = self.dir.open(&path)?;
                let record = read_framed_header(&mut f)
                    .with_context(|| format!("Reading header of {name}"))?;
                let (header, size) = FileHeader::parse_archive(&record)
                    .with_context(|| format!("Parsing {name}"))?;
                let size = if header.is_symlink() { 0 } else { size };
                Ok((header, size))
            }
            RepoMode::Bare => {
                if meta.is_symlink() {
                    let target = self.read_link_utf8(&path)?;
                    use cap_std::fs::MetadataExt;
                    Ok((
                        FileHeader::new_symlink(meta.uid(), meta.gid(), target.as_str()),
                        0,
                    ))
                } else {
                    use cap_std::fs::MetadataExt;
                    let xattrs = self.load_bare_xattrs(&path)?;
                    let header = FileHeader {
                        uid: meta.uid(),
                        gid: meta.gid(),
                        mode: meta.mode(),
                        symlink_target: String::new(),
                        xattrs,
                    };
                    Ok((header, meta.len()))
                }
            }
            RepoMode::BareUser | RepoMode::BareSplitXattrs => {
                let f = self.dir.open(&path)?;
                let metabuf = xattrs::fget(&f, USER_META_XATTR)
                    .with_context(|| format!("Reading metadata xattr of {name}"))?;
                let (uid, gid, mode, mut xattrs) = parse_filemeta(&metabuf)
                    .with_context(|| format!("Parsing metadata xattr of {name}"))?;
                if self.config.mode == RepoMode::BareSplitXattrs {
                    xattrs = self.load_split_xattrs(checksum)?;
                }
                if mode & libc::S_IFMT == libc::S_IFLNK {
                    drop(f);
                    let target = String::from_utf8(self.dir.read(&path)?)
                        .context("Non-UTF-8 symlink target")?;
                    let header = FileHeader {
                        uid,
                        gid,
                        mode,
                        symlink_target: target,
                        xattrs,
                    };
                    Ok((header, 0))
                } else {
                    let header = FileHeader {
                        uid,
                        gid,
                        mode,
                        symlink_target: String::new(),
                        xattrs,
                    };
                    Ok((header, meta.len()))
                }
            }
            RepoMode::BareUserOnly => {
                if meta.is_symlink() {
                    let target = self.read_link_utf8(&path)?;
                    Ok((FileHeader::new_symlink(0, 0, target.as_str()), 0))
                } else {
                    use cap_std::fs::MetadataExt;
                    let header = FileHeader {
                        uid: 0,
                        gid: 0,
                        mode: libc::S_IFREG | (meta.mode() & 0o7777),
                        symlink_target: String::new(),
                        xattrs: Vec::new(),
                    };
                    Ok((header, meta.len()))
                }
            }
        }
    }

    fn read_link_utf8(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let t = self.dir.read_link(path)?;
        Utf8PathBuf::try_from(t).context("Non-UTF-8 symlink target")
    }

    /// Enumerate all loose objects.
    pub fn list_objects(&self) -> Result<std::collections::BTreeSet<ObjectName>> {
        let mut out = std::collections::BTreeSet::new();
        let objects = self.dir.open_dir(OBJECTS)?;
        for child in objects.entries()? {
            let child = child?;
            if !child.file_type()?.is_dir() {
                continue;
            }
            let prefix = child.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            if prefix.len() != 2 {
                continue;
            }
            let subdir = child.open_dir()?;
            for obj in subdir.entries()? {
                let obj = obj?;
                let fname = obj.file_name();
                let Some(fname) = fname.to_str() else {
                    continue;
                };
                let Some((rest, ext)) = fname.split_once('.') else {
                    continue;
                };
                let objtype = match ObjectType::from_extension(ext) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                // Stray files that don't name a checksum are not ours.
                let Ok(checksum) = Checksum::from_hex(&format!("{prefix}{rest}")) else {
                    continue;
                };
                let _ = out.insert(ObjectName::new(checksum, objtype));
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Partial-commit state and detached metadata
    // ------------------------------------------------------------------

    fn commitpartial_path(checksum: &Checksum) -> Utf8PathBuf {
        format!("{STATE}/{checksum}.commitpartial").into()
    }

    /// Mark or clear the partial state of a commit.
    pub fn set_commit_partial(&self, checksum: &Checksum, partial: bool) -> Result<()> {
        let path = Self::commitpartial_path(checksum);
        if partial {
            self.dir.atomic_write(&path, b"")?;
        } else {
            match self.dir.remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether the commit's transitive closure may be incomplete.
    pub fn commit_is_partial(&self, checksum: &Checksum) -> Result<bool> {
        Ok(self
            .dir
            .symlink_metadata_optional(Self::commitpartial_path(checksum))?
            .is_some())
    }

    /// Read detached metadata for a commit, if any.
    pub fn read_commit_detached_metadata(
        &self,
        checksum: &Checksum,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let name = ObjectName::new(*checksum, ObjectType::CommitMeta);
        match self.load_metadata(&name) {
            Ok(data) => match Value::parse("a{sv}", &data)
                .with_context(|| format!("Parsing {name}"))?
            {
                Value::Dict(d) => Ok(Some(d)),
                _ => unreachable!("a{{sv}} parses to a dict"),
            },
            Err(e) if crate::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace (or with `None`, delete) the detached metadata of a
    /// commit.  Not part of the commit's hash; may be updated at any
    /// time, e.g. to attach signatures.
    pub fn write_commit_detached_metadata(
        &self,
        checksum: &Checksum,
        metadata: Option<&BTreeMap<String, Value>>,
    ) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let name = ObjectName::new(*checksum, ObjectType::CommitMeta);
        let path = self.object_relpath(&name);
        match metadata {
            Some(m) => {
                let data = Value::Dict(m.clone()).serialize()?;
                if let Some(parent) = path.parent() {
                    self.dir.create_dir_all(parent)?;
                }
                self.dir.atomic_write(&path, &data)?;
            }
            None => match self.dir.remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Refs
    // ------------------------------------------------------------------

    fn ref_relpath(&self, refspec: &str) -> Result<Utf8PathBuf> {
        let (remote, r) = crate::refs::parse_refspec(refspec)?;
        Ok(match remote {
            Some(remote) => format!("refs/remotes/{remote}/{r}").into(),
            None => format!("refs/heads/{r}").into(),
        })
    }

    /// Read one ref, returning `None` if it does not exist.
    pub fn try_resolve_ref(&self, refspec: &str) -> Result<Option<Checksum>> {
        let path = self.ref_relpath(refspec)?;
        let contents = match self.dir.open_optional(&path)? {
            Some(mut f) => {
                let mut s = String::new();
                let _ = f.read_to_string(&mut s)?;
                s
            }
            None => return Ok(None),
        };
        let contents = contents.trim_end_matches('\n');
        Ok(Some(Checksum::from_hex(contents).with_context(|| {
            format!("Parsing ref {refspec}")
        })?))
    }

    /// Resolve a revision: either a full hex checksum or a refspec.
    pub fn resolve_rev(&self, rev: &str) -> Result<Checksum> {
        if rev.len() == crate::checksum::HEX_LEN {
            if let Ok(c) = Checksum::from_hex(rev) {
                return Ok(c);
            }
        }
        self.try_resolve_ref(rev)?
            .ok_or_else(|| Error::not_found(format!("Ref {rev}")))
    }

    /// Atomically point `refspec` at a commit, or delete it with
    /// `None`.  The commit must exist and parse.
    pub fn set_ref(&self, refspec: &str, target: Option<&Checksum>) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let path = self.ref_relpath(refspec)?;
        match target {
            Some(checksum) => {
                // Refs must point at existing, structurally valid commits.
                let _ = self.load_commit(checksum)?;
                if let Some(parent) = path.parent() {
                    self.dir.create_dir_all(parent)?;
                }
                self.dir
                    .atomic_write(&path, format!("{checksum}\n").as_bytes())?;
            }
            None => match self.dir.remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    /// Like [`Self::set_ref`], but fails with `AlreadyExists` if the
    /// ref is already present.
    pub fn create_ref(&self, refspec: &str, target: &Checksum) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        if self.try_resolve_ref(refspec)?.is_some() {
            return Err(Error::AlreadyExists(format!("Ref {refspec}")).into());
        }
        self.set_ref(refspec, Some(target))
    }

    /// Atomically point a collection-scoped mirror ref at a commit.
    pub fn set_collection_ref(
        &self,
        collection_id: &str,
        r: &str,
        target: Option<&Checksum>,
    ) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        validate_collection_id(collection_id)?;
        validate_ref(r)?;
        let path = Utf8PathBuf::from(format!("refs/mirrors/{collection_id}/{r}"));
        match target {
            Some(checksum) => {
                let _ = self.load_commit(checksum)?;
                if let Some(parent) = path.parent() {
                    self.dir.create_dir_all(parent)?;
                }
                self.dir
                    .atomic_write(&path, format!("{checksum}\n").as_bytes())?;
            }
            None => self.dir.remove_file(&path)?,
        }
        Ok(())
    }

    pub(crate) fn list_refs_in_base(
        &self,
        base: &Utf8Path,
        out: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        fn walk(
            dir: &Dir,
            prefix: &mut Vec<String>,
            out: &mut BTreeMap<String, String>,
        ) -> Result<()> {
            for child in dir.entries()? {
                let child = child?;
                let name = child.file_name();
                let name = name
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid non-UTF-8 ref name {name:?}"))?
                    .to_string();
                if child.file_type()?.is_dir() {
                    prefix.push(name);
                    walk(&child.open_dir()?, prefix, out)?;
                    let _ = prefix.pop();
                } else {
                    let mut contents = String::new();
                    let _ = child.open()?.read_to_string(&mut contents)?;
                    let refname = if prefix.is_empty() {
                        name
                    } else {
                        format!("{}/{}", prefix.join("/"), name)
                    };
                    out.insert(refname, contents.trim_end_matches('\n').to_string());
                }
            }
            Ok(())
        }
        match self.dir.open_dir(base) {
            Ok(d) => walk(&d, &mut Vec::new(), out),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate refs as a sorted name → hex-checksum map.  With a
    /// `remote:` prefix, lists that remote's mirrored refs; otherwise
    /// lists local heads, optionally restricted to a prefix directory.
    pub fn list_refs(&self, prefix: Option<&str>) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        match prefix {
            None => self.list_refs_in_base(Utf8Path::new("refs/heads"), &mut out)?,
            Some(p) => match p.split_once(':') {
                Some((remote, rest)) => {
                    validate_remote_name(remote)?;
                    let base = if rest.is_empty() {
                        format!("refs/remotes/{remote}")
                    } else {
                        validate_ref(rest)?;
                        format!("refs/remotes/{remote}/{rest}")
                    };
                    self.list_refs_in_base(Utf8Path::new(&base), &mut out)?;
                }
                None => {
                    validate_ref(p)?;
                    self.list_refs_in_base(Utf8Path::new(&format!("refs/heads/{p}")), &mut out)?;
                }
            },
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Remotes
    // ------------------------------------------------------------------

    fn remote_section(name: &str) -> String {
        format!("remote \"{name}\"")
    }

    /// Add a remote to the repository configuration.
    #[context("Adding remote {name}")]
    pub fn add_remote(&self, name: &str, url: &str, gpg_verify: bool) -> Result<()> {
        validate_remote_name(name)?;
        let contents = self.dir.read_to_string(CONFIG)?;
        let ini = tini::Ini::from_string(&contents).context("Parsing repo config")?;
        if ini
            .get::<String>(&Self::remote_section(name), "url")
            .is_some()
        {
            return Err(Error::AlreadyExists(format!("Remote {name}")).into());
        }
        let ini = ini
            .section(Self::remote_section(name))
            .item("url", url)
            .item("gpg-verify", if gpg_verify { "true" } else { "false" })
            .item("gpg-verify-summary", "false");
        self.dir.atomic_write(CONFIG, ini.to_string().into_bytes())?;
        Ok(())
    }

    /// Remove a remote, its mirrored refs, and its summary-cache
    /// entries.
    #[context("Removing remote {name}")]
    pub fn remove_remote(&self, name: &str) -> Result<()> {
        validate_remote_name(name)?;
        let contents = self.dir.read_to_string(CONFIG)?;
        let header = format!("[{}]", Self::remote_section(name));
        if !contents.lines().any(|l| l.trim() == header) {
            return Err(Error::not_found(format!("Remote {name}")));
        }
        // Drop the section textually; tini has no section removal.
        let mut out = String::new();
        let mut skipping = false;
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed == header {
                skipping = true;
                continue;
            }
            if skipping && trimmed.starts_with('[') {
                skipping = false;
            }
            if !skipping {
                out.push_str(line);
                out.push('\n');
            }
        }
        self.dir.atomic_write(CONFIG, out.as_bytes())?;
        let _ = self
            .dir
            .remove_all_optional(format!("refs/remotes/{name}"))?;
        for cached in [name.to_string(), format!("{name}.sig")] {
            let _ = self
                .dir
                .remove_file_optional(format!("{SUMMARY_CACHE}/{cached}"))?;
        }
        Ok(())
    }

    /// Enumerate configured remotes.
    pub fn list_remotes(&self) -> Result<Vec<RemoteConfig>> {
        let contents = self.dir.read_to_string(CONFIG)?;
        let ini = tini::Ini::from_string(&contents).context("Parsing repo config")?;
        let mut out = Vec::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            let Some(name) = trimmed
                .strip_prefix("[remote \"")
                .and_then(|r| r.strip_suffix("\"]"))
            else {
                continue;
            };
            let section = Self::remote_section(name);
            let url = ini.get::<String>(&section, "url").unwrap_or_default();
            let gpg_verify = ini
                .get::<String>(&section, "gpg-verify")
                .map(|v| v == "true")
                .unwrap_or(true);
            let gpg_verify_summary = ini
                .get::<String>(&section, "gpg-verify-summary")
                .map(|v| v == "true")
                .unwrap_or(false);
            out.push(RemoteConfig {
                name: name.to_string(),
                url,
                gpg_verify,
                gpg_verify_summary,
            });
        }
        Ok(out)
    }

    /// Look up one remote.
    pub fn get_remote(&self, name: &str) -> Result<RemoteConfig> {
        self.list_remotes()?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::not_found(format!("Remote {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("123").unwrap(), 123);
        assert_eq!(parse_size("1kB").unwrap(), 1000);
        assert_eq!(parse_size("2MB").unwrap(), 2_000_000);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert!(parse_size("1XB").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_mode_strings() {
        for m in [
            RepoMode::Bare,
            RepoMode::BareUser,
            RepoMode::BareUserOnly,
            RepoMode::BareSplitXattrs,
            RepoMode::Archive,
        ] {
            assert_eq!(RepoMode::from_str(m.as_str()).unwrap(), m);
        }
        assert_eq!(
            RepoMode::from_str("archive-z2").unwrap(),
            RepoMode::Archive
        );
        assert!(RepoMode::from_str("tarball").is_err());
        // The integer values are ABI.
        assert_eq!(RepoMode::Bare as u32, 0);
        assert_eq!(RepoMode::Archive as u32, 4);
    }

    #[test]
    fn test_config_parse() {
        let config = RepoConfig::parse(indoc::indoc! { "
            [core]
            repo_version=1
            mode=archive
            min-free-space-percent=5
        "})
        .unwrap();
        assert_eq!(config.mode, RepoMode::Archive);
        assert_eq!(config.min_free_space_percent, Some(5));
        assert!(RepoConfig::parse("[core]\nrepo_version=2\nmode=bare\n").is_err());
        assert!(RepoConfig::parse(indoc::indoc! { "
            [core]
            repo_version=1
            min-free-space-percent=5
            min-free-space-size=1MB
        "})
        .is_err());
    }
}
