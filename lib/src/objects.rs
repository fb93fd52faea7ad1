//! The four object kinds and their canonical serializations.
//!
//! A file content object is transmitted as a 4-byte big-endian header
//! length, 4 zero padding bytes, the header record, then the (possibly
//! compressed) payload.  Metadata objects (commit, dirtree, dirmeta)
//! are stored as the raw canonical record with no framing.  The
//! checksum of a file content object is computed over the framed
//! uncompressed header concatenated with the uncompressed payload; for
//! metadata objects it is the record itself.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use anyhow::Context;

use crate::checksum::{optional_checksum, required_checksum, sha256, Checksum, Hasher};
use crate::error::Error;
use crate::util::quashed;
use crate::variant::{array_variable, parse_string, ArrayBuilder, TupleBuilder, TupleReader, Value};
use crate::Result;

/// Limit on metadata objects (dirtree/dirmeta/commit); anything larger
/// is treated as corrupt rather than read into memory.
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

/// The kinds of loose objects.  The integer values are wire format
/// (used in static-delta part headers and fallback entries) and must
/// not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// File content (regular file or symlink) with its metadata header.
    File = 1,
    /// A directory's children.
    DirTree = 2,
    /// A directory's own permission metadata.
    DirMeta = 3,
    /// A commit.
    Commit = 4,
    /// Marker left behind when a commit is explicitly deleted.
    TombstoneCommit = 5,
    /// Detached commit metadata, not part of the commit's hash.
    CommitMeta = 6,
    /// Link to another object's payload, used for content deduplication.
    PayloadLink = 7,
    /// A standalone xattr record addressed by its own checksum.
    FileXattrs = 8,
    /// Per-file link to a [`ObjectType::FileXattrs`] object.
    FileXattrsLink = 9,
}

impl ObjectType {
    /// Parse from the wire byte.
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::File,
            2 => Self::DirTree,
            3 => Self::DirMeta,
            4 => Self::Commit,
            5 => Self::TombstoneCommit,
            6 => Self::CommitMeta,
            7 => Self::PayloadLink,
            8 => Self::FileXattrs,
            9 => Self::FileXattrsLink,
            o => return Err(Error::corrupted(format!("Invalid object type {o}"))),
        })
    }

    /// The filename extension in the loose object layout.  Archive
    /// repositories store file content as `filez` instead of `file`.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::DirTree => "dirtree",
            Self::DirMeta => "dirmeta",
            Self::Commit => "commit",
            Self::TombstoneCommit => "tombstone-commit",
            Self::CommitMeta => "commitmeta",
            Self::PayloadLink => "payload-link",
            Self::FileXattrs => "file-xattrs",
            Self::FileXattrsLink => "file-xattrs-link",
        }
    }

    /// Inverse of [`Self::extension`]; also accepts the archive `filez`
    /// encoding of file content.
    pub fn from_extension(ext: &str) -> Result<Self> {
        Ok(match ext {
            "file" | "filez" => Self::File,
            "dirtree" => Self::DirTree,
            "dirmeta" => Self::DirMeta,
            "commit" => Self::Commit,
            "tombstone-commit" => Self::TombstoneCommit,
            "commitmeta" => Self::CommitMeta,
            "payload-link" => Self::PayloadLink,
            "file-xattrs" => Self::FileXattrs,
            "file-xattrs-link" => Self::FileXattrsLink,
            o => {
                return Err(Error::corrupted(format!(
                    "Invalid object extension {}",
                    quashed(o.as_bytes())
                )))
            }
        })
    }

    /// Whether objects of this type are canonical metadata records
    /// (hashed without framing).
    pub fn is_meta(&self) -> bool {
        !matches!(self, Self::File)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A (checksum, type) pair: the full name of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName {
    /// Content address.
    pub checksum: Checksum,
    /// Object kind.
    pub objtype: ObjectType,
}

impl ObjectName {
    /// Construct from parts.
    pub fn new(checksum: Checksum, objtype: ObjectType) -> Self {
        Self { checksum, objtype }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.checksum, self.objtype)
    }
}

/// Extended attributes as (name, value) byte pairs.
pub type Xattrs = Vec<(Vec<u8>, Vec<u8>)>;

pub(crate) fn xattrs_to_bytes(xattrs: &Xattrs) -> Vec<u8> {
    let mut b = ArrayBuilder::new(1, None);
    for (name, value) in xattrs {
        let mut entry = TupleBuilder::new();
        entry.push_variable(1, name);
        entry.push_variable(1, value);
        b.push(&entry.finish());
    }
    b.finish()
}

pub(crate) fn parse_xattrs(data: &[u8]) -> Result<Xattrs> {
    let mut out = Vec::new();
    for entry in array_variable(data, 1)? {
        let mut r = TupleReader::new(entry, 1)?;
        let name = r.field_variable(1)?.to_vec();
        let value = r.field_last(1)?.to_vec();
        out.push((name, value));
    }
    Ok(out)
}

/// Validate one child name inside a dirtree.
pub(crate) fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
    {
        return Err(Error::corrupted(format!(
            "Invalid filename {:?}",
            quashed(name.as_bytes())
        )));
    }
    Ok(())
}

/// Permission metadata of one directory: `(uuu a(ayay))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMeta {
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Full stat mode; the directory bit must be set.
    pub mode: u32,
    /// Extended attributes.
    pub xattrs: Xattrs,
}

impl DirMeta {
    /// The default metadata for directories created by tooling:
    /// root-owned 0755.
    pub fn default_dir() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: libc::S_IFDIR | 0o755,
            xattrs: Vec::new(),
        }
    }

    /// Serialize to the canonical record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut t = TupleBuilder::new();
        t.push_fixed(4, &self.uid.to_be_bytes());
        t.push_fixed(4, &self.gid.to_be_bytes());
        t.push_fixed(4, &self.mode.to_be_bytes());
        t.push_variable(1, &xattrs_to_bytes(&self.xattrs));
        t.finish()
    }

    /// Parse and validate the canonical record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = TupleReader::new(data, 0)?;
        let uid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let xattrs = parse_xattrs(r.field_last(1)?)?;
        if mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(Error::corrupted(format!(
                "Invalid directory metadata mode {mode:o}; expected a directory"
            )));
        }
        if mode & !(libc::S_IFMT | 0o7777) != 0 {
            return Err(Error::corrupted(format!(
                "Invalid directory metadata mode {mode:o}; unexpected permission bits"
            )));
        }
        Ok(Self {
            uid,
            gid,
            mode,
            xattrs,
        })
    }

    /// The content address of this record.
    pub fn checksum(&self) -> Result<Checksum> {
        sha256(&self.to_bytes())
    }
}

/// One regular-file or symlink child of a dirtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Child name.
    pub name: String,
    /// Content object checksum.
    pub checksum: Checksum,
}

/// One subdirectory child of a dirtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDir {
    /// Child name.
    pub name: String,
    /// Checksum of the subdirectory's dirtree.
    pub tree_checksum: Checksum,
    /// Checksum of the subdirectory's dirmeta.
    pub meta_checksum: Checksum,
}

/// A directory's children: `(a(say) a(sayay))`, both arrays sorted by
/// name in ascending byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirTree {
    /// Non-directory children.
    pub files: Vec<TreeFile>,
    /// Subdirectory children.
    pub dirs: Vec<TreeDir>,
}

impl DirTree {
    /// Serialize to the canonical record.  Children are written in
    /// sorted order; the caller is expected to have sorted them (the
    /// builder APIs do).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut files = ArrayBuilder::new(1, None);
        for f in &self.files {
            let mut t = TupleBuilder::new();
            t.push_str(&f.name);
            t.push_variable(1, f.checksum.as_bytes());
            files.push(&t.finish());
        }
        let mut dirs = ArrayBuilder::new(1, None);
        for d in &self.dirs {
            let mut t = TupleBuilder::new();
            t.push_str(&d.name);
            t.push_variable(1, d.tree_checksum.as_bytes());
            t.push_variable(1, d.meta_checksum.as_bytes());
            dirs.push(&t.finish());
        }
        let mut t = TupleBuilder::new();
        t.push_variable(1, &files.finish());
        t.push_variable(1, &dirs.finish());
        t.finish()
    }

    /// Parse and validate the canonical record: names must be valid,
    /// unique and sorted, and child checksums exactly 32 bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = TupleReader::new(data, 1)?;
        let mut files = Vec::new();
        for elem in array_variable(r.field_variable(1)?, 1)? {
            let mut er = TupleReader::new(elem, 1)?;
            let name = parse_string(er.field_variable(1)?)?;
            validate_filename(&name)?;
            let checksum = required_checksum(er.field_last(1)?)?;
            files.push(TreeFile { name, checksum });
        }
        let mut dirs = Vec::new();
        for elem in array_variable(r.field_last(1)?, 1)? {
            let mut er = TupleReader::new(elem, 2)?;
            let name = parse_string(er.field_variable(1)?)?;
            validate_filename(&name)?;
            let tree_checksum = required_checksum(er.field_variable(1)?)?;
            let meta_checksum = required_checksum(er.field_last(1)?)?;
            dirs.push(TreeDir {
                name,
                tree_checksum,
                meta_checksum,
            });
        }
        for w in files.windows(2) {
            if w[0].name >= w[1].name {
                return Err(Error::corrupted("Unsorted dirtree file entries"));
            }
        }
        for w in dirs.windows(2) {
            if w[0].name >= w[1].name {
                return Err(Error::corrupted("Unsorted dirtree directory entries"));
            }
        }
        Ok(Self { files, dirs })
    }

    /// The content address of this record.
    pub fn checksum(&self) -> Result<Checksum> {
        sha256(&self.to_bytes())
    }
}

/// A commit: `(a{sv} ay a(say) s s t ay ay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Schemaless metadata, hashed into the commit.
    pub metadata: BTreeMap<String, Value>,
    /// Parent commit, forming a DAG.
    pub parent: Option<Checksum>,
    /// Related objects: (name, checksum) pairs.
    pub related: Vec<(String, Checksum)>,
    /// One-line summary.
    pub subject: String,
    /// Long-form description.
    pub body: String,
    /// Seconds since the epoch, unsigned.
    pub timestamp: u64,
    /// Root dirtree checksum.
    pub root_tree: Checksum,
    /// Root dirmeta checksum.
    pub root_meta: Checksum,
}

impl Commit {
    /// Serialize to the canonical record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut t = TupleBuilder::new();
        t.push_variable(8, &Value::Dict(self.metadata.clone()).serialize()?);
        let parent: &[u8] = match &self.parent {
            Some(c) => c.as_bytes(),
            None => &[],
        };
        t.push_variable(1, parent);
        let mut related = ArrayBuilder::new(1, None);
        for (name, csum) in &self.related {
            let mut e = TupleBuilder::new();
            e.push_str(name);
            e.push_variable(1, csum.as_bytes());
            related.push(&e.finish());
        }
        t.push_variable(1, &related.finish());
        t.push_str(&self.subject);
        t.push_str(&self.body);
        t.push_fixed(8, &self.timestamp.to_be_bytes());
        t.push_variable(1, self.root_tree.as_bytes());
        t.push_variable(1, self.root_meta.as_bytes());
        Ok(t.finish())
    }

    /// Parse and validate the canonical record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = TupleReader::new(data, 6)?;
        let metadata = match Value::parse("a{sv}", r.field_variable(8)?)
            .context("Parsing commit metadata")?
        {
            Value::Dict(d) => d,
            _ => unreachable!("a{{sv}} parses to a dict"),
        };
        let parent = optional_checksum(r.field_variable(1)?)?;
        let mut related = Vec::new();
        for elem in array_variable(r.field_variable(1)?, 1)? {
            let mut er = TupleReader::new(elem, 1)?;
            let name = parse_string(er.field_variable(1)?)?;
            let csum = required_checksum(er.field_last(1)?)?;
            related.push((name, csum));
        }
        let subject = parse_string(r.field_variable(1)?)?;
        let body = parse_string(r.field_variable(1)?)?;
        let timestamp = u64::from_be_bytes(r.field_fixed(8, 8)?.try_into().unwrap());
        let root_tree = required_checksum(r.field_variable(1)?)?;
        let root_meta = required_checksum(r.field_last(1)?)?;
        Ok(Self {
            metadata,
            parent,
            related,
            subject,
            body,
            timestamp,
            root_tree,
            root_meta,
        })
    }

    /// The commit's own content address.
    pub fn checksum(&self) -> Result<Checksum> {
        sha256(&self.to_bytes()?)
    }

    /// The commit's *content* checksum: SHA-256 over the concatenated
    /// root dirtree and root dirmeta checksums.  Two commits whose only
    /// differences are metadata or timestamp compare equal under this.
    pub fn content_checksum(&self) -> Result<Checksum> {
        let mut h = Hasher::new()?;
        h.update(self.root_tree.as_bytes())?;
        h.update(self.root_meta.as_bytes())?;
        h.finish()
    }
}

/// The metadata header of a file content object.
///
/// The uncompressed layout is `(uuuus a(ayay))`; the archive layout
/// `(tuuuus a(ayay))` additionally carries the uncompressed payload
/// size.  The rdev field is reserved: always written 0, and a non-zero
/// value on read is a corruption error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Full stat mode; must be a regular file or symlink.
    pub mode: u32,
    /// Symlink target; empty for regular files.
    pub symlink_target: String,
    /// Extended attributes.
    pub xattrs: Xattrs,
}

impl FileHeader {
    /// A header for a plain regular file.
    pub fn new_regular(uid: u32, gid: u32, perms: u32) -> Self {
        Self {
            uid,
            gid,
            mode: libc::S_IFREG | (perms & 0o7777),
            ..Default::default()
        }
    }

    /// A header for a symlink; the link mode is fixed at 0777.
    pub fn new_symlink(uid: u32, gid: u32, target: &str) -> Self {
        Self {
            uid,
            gid,
            mode: libc::S_IFLNK | 0o777,
            symlink_target: target.to_string(),
            ..Default::default()
        }
    }

    /// Whether this object is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    fn validate(&self) -> Result<()> {
        let fmt = self.mode & libc::S_IFMT;
        if fmt != libc::S_IFREG && fmt != libc::S_IFLNK {
            return Err(Error::corrupted(format!(
                "Invalid file object mode {:o}; expected regular file or symlink",
                self.mode
            )));
        }
        Ok(())
    }

    /// Serialize the uncompressed-variant record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut t = TupleBuilder::new();
        t.push_fixed(4, &self.uid.to_be_bytes());
        t.push_fixed(4, &self.gid.to_be_bytes());
        t.push_fixed(4, &self.mode.to_be_bytes());
        t.push_fixed(4, &0u32.to_be_bytes());
        t.push_str(&self.symlink_target);
        t.push_variable(1, &xattrs_to_bytes(&self.xattrs));
        t.finish()
    }

    /// Serialize the archive-variant record, which prefixes the
    /// uncompressed payload size.
    pub fn to_archive_bytes(&self, size: u64) -> Vec<u8> {
        let mut t = TupleBuilder::new();
        t.push_fixed(8, &size.to_be_bytes());
        t.push_fixed(4, &self.uid.to_be_bytes());
        t.push_fixed(4, &self.gid.to_be_bytes());
        t.push_fixed(4, &self.mode.to_be_bytes());
        t.push_fixed(4, &0u32.to_be_bytes());
        t.push_str(&self.symlink_target);
        t.push_variable(1, &xattrs_to_bytes(&self.xattrs));
        t.finish()
    }

    /// Parse the uncompressed-variant record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = TupleReader::new(data, 1)?;
        let uid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let rdev = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let symlink_target = parse_string(r.field_variable(1)?)?;
        let xattrs = parse_xattrs(r.field_last(1)?)?;
        if rdev != 0 {
            return Err(Error::corrupted(format!(
                "Invalid file object; unexpected rdev {rdev}"
            )));
        }
        let header = Self {
            uid,
            gid,
            mode,
            symlink_target,
            xattrs,
        };
        header.validate()?;
        Ok(header)
    }

    /// Parse the archive-variant record, returning the header and the
    /// declared uncompressed payload size.
    pub fn parse_archive(data: &[u8]) -> Result<(Self, u64)> {
        let mut r = TupleReader::new(data, 1)?;
        let size = u64::from_be_bytes(r.field_fixed(8, 8)?.try_into().unwrap());
        let uid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let gid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let mode = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let rdev = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
        let symlink_target = parse_string(r.field_variable(1)?)?;
        let xattrs = parse_xattrs(r.field_last(1)?)?;
        if rdev != 0 {
            return Err(Error::corrupted(format!(
                "Invalid file object; unexpected rdev {rdev}"
            )));
        }
        let header = Self {
            uid,
            gid,
            mode,
            symlink_target,
            xattrs,
        };
        header.validate()?;
        Ok((header, size))
    }
}

/// The metadata sidecar record used by the bare-user encodings:
/// `(uuu a(ayay))`, stored in the `user.treemeta` xattr of the payload
/// file rather than in the payload itself.
pub(crate) fn filemeta_to_bytes(uid: u32, gid: u32, mode: u32, xattrs: &Xattrs) -> Vec<u8> {
    let mut t = TupleBuilder::new();
    t.push_fixed(4, &uid.to_be_bytes());
    t.push_fixed(4, &gid.to_be_bytes());
    t.push_fixed(4, &mode.to_be_bytes());
    t.push_variable(1, &xattrs_to_bytes(xattrs));
    t.finish()
}

pub(crate) fn parse_filemeta(data: &[u8]) -> Result<(u32, u32, u32, Xattrs)> {
    let mut r = TupleReader::new(data, 0)?;
    let uid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
    let gid = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
    let mode = u32::from_be_bytes(r.field_fixed(4, 4)?.try_into().unwrap());
    let xattrs = parse_xattrs(r.field_last(1)?)?;
    Ok((uid, gid, mode, xattrs))
}

/// Write the framed form of a file header: 4-byte big-endian record
/// length, 4 zero bytes, then the record.  Returns the total number of
/// bytes written.
pub fn write_framed_header<W: Write>(w: &mut W, record: &[u8]) -> Result<usize> {
    let len: u32 = record
        .len()
        .try_into()
        .map_err(|_| Error::corrupted("Oversized file header"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&[0u8; 4])?;
    w.write_all(record)?;
    Ok(8 + record.len())
}

/// Read back a framed file header record.
pub fn read_framed_header<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut lenbuf = [0u8; 8];
    r.read_exact(&mut lenbuf)?;
    let len = u32::from_be_bytes(lenbuf[..4].try_into().unwrap()) as usize;
    if len > MAX_METADATA_SIZE {
        return Err(Error::corrupted(format!(
            "File header of {len} bytes exceeds maximum"
        )));
    }
    if lenbuf[4..] != [0, 0, 0, 0] {
        return Err(Error::corrupted("Invalid file header padding"));
    }
    let mut record = vec![0u8; len];
    r.read_exact(&mut record)?;
    Ok(record)
}

/// Compute the content checksum of a file object from its header and
/// payload reader; the hash covers the framed uncompressed header
/// followed by the raw payload bytes.
pub fn checksum_file_from_input<R: Read>(header: &FileHeader, payload: &mut R) -> Result<Checksum> {
    let mut h = Hasher::new()?;
    let record = header.to_bytes();
    let _ = write_framed_header(&mut h, &record)?;
    let _ = std::io::copy(payload, &mut h).context("Hashing file content")?;
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of_byte(b: u8) -> Checksum {
        Checksum::new([b; 32])
    }

    #[test]
    fn test_dirmeta_canonical() {
        // Root-owned 0755 directory with no xattrs: three big-endian
        // words and an empty array.
        let m = DirMeta::default_dir();
        let bytes = m.to_bytes();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x41, 0xed]
        );
        let parsed = DirMeta::parse(&bytes).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_dirmeta_rejects_nondir() {
        let m = DirMeta {
            uid: 0,
            gid: 0,
            mode: libc::S_IFREG | 0o644,
            xattrs: Vec::new(),
        };
        assert!(DirMeta::parse(&m.to_bytes()).is_err());
    }

    #[test]
    fn test_dirtree_roundtrip() {
        let t = DirTree {
            files: vec![
                TreeFile {
                    name: "a".into(),
                    checksum: checksum_of_byte(1),
                },
                TreeFile {
                    name: "b".into(),
                    checksum: checksum_of_byte(2),
                },
            ],
            dirs: vec![TreeDir {
                name: "sub".into(),
                tree_checksum: checksum_of_byte(3),
                meta_checksum: checksum_of_byte(4),
            }],
        };
        let bytes = t.to_bytes();
        let parsed = DirTree::parse(&bytes).unwrap();
        assert_eq!(parsed, t);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_dirtree_invalid_filename() {
        for name in ["../x", ".", "..", "", "a/b", "a\0b"] {
            let t = DirTree {
                files: vec![TreeFile {
                    name: name.into(),
                    checksum: checksum_of_byte(1),
                }],
                dirs: vec![],
            };
            let e = DirTree::parse(&t.to_bytes()).err().expect("parse should fail");
            if !name.is_empty() && !name.contains('\0') {
                assert!(
                    format!("{e:#}").contains("Invalid filename"),
                    "unexpected error for {name:?}: {e:#}"
                );
            }
        }
    }

    #[test]
    fn test_dirtree_unsorted_rejected() {
        let t = DirTree {
            files: vec![
                TreeFile {
                    name: "b".into(),
                    checksum: checksum_of_byte(1),
                },
                TreeFile {
                    name: "a".into(),
                    checksum: checksum_of_byte(2),
                },
            ],
            dirs: vec![],
        };
        assert!(DirTree::parse(&t.to_bytes()).is_err());
    }

    #[test]
    fn test_commit_roundtrip() {
        let mut metadata = BTreeMap::new();
        metadata.insert("version".to_string(), Value::String("41.1".into()));
        let c = Commit {
            metadata,
            parent: Some(checksum_of_byte(9)),
            related: vec![("runtime".into(), checksum_of_byte(8))],
            subject: "Test commit".into(),
            body: "A longer body.\n".into(),
            timestamp: 1_700_000_000,
            root_tree: checksum_of_byte(1),
            root_meta: checksum_of_byte(2),
        };
        let bytes = c.to_bytes().unwrap();
        let parsed = Commit::parse(&bytes).unwrap();
        assert_eq!(parsed, c);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
        // The timestamp lands big-endian on disk.
        let needle = 1_700_000_000u64.to_be_bytes();
        assert!(bytes.windows(8).any(|w| w == needle));
    }

    #[test]
    fn test_commit_content_checksum_ignores_metadata() {
        let base = Commit {
            metadata: BTreeMap::new(),
            parent: None,
            related: vec![],
            subject: "one".into(),
            body: "".into(),
            timestamp: 1_700_000_000,
            root_tree: checksum_of_byte(1),
            root_meta: checksum_of_byte(2),
        };
        let mut other = base.clone();
        other.subject = "two".into();
        other.timestamp += 100;
        assert_ne!(base.checksum().unwrap(), other.checksum().unwrap());
        assert_eq!(
            base.content_checksum().unwrap(),
            other.content_checksum().unwrap()
        );
    }

    #[test]
    fn test_file_header_roundtrip() {
        let h = FileHeader {
            uid: 1000,
            gid: 1000,
            mode: libc::S_IFREG | 0o644,
            symlink_target: String::new(),
            xattrs: vec![(b"user.test".to_vec(), b"value".to_vec())],
        };
        let bytes = h.to_bytes();
        let parsed = FileHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, h);

        let (parsed, size) = FileHeader::parse_archive(&h.to_archive_bytes(42)).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(size, 42);
    }

    #[test]
    fn test_file_header_rejects_rdev_and_mode() {
        // Corrupt the rdev field (bytes 12..16 of the record).
        let h = FileHeader::new_regular(0, 0, 0o644);
        let mut bytes = h.to_bytes();
        bytes[15] = 1;
        assert!(FileHeader::parse(&bytes).is_err());

        let dir = FileHeader {
            mode: libc::S_IFDIR | 0o755,
            ..Default::default()
        };
        assert!(FileHeader::parse(&dir.to_bytes()).is_err());
    }

    #[test]
    fn test_framed_header() {
        let h = FileHeader::new_symlink(0, 0, "target");
        let record = h.to_bytes();
        let mut framed = Vec::new();
        let n = write_framed_header(&mut framed, &record).unwrap();
        assert_eq!(n, framed.len());
        assert_eq!(&framed[..4], &(record.len() as u32).to_be_bytes());
        assert_eq!(&framed[4..8], &[0, 0, 0, 0]);
        let read = read_framed_header(&mut std::io::Cursor::new(&framed)).unwrap();
        assert_eq!(read, record);
    }

    #[test]
    fn test_checksum_file_from_input() {
        // The checksum covers the framed header plus payload; symlinks
        // hash the header alone.
        let h = FileHeader::new_regular(0, 0, 0o644);
        let c1 = checksum_file_from_input(&h, &mut &b"hello\n"[..]).unwrap();
        let c2 = checksum_file_from_input(&h, &mut &b"hello!"[..]).unwrap();
        assert_ne!(c1, c2);
        let l = FileHeader::new_symlink(0, 0, "a");
        let c3 = checksum_file_from_input(&l, &mut std::io::empty()).unwrap();
        assert_ne!(c1, c3);
    }
}
