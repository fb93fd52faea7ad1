//! Static deltas: a compact binary encoding of the objects a target
//! commit contains and a source commit does not.
//!
//! A delta comprises a superblock record plus numbered part files
//! (optionally inlined into the superblock), an optional signed
//! envelope binding the exact superblock bytes, and an optional
//! per-target index.  Each part decompresses to a mode table, an xattr
//! table, an opaque payload blob, and an opcode stream interpreted by
//! the executor.

mod apply;
mod bsdiff;
mod generate;
mod rollsum;

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::Context;
use camino::Utf8PathBuf;

use crate::checksum::{optional_checksum, required_checksum, Checksum};
use crate::error::Error;
use crate::objects::{Commit, ObjectName, ObjectType, Xattrs};
use crate::repo::Repo;
use crate::variant::{array_fixed, array_variable, ArrayBuilder, TupleBuilder, TupleReader, Value};
use crate::Result;

pub use apply::{apply_delta, apply_delta_from_path, ApplyOptions, ApplyStats};
pub use generate::{generate_delta, DeltaCompression, DeltaGenerateOptions};
pub(crate) use bsdiff::{bsdiff, bspatch};

#[cfg(feature = "internal-testing-api")]
pub mod test_support {
    //! Hand-assembly of delta parts, for exercising the executor's
    //! validation paths from tests.

    use super::*;
    use crate::checksum::sha256;

    /// Builds a single raw part from explicit opcodes.
    #[derive(Debug, Default)]
    pub struct PartAssembler {
        payload: Vec<u8>,
        ops: Vec<u8>,
        objects: Vec<ObjectName>,
    }

    impl PartAssembler {
        /// Start a part with the given payload blob.
        pub fn new(payload: Vec<u8>) -> Self {
            Self {
                payload,
                ..Default::default()
            }
        }

        /// Emit a metadata splice with explicit (possibly invalid)
        /// length and offset arguments.
        pub fn splice_meta(&mut self, name: ObjectName, len: u64, offset: u64) {
            self.ops.push(OP_OPEN_SPLICE_AND_CLOSE);
            crate::varint::write_varint(&mut self.ops, len);
            crate::varint::write_varint(&mut self.ops, offset);
            self.objects.push(name);
        }

        /// Serialize to (stored part bytes, matching header).
        pub fn finish(self) -> Result<(Vec<u8>, PartHeader)> {
            let body = PartPayload {
                modes: Vec::new(),
                xattrs: Vec::new(),
                payload: self.payload,
                ops: self.ops,
            }
            .serialize(Endianness::Little);
            let stored = compress_part(&body, false)?;
            let header = PartHeader {
                version: 0,
                checksum: sha256(&stored)?,
                compressed_size: stored.len() as u64,
                uncompressed_size: body.len() as u64,
                objects: self.objects,
            };
            Ok((stored, header))
        }
    }
}

/// Magic prefix of a signed delta envelope.
pub const SIGNED_MAGIC: u64 = 0x0ec62a11deadbeef;

/// Superblock metadata key carrying the integer endianness tag.
pub(crate) const ENDIAN_KEY: &str = "treestore.endianness";
/// Superblock metadata key prefix for inlined part bodies.
pub(crate) const INLINE_PART_KEY_PREFIX: &str = "treestore.part.";

pub(crate) const OP_OPEN_SPLICE_AND_CLOSE: u8 = b'S';
pub(crate) const OP_OPEN: u8 = b'o';
pub(crate) const OP_WRITE: u8 = b'w';
pub(crate) const OP_SET_READ_SOURCE: u8 = b'r';
pub(crate) const OP_UNSET_READ_SOURCE: u8 = b'R';
pub(crate) const OP_CLOSE: u8 = b'c';
pub(crate) const OP_BSPATCH: u8 = b'B';

pub(crate) const COMPRESS_NONE: u8 = b'0';
pub(crate) const COMPRESS_GZIP: u8 = b'g';
pub(crate) const COMPRESS_XZ: u8 = b'x';

/// Byte order of the integers inside a delta superblock and its parts,
/// recorded in superblock metadata so deltas can be generated
/// host-natively and read anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Tagged `l`.
    #[default]
    Little,
    /// Tagged `B`.
    Big,
}

impl Endianness {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'l' => Ok(Self::Little),
            b'B' => Ok(Self::Big),
            o => Err(Error::invalid_delta(format!(
                "Invalid endianness tag {:?}",
                o as char
            ))),
        }
    }

    pub(crate) fn u32_bytes(&self, v: u32) -> [u8; 4] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn u64_bytes(&self, v: u64) -> [u8; 8] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn read_u32(&self, b: &[u8]) -> Result<u32> {
        let b: [u8; 4] = b
            .try_into()
            .map_err(|_| Error::invalid_delta("Truncated integer"))?;
        Ok(match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        })
    }

    pub(crate) fn read_u64(&self, b: &[u8]) -> Result<u64> {
        let b: [u8; 8] = b
            .try_into()
            .map_err(|_| Error::invalid_delta("Truncated integer"))?;
        Ok(match self {
            Self::Little => u64::from_le_bytes(b),
            Self::Big => u64::from_be_bytes(b),
        })
    }
}

/// Descriptor of one part within a superblock.
#[derive(Debug, Clone)]
pub struct PartHeader {
    /// Format version; currently always 0.
    pub version: u32,
    /// Checksum of the stored part bytes (compression tag included).
    pub checksum: Checksum,
    /// Stored (compressed) size in bytes.
    pub compressed_size: u64,
    /// Decompressed body size in bytes.
    pub uncompressed_size: u64,
    /// The objects this part produces, in opcode order.
    pub objects: Vec<ObjectName>,
}

/// An object the delta does not carry; it must be fetched by other
/// means.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    /// Object kind.
    pub objtype: ObjectType,
    /// Object checksum.
    pub checksum: Checksum,
    /// Stored size in the source repository.
    pub compressed_size: u64,
    /// Uncompressed content size.
    pub uncompressed_size: u64,
}

fn objects_blob(objects: &[ObjectName]) -> Vec<u8> {
    let mut out = Vec::with_capacity(objects.len() * 33);
    for o in objects {
        out.push(o.objtype as u8);
        out.extend_from_slice(o.checksum.as_bytes());
    }
    out
}

fn parse_objects_blob(data: &[u8]) -> Result<Vec<ObjectName>> {
    if data.len() % 33 != 0 {
        return Err(Error::invalid_delta("Malformed part object list"));
    }
    data.chunks_exact(33)
        .map(|rec| {
            Ok(ObjectName::new(
                Checksum::from_bytes(&rec[1..])?,
                ObjectType::from_u8(rec[0])?,
            ))
        })
        .collect()
}

/// The delta superblock.
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Schemaless metadata (endianness tag, inlined parts, ...).
    pub metadata: BTreeMap<String, Value>,
    /// Generation time, seconds since the epoch.
    pub timestamp: u64,
    /// Source commit, if this is not a from-scratch delta.
    pub from: Option<Checksum>,
    /// Target commit checksum.
    pub to: Checksum,
    /// The full target commit object, so the destination can write it
    /// immediately.
    pub commit: Commit,
    /// Detached metadata of the target commit, if any.
    pub detached_metadata: Option<BTreeMap<String, Value>>,
    /// Part descriptors.
    pub parts: Vec<PartHeader>,
    /// Objects not expressed by any part.
    pub fallbacks: Vec<FallbackEntry>,
    /// Integer byte order of this superblock and its parts.
    pub endianness: Endianness,
}

impl Superblock {
    /// Serialize to canonical bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let e = self.endianness;
        let mut metadata = self.metadata.clone();
        let _ = metadata.insert(ENDIAN_KEY.into(), Value::Byte(e.tag()));

        let mut t = TupleBuilder::new();
        t.push_variable(8, &Value::Dict(metadata).serialize()?);
        t.push_fixed(8, &e.u64_bytes(self.timestamp));
        let from: &[u8] = match &self.from {
            Some(c) => c.as_bytes(),
            None => &[],
        };
        t.push_variable(1, from);
        t.push_variable(1, self.to.as_bytes());
        t.push_variable(8, &self.commit.to_bytes()?);
        let detached = match &self.detached_metadata {
            Some(m) => Value::Dict(m.clone()).serialize()?,
            None => Vec::new(),
        };
        t.push_variable(1, &detached);

        let mut parts = ArrayBuilder::new(8, None);
        for p in &self.parts {
            let mut pt = TupleBuilder::new();
            pt.push_fixed(4, &e.u32_bytes(p.version));
            pt.push_variable(1, p.checksum.as_bytes());
            pt.push_fixed(8, &e.u64_bytes(p.compressed_size));
            pt.push_fixed(8, &e.u64_bytes(p.uncompressed_size));
            pt.push_variable(1, &objects_blob(&p.objects));
            parts.push(&pt.finish());
        }
        t.push_variable(8, &parts.finish());

        let mut fallbacks = ArrayBuilder::new(8, None);
        for f in &self.fallbacks {
            let mut ft = TupleBuilder::new();
            ft.push_fixed(1, &[f.objtype as u8]);
            ft.push_variable(1, f.checksum.as_bytes());
            ft.push_fixed(8, &e.u64_bytes(f.compressed_size));
            ft.push_fixed(8, &e.u64_bytes(f.uncompressed_size));
            fallbacks.push(&ft.finish());
        }
        t.push_variable(8, &fallbacks.finish());
        Ok(t.finish())
    }

    /// Parse and validate superblock bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = TupleReader::new(data, 6)?;
        let metadata = match Value::parse("a{sv}", r.field_variable(8)?)
            .context("Parsing delta metadata")?
        {
            Value::Dict(d) => d,
            _ => unreachable!("a{{sv}} parses to a dict"),
        };
        let endianness = match metadata.get(ENDIAN_KEY) {
            Some(Value::Byte(tag)) => Endianness::from_tag(*tag)?,
            Some(_) => return Err(Error::invalid_delta("Malformed endianness tag")),
            None => Endianness::Little,
        };
        let timestamp = endianness.read_u64(r.field_fixed(8, 8)?)?;
        let from = optional_checksum(r.field_variable(1)?)?;
        let to = required_checksum(r.field_variable(1)?)?;
        let commit = Commit::parse(r.field_variable(8)?).context("Parsing embedded commit")?;
        let detached = r.field_variable(1)?;
        let detached_metadata = if detached.is_empty() {
            None
        } else {
            match Value::parse("a{sv}", detached).context("Parsing detached metadata")? {
                Value::Dict(d) => Some(d),
                _ => unreachable!("a{{sv}} parses to a dict"),
            }
        };
        let mut parts = Vec::new();
        for elem in array_variable(r.field_variable(8)?, 8)? {
            let mut pr = TupleReader::new(elem, 1)?;
            let version = endianness.read_u32(pr.field_fixed(4, 4)?)?;
            let checksum = required_checksum(pr.field_variable(1)?)?;
            let compressed_size = endianness.read_u64(pr.field_fixed(8, 8)?)?;
            let uncompressed_size = endianness.read_u64(pr.field_fixed(8, 8)?)?;
            let objects = parse_objects_blob(pr.field_last(1)?)?;
            parts.push(PartHeader {
                version,
                checksum,
                compressed_size,
                uncompressed_size,
                objects,
            });
        }
        let mut fallbacks = Vec::new();
        for elem in array_variable(r.field_last(8)?, 8)? {
            let mut fr = TupleReader::new(elem, 1)?;
            let objtype = ObjectType::from_u8(fr.field_fixed(1, 1)?[0])?;
            let checksum = required_checksum(fr.field_variable(1)?)?;
            let compressed_size = endianness.read_u64(fr.field_fixed(8, 8)?)?;
            let uncompressed_size = endianness.read_u64(fr.field_fixed(8, 8)?)?;
            fallbacks.push(FallbackEntry {
                objtype,
                checksum,
                compressed_size,
                uncompressed_size,
            });
        }
        Ok(Self {
            metadata,
            timestamp,
            from,
            to,
            commit,
            detached_metadata,
            parts,
            fallbacks,
            endianness,
        })
    }

    /// Fetch an inlined part body from superblock metadata, if present.
    pub(crate) fn inline_part(&self, index: usize) -> Option<&[u8]> {
        match self.metadata.get(&format!("{INLINE_PART_KEY_PREFIX}{index}")) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }
}

/// The decompressed body of one part.
#[derive(Debug, Default, Clone)]
pub(crate) struct PartPayload {
    pub(crate) modes: Vec<(u32, u32, u32)>,
    pub(crate) xattrs: Vec<Xattrs>,
    pub(crate) payload: Vec<u8>,
    pub(crate) ops: Vec<u8>,
}

impl PartPayload {
    pub(crate) fn serialize(&self, e: Endianness) -> Vec<u8> {
        let mut modes = ArrayBuilder::new(4, Some(12));
        for &(uid, gid, mode) in &self.modes {
            let mut rec = Vec::with_capacity(12);
            rec.extend_from_slice(&e.u32_bytes(uid));
            rec.extend_from_slice(&e.u32_bytes(gid));
            rec.extend_from_slice(&e.u32_bytes(mode));
            modes.push(&rec);
        }
        let mut xattrs = ArrayBuilder::new(1, None);
        for x in &self.xattrs {
            xattrs.push(&crate::objects::xattrs_to_bytes(x));
        }
        let mut t = TupleBuilder::new();
        t.push_variable(4, &modes.finish());
        t.push_variable(1, &xattrs.finish());
        t.push_variable(1, &self.payload);
        t.push_variable(1, &self.ops);
        t.finish()
    }

    pub(crate) fn parse(data: &[u8], e: Endianness) -> Result<Self> {
        let mut r = TupleReader::new(data, 3)?;
        let mut modes = Vec::new();
        for rec in array_fixed(r.field_variable(4)?, 12)? {
            modes.push((
                e.read_u32(&rec[0..4])?,
                e.read_u32(&rec[4..8])?,
                e.read_u32(&rec[8..12])?,
            ));
        }
        let mut xattrs = Vec::new();
        for elem in array_variable(r.field_variable(1)?, 1)? {
            xattrs.push(crate::objects::parse_xattrs(elem)?);
        }
        let payload = r.field_variable(1)?.to_vec();
        let ops = r.field_last(1)?.to_vec();
        Ok(Self {
            modes,
            xattrs,
            payload,
            ops,
        })
    }
}

/// Compress a part body, prefixing the compression tag byte.
pub(crate) fn compress_part(body: &[u8], gzip: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() / 2 + 1);
    if gzip {
        out.push(COMPRESS_GZIP);
        let mut enc =
            flate2::write::GzEncoder::new(&mut out, flate2::Compression::default());
        std::io::Write::write_all(&mut enc, body)?;
        let _ = enc.finish()?;
    } else {
        out.push(COMPRESS_NONE);
        out.extend_from_slice(body);
    }
    Ok(out)
}

/// Decompress a stored part, dispatching on the tag byte.
pub(crate) fn decompress_part(data: &[u8], max_size: u64) -> Result<Vec<u8>> {
    let (&tag, rest) = data
        .split_first()
        .ok_or_else(|| Error::invalid_delta("Empty part"))?;
    match tag {
        COMPRESS_NONE => Ok(rest.to_vec()),
        COMPRESS_GZIP => {
            let mut out = Vec::new();
            let n = flate2::read::GzDecoder::new(rest)
                .take(max_size + 1)
                .read_to_end(&mut out)
                .context("Decompressing part")?;
            if n as u64 > max_size {
                return Err(Error::invalid_delta(format!(
                    "Part inflates past its declared size {max_size}"
                )));
            }
            Ok(out)
        }
        COMPRESS_XZ => Err(Error::invalid_delta(
            "Unsupported part compression 'x' (xz)",
        )),
        o => Err(Error::invalid_delta(format!(
            "Unknown part compression {:?}",
            o as char
        ))),
    }
}

// ----------------------------------------------------------------------
// On-disk naming
// ----------------------------------------------------------------------

/// The repository-relative directory of a delta, using the
/// modified-base64 encoding with the first two characters lifted as a
/// directory prefix.
pub fn delta_relpath(from: Option<&Checksum>, to: &Checksum) -> Utf8PathBuf {
    let to_b64 = to.to_b64();
    match from {
        None => {
            let (a, b) = to_b64.split_at(2);
            format!("deltas/{a}/{b}").into()
        }
        Some(f) => {
            let from_b64 = f.to_b64();
            let (a, b) = from_b64.split_at(2);
            format!("deltas/{a}/{b}-{to_b64}").into()
        }
    }
}

/// Parse a delta directory name (`<rest-from>-<to>` or `<rest-to>`)
/// given its two-character directory prefix.
pub(crate) fn parse_delta_name(
    prefix: &str,
    name: &str,
) -> Result<(Option<Checksum>, Checksum)> {
    match name.split_once('-') {
        Some((rest_from, to)) => Ok((
            Some(Checksum::from_b64(&format!("{prefix}{rest_from}"))?),
            Checksum::from_b64(to)?,
        )),
        None => Ok((None, Checksum::from_b64(&format!("{prefix}{name}"))?)),
    }
}

/// The repository-relative path of the per-target delta index.
pub(crate) fn delta_index_relpath(to: &Checksum) -> Utf8PathBuf {
    let b64 = to.to_b64();
    let (a, b) = b64.split_at(2);
    format!("delta-indexes/{a}/{b}.index").into()
}

/// Read the delta index of a target commit: the known (from, to)
/// pairs.  An absent index reads as empty.
pub fn read_delta_index(repo: &Repo, to: &Checksum) -> Result<Vec<(Option<Checksum>, Checksum)>> {
    use cap_std_ext::dirext::CapStdExtDirExt;
    let path = delta_index_relpath(to);
    let Some(mut f) = repo.dir().open_optional(&path)? else {
        return Ok(Vec::new());
    };
    let mut data = Vec::new();
    let _ = f.read_to_end(&mut data)?;
    let mut r = TupleReader::new(&data, 0)?;
    let version = crate::variant::fixed_u32(r.field_fixed(4, 4)?)?;
    if version != 0 {
        return Err(Error::invalid_delta(format!(
            "Unsupported delta index version {version}"
        )));
    }
    let mut out = Vec::new();
    for elem in array_variable(r.field_last(1)?, 1)? {
        let mut er = TupleReader::new(elem, 1)?;
        let from = optional_checksum(er.field_variable(1)?)?;
        let to = required_checksum(er.field_last(1)?)?;
        out.push((from, to));
    }
    Ok(out)
}

pub(crate) fn update_delta_index(
    repo: &Repo,
    from: Option<&Checksum>,
    to: &Checksum,
) -> Result<()> {
    use cap_std_ext::dirext::CapStdExtDirExt;
    let mut entries = read_delta_index(repo, to)?;
    let new = (from.copied(), *to);
    if !entries.contains(&new) {
        entries.push(new);
    }
    let mut arr = ArrayBuilder::new(1, None);
    for (from, to) in &entries {
        let mut t = TupleBuilder::new();
        let from: &[u8] = match from {
            Some(c) => c.as_bytes(),
            None => &[],
        };
        t.push_variable(1, from);
        t.push_variable(1, to.as_bytes());
        arr.push(&t.finish());
    }
    let mut t = TupleBuilder::new();
    t.push_fixed(4, &0u32.to_le_bytes());
    t.push_variable(1, &arr.finish());
    let path = delta_index_relpath(to);
    if let Some(parent) = path.parent() {
        repo.dir().create_dir_all(parent)?;
    }
    repo.dir().atomic_write(&path, &t.finish())?;
    Ok(())
}

/// Enumerate the deltas present in a repository as (from, to) pairs.
pub fn list_deltas(repo: &Repo) -> Result<Vec<(Option<Checksum>, Checksum)>> {
    use cap_std_ext::dirext::CapStdExtDirExt;
    let mut out = Vec::new();
    let Some(deltas) = repo.dir().open_dir_optional("deltas")? else {
        return Ok(out);
    };
    for prefix_entry in deltas.entries()? {
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
            if let Ok(pair) = parse_delta_name(&prefix, name) {
                out.push(pair);
            }
        }
    }
    out.sort_by_key(|(_, to)| *to);
    Ok(out)
}

/// Load the superblock of the delta between two commits, unwrapping
/// (without verifying) a signed envelope if present.
pub fn load_superblock(
    repo: &Repo,
    from: Option<&Checksum>,
    to: &Checksum,
) -> Result<Superblock> {
    let relpath = delta_relpath(from, to).join("superblock");
    let data = repo
        .dir()
        .read(&relpath)
        .with_context(|| format!("Reading {relpath}"))?;
    let data = if is_signed(&data) {
        parse_signed(&data)?.0
    } else {
        data
    };
    Superblock::parse(&data)
}

// ----------------------------------------------------------------------
// Signed envelope
// ----------------------------------------------------------------------

/// Whether these bytes begin with the signed-delta magic.
pub fn is_signed(data: &[u8]) -> bool {
    data.len() >= 8 && data[..8] == SIGNED_MAGIC.to_be_bytes()
}

/// Wrap superblock bytes in a signed envelope carrying a sign-scheme →
/// signatures map.
pub(crate) fn wrap_signed(
    superblock: &[u8],
    signatures: &BTreeMap<String, Vec<Vec<u8>>>,
) -> Result<Vec<u8>> {
    let mut dict = BTreeMap::new();
    for (scheme, sigs) in signatures {
        let _ = dict.insert(
            scheme.clone(),
            Value::Array(
                "ay".into(),
                sigs.iter().map(|s| Value::Bytes(s.clone())).collect(),
            ),
        );
    }
    let mut t = TupleBuilder::new();
    t.push_fixed(8, &SIGNED_MAGIC.to_be_bytes());
    t.push_variable(1, superblock);
    t.push_variable(8, &Value::Dict(dict).serialize()?);
    Ok(t.finish())
}

/// Split a signed envelope into the exact superblock bytes and the
/// signature map.
pub(crate) fn parse_signed(data: &[u8]) -> Result<(Vec<u8>, BTreeMap<String, Vec<Vec<u8>>>)> {
    let mut r = TupleReader::new(data, 1)?;
    let magic = u64::from_be_bytes(r.field_fixed(8, 8)?.try_into().unwrap());
    if magic != SIGNED_MAGIC {
        return Err(Error::invalid_delta("Bad signed delta magic"));
    }
    let superblock = r.field_variable(1)?.to_vec();
    let dict = match Value::parse("a{sv}", r.field_last(8)?)? {
        Value::Dict(d) => d,
        _ => unreachable!("a{{sv}} parses to a dict"),
    };
    let mut out = BTreeMap::new();
    for (scheme, v) in dict {
        let sigs = match v {
            Value::Array(sig, items) if sig == "ay" => items
                .into_iter()
                .map(|i| match i {
                    Value::Bytes(b) => Ok(b),
                    _ => Err(Error::invalid_delta("Malformed signature entry")),
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::invalid_delta("Malformed signature map")),
        };
        let _ = out.insert(scheme, sigs);
    }
    Ok((superblock, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_commit() -> Commit {
        Commit {
            metadata: BTreeMap::new(),
            parent: None,
            related: vec![],
            subject: "delta target".into(),
            body: String::new(),
            timestamp: 1_700_000_000,
            root_tree: Checksum::new([1; 32]),
            root_meta: Checksum::new([2; 32]),
        }
    }

    fn test_superblock(e: Endianness) -> Superblock {
        Superblock {
            metadata: BTreeMap::new(),
            timestamp: 1_700_000_123,
            from: Some(Checksum::new([3; 32])),
            to: Checksum::new([4; 32]),
            commit: test_commit(),
            detached_metadata: None,
            parts: vec![PartHeader {
                version: 0,
                checksum: Checksum::new([5; 32]),
                compressed_size: 100,
                uncompressed_size: 200,
                objects: vec![
                    ObjectName::new(Checksum::new([6; 32]), ObjectType::DirMeta),
                    ObjectName::new(Checksum::new([7; 32]), ObjectType::File),
                ],
            }],
            fallbacks: vec![FallbackEntry {
                objtype: ObjectType::File,
                checksum: Checksum::new([8; 32]),
                compressed_size: 1000,
                uncompressed_size: 2000,
            }],
            endianness: e,
        }
    }

    #[test]
    fn test_superblock_roundtrip() {
        for e in [Endianness::Little, Endianness::Big] {
            let sb = test_superblock(e);
            let bytes = sb.serialize().unwrap();
            let parsed = Superblock::parse(&bytes).unwrap();
            assert_eq!(parsed.endianness, e);
            assert_eq!(parsed.timestamp, sb.timestamp);
            assert_eq!(parsed.from, sb.from);
            assert_eq!(parsed.to, sb.to);
            assert_eq!(parsed.commit, sb.commit);
            assert_eq!(parsed.parts.len(), 1);
            assert_eq!(parsed.parts[0].objects, sb.parts[0].objects);
            assert_eq!(parsed.parts[0].uncompressed_size, 200);
            assert_eq!(parsed.fallbacks.len(), 1);
            assert_eq!(parsed.fallbacks[0].uncompressed_size, 2000);
            // Byte-identical re-serialization.
            assert_eq!(parsed.serialize().unwrap(), bytes);
        }
    }

    #[test]
    fn test_part_payload_roundtrip() {
        let p = PartPayload {
            modes: vec![(0, 0, 0o100644), (1000, 1000, 0o120777)],
            xattrs: vec![vec![], vec![(b"user.x".to_vec(), b"v".to_vec())]],
            payload: b"some payload bytes".to_vec(),
            ops: vec![OP_CLOSE],
        };
        for e in [Endianness::Little, Endianness::Big] {
            let bytes = p.serialize(e);
            let parsed = PartPayload::parse(&bytes, e).unwrap();
            assert_eq!(parsed.modes, p.modes);
            assert_eq!(parsed.xattrs, p.xattrs);
            assert_eq!(parsed.payload, p.payload);
            assert_eq!(parsed.ops, p.ops);
        }
    }

    #[test]
    fn test_compress_roundtrip() {
        let body = vec![7u8; 10000];
        let gz = compress_part(&body, true).unwrap();
        assert_eq!(gz[0], COMPRESS_GZIP);
        assert!(gz.len() < body.len());
        assert_eq!(decompress_part(&gz, body.len() as u64).unwrap(), body);
        let raw = compress_part(&body, false).unwrap();
        assert_eq!(raw[0], COMPRESS_NONE);
        assert_eq!(decompress_part(&raw, body.len() as u64).unwrap(), body);
        // Inflation past the declared size is rejected.
        assert!(decompress_part(&gz, 10).is_err());
        assert!(decompress_part(&[COMPRESS_XZ, 1, 2], 10).is_err());
    }

    #[test]
    fn test_delta_paths() {
        let from = Checksum::new([0xaa; 32]);
        let to = Checksum::new([0xbb; 32]);
        let p = delta_relpath(None, &to);
        assert!(p.as_str().starts_with("deltas/"));
        let comps: Vec<_> = p.components().collect();
        assert_eq!(comps.len(), 3);
        // Two-character prefix directory.
        assert_eq!(comps[1].as_str().len(), 2);
        assert_eq!(comps[2].as_str().len(), 41);

        let p2 = delta_relpath(Some(&from), &to);
        let name = p2.file_name().unwrap();
        assert_eq!(name.len(), 41 + 1 + 43);

        // Round-trip through parse_delta_name.
        let prefix = p2.parent().unwrap().file_name().unwrap();
        let (f, t) = parse_delta_name(prefix, name).unwrap();
        assert_eq!(f, Some(from));
        assert_eq!(t, to);
    }

    #[test]
    fn test_signed_envelope_roundtrip() {
        let sb = test_superblock(Endianness::Little).serialize().unwrap();
        let mut sigs = BTreeMap::new();
        sigs.insert("ed25519".to_string(), vec![vec![1u8; 64]]);
        let env = wrap_signed(&sb, &sigs).unwrap();
        assert!(is_signed(&env));
        assert!(!is_signed(&sb));
        let (sb2, sigs2) = parse_signed(&env).unwrap();
        assert_eq!(sb, sb2);
        assert_eq!(sigs2.get("ed25519").unwrap().len(), 1);
    }
}
