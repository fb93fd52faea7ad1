//! The static-delta executor: an opcode interpreter that reconstitutes
//! content and metadata objects into the repository.
//!
//! Parts are independent units; each is applied in its own transaction,
//! so a failed part discards only its own staged writes and the caller
//! may retry.  Every offset and length is validated against the payload
//! bounds and the declared size of the open object before any state
//! changes.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::Utf8Path;
use cap_std_ext::cap_std;
use fn_error_context::context;
use tracing::{debug, warn};

use super::{
    bspatch, decompress_part, delta_relpath, parse_signed, is_signed, PartPayload, Superblock,
    OP_BSPATCH, OP_CLOSE, OP_OPEN, OP_OPEN_SPLICE_AND_CLOSE, OP_SET_READ_SOURCE,
    OP_UNSET_READ_SOURCE, OP_WRITE,
};
use crate::checksum::{sha256, Checksum};
use crate::error::Error;
use crate::objects::{FileHeader, ObjectName, ObjectType};
use crate::repo::{Repo, Transaction};
use crate::sign::{verify_ed25519, SIGN_SCHEME_ED25519};
use crate::util::{check_cancelled, Cancellable};
use crate::varint::read_varint;
use crate::Result;

/// Options for delta application.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Parse and validate every opcode but create no objects; used to
    /// estimate application cost.
    pub stats_only: bool,
    /// Fail the whole application on the first part failure instead of
    /// continuing with the remaining parts.
    pub strict: bool,
    /// Trusted raw ed25519 public keys.  When non-empty, the delta
    /// must carry a signed envelope with a valid signature over the
    /// exact superblock bytes.
    pub trusted_keys: Vec<Vec<u8>>,
}

/// Totals reported by delta application.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyStats {
    /// Parts present in the delta.
    pub parts_total: u32,
    /// Parts successfully applied.
    pub parts_applied: u32,
    /// Indices of parts that failed (non-strict mode).
    pub parts_failed: Vec<u32>,
    /// Objects produced.
    pub objects_written: u32,
    /// Uncompressed object bytes produced.
    pub bytes_written: u64,
}

/// Apply the delta stored in the repository for `from` → `to`.
pub fn apply_delta(
    repo: &Repo,
    from: Option<&Checksum>,
    to: &Checksum,
    options: &ApplyOptions,
    cancellable: Option<&Cancellable>,
) -> Result<ApplyStats> {
    let relpath = delta_relpath(from, to);
    apply_delta_from_path(repo, &repo.path().join(relpath), options, cancellable)
}

/// Apply a delta from an on-disk directory containing `superblock` and
/// numbered part files.
#[context("Applying delta from {path}")]
pub fn apply_delta_from_path(
    repo: &Repo,
    path: &Utf8Path,
    options: &ApplyOptions,
    cancellable: Option<&Cancellable>,
) -> Result<ApplyStats> {
    let dir = cap_std::fs::Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .with_context(|| format!("Opening {path}"))?;
    let raw = dir
        .read("superblock")
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("Delta superblock in {path}")),
            _ => e.into(),
        })?;
    let superblock_bytes = if is_signed(&raw) {
        let (sb, signatures) = parse_signed(&raw)?;
        verify_signatures(&sb, &signatures, options)?;
        sb
    } else {
        if !options.trusted_keys.is_empty() {
            return Err(Error::SignatureInvalid(
                "Delta is unsigned but signature verification was requested".into(),
            )
            .into());
        }
        raw
    };
    let superblock = Superblock::parse(&superblock_bytes)?;
    apply_superblock(repo, &superblock, &dir, options, cancellable)
}

fn verify_signatures(
    superblock: &[u8],
    signatures: &BTreeMap<String, Vec<Vec<u8>>>,
    options: &ApplyOptions,
) -> Result<()> {
    if options.trusted_keys.is_empty() {
        return Ok(());
    }
    let sigs = signatures
        .get(SIGN_SCHEME_ED25519)
        .ok_or_else(|| Error::SignatureInvalid("No ed25519 signatures present".into()))?;
    for key in &options.trusted_keys {
        for sig in sigs {
            if verify_ed25519(key, superblock, sig)? {
                return Ok(());
            }
        }
    }
    Err(Error::SignatureInvalid("No trusted key signed this delta".into()).into())
}

fn apply_superblock(
    repo: &Repo,
    superblock: &Superblock,
    delta_dir: &cap_std::fs::Dir,
    options: &ApplyOptions,
    cancellable: Option<&Cancellable>,
) -> Result<ApplyStats> {
    let mut stats = ApplyStats {
        parts_total: superblock.parts.len() as u32,
        ..Default::default()
    };

    // Fallback objects must have arrived by other means.
    let mut missing = Vec::new();
    for fb in &superblock.fallbacks {
        let name = ObjectName::new(fb.checksum, fb.objtype);
        if !repo.has_object(&name)? {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() && !options.stats_only {
        return Err(Error::not_found(format!(
            "Fallback objects not present: {}",
            missing.join(", ")
        )));
    }

    if !options.stats_only {
        // Write the target commit first and mark it partial until every
        // part has landed.
        let txn = repo.prepare_transaction(cancellable)?;
        let _ = txn.write_metadata(
            ObjectType::Commit,
            Some(&superblock.to),
            &superblock.commit.to_bytes()?,
        )?;
        let _ = txn.commit(cancellable)?;
        repo.set_commit_partial(&superblock.to, true)?;
        if let Some(detached) = &superblock.detached_metadata {
            repo.write_commit_detached_metadata(&superblock.to, Some(detached))?;
        }
    }

    for (idx, header) in superblock.parts.iter().enumerate() {
        check_cancelled(cancellable, "delta part")?;
        let result = apply_one_part(repo, superblock, delta_dir, idx, options, cancellable);
        match result {
            Ok((objects, bytes)) => {
                stats.parts_applied += 1;
                stats.objects_written += objects;
                stats.bytes_written += bytes;
            }
            Err(e) if !options.strict => {
                warn!("Part {idx} ({}) failed: {e:#}", header.checksum);
                stats.parts_failed.push(idx as u32);
            }
            Err(e) => return Err(e).with_context(|| format!("Applying part {idx}")),
        }
    }

    if !options.stats_only && stats.parts_failed.is_empty() {
        repo.set_commit_partial(&superblock.to, false)?;
    }
    Ok(stats)
}

#[context("Part {idx}")]
fn apply_one_part(
    repo: &Repo,
    superblock: &Superblock,
    delta_dir: &cap_std::fs::Dir,
    idx: usize,
    options: &ApplyOptions,
    cancellable: Option<&Cancellable>,
) -> Result<(u32, u64)> {
    let header = &superblock.parts[idx];
    let stored = match superblock.inline_part(idx) {
        Some(b) => b.to_vec(),
        None => delta_dir
            .read(format!("{idx}"))
            .with_context(|| format!("Reading part file {idx}"))?,
    };
    if stored.len() as u64 != header.compressed_size {
        return Err(Error::invalid_delta(format!(
            "Part size {} does not match declared {}",
            stored.len(),
            header.compressed_size
        )));
    }
    let actual = sha256(&stored)?;
    if actual != header.checksum {
        return Err(Error::ChecksumMismatch {
            objtype: ObjectType::File,
            expected: header.checksum.to_hex(),
            actual: actual.to_hex(),
        })
        .context("Validating part");
    }
    let body = decompress_part(&stored, header.uncompressed_size)?;
    if body.len() as u64 != header.uncompressed_size {
        return Err(Error::invalid_delta(format!(
            "Part inflated to {} bytes, declared {}",
            body.len(),
            header.uncompressed_size
        )));
    }
    let payload = PartPayload::parse(&body, superblock.endianness)?;

    let txn = if options.stats_only {
        None
    } else {
        Some(repo.prepare_transaction(cancellable)?)
    };
    let mut exec = PartExecutor {
        repo,
        txn: txn.as_ref(),
        part: &payload,
        objects: &header.objects,
        cursor: 0,
        open: None,
        read_source: None,
        objects_written: 0,
        bytes_written: 0,
    };
    exec.run(cancellable)?;
    let (objects, bytes) = (exec.objects_written, exec.bytes_written);
    drop(exec);
    if let Some(txn) = txn {
        let _ = txn.commit(cancellable)?;
    }
    debug!("Applied part {idx}: {objects} objects");
    Ok((objects, bytes))
}

fn take_varint(ops: &mut &[u8]) -> Result<u64> {
    let (v, rest) = read_varint(*ops)?;
    *ops = rest;
    Ok(v)
}

struct OpenObject {
    name: ObjectName,
    header: FileHeader,
    declared_size: u64,
    buf: Vec<u8>,
}

struct PartExecutor<'a> {
    repo: &'a Repo,
    txn: Option<&'a Transaction<'a>>,
    part: &'a PartPayload,
    objects: &'a [ObjectName],
    cursor: usize,
    open: Option<OpenObject>,
    read_source: Option<(Checksum, Option<Vec<u8>>)>,
    objects_written: u32,
    bytes_written: u64,
}

impl<'a> PartExecutor<'a> {
    fn next_object(&mut self) -> Result<ObjectName> {
        let obj = self
            .objects
            .get(self.cursor)
            .copied()
            .ok_or_else(|| Error::invalid_delta("More opcodes than declared objects"))?;
        self.cursor += 1;
        Ok(obj)
    }

    fn payload_slice(&self, offset: u64, len: u64) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&e| e <= self.part.payload.len() as u64)
            .ok_or_else(|| {
                Error::invalid_delta(format!(
                    "Payload range {offset}+{len} exceeds {} bytes",
                    self.part.payload.len()
                ))
            })?;
        Ok(&self.part.payload[offset as usize..end as usize])
    }

    fn file_header(&self, mode_idx: u64, xattr_idx: u64) -> Result<FileHeader> {
        let &(uid, gid, mode) = self
            .part
            .modes
            .get(mode_idx as usize)
            .ok_or_else(|| Error::invalid_delta(format!("Invalid mode index {mode_idx}")))?;
        let xattrs = self
            .part
            .xattrs
            .get(xattr_idx as usize)
            .ok_or_else(|| Error::invalid_delta(format!("Invalid xattr index {xattr_idx}")))?;
        Ok(FileHeader {
            uid,
            gid,
            mode,
            symlink_target: String::new(),
            xattrs: xattrs.clone(),
        })
    }

    fn write_content_object(
        &mut self,
        name: &ObjectName,
        mut header: FileHeader,
        content: &[u8],
    ) -> Result<()> {
        if header.mode & libc::S_IFMT == libc::S_IFLNK {
            header.symlink_target = String::from_utf8(content.to_vec())
                .map_err(|_| Error::invalid_delta("Non-UTF-8 symlink target"))?;
            if let Some(txn) = self.txn {
                let _ = txn.write_content(
                    Some(&name.checksum),
                    &header,
                    &mut std::io::empty(),
                    0,
                    None,
                )?;
            }
        } else if let Some(txn) = self.txn {
            let _ = txn.write_content(
                Some(&name.checksum),
                &header,
                &mut &content[..],
                content.len() as u64,
                None,
            )?;
        }
        self.objects_written += 1;
        self.bytes_written += content.len() as u64;
        Ok(())
    }

    fn run(&mut self, cancellable: Option<&Cancellable>) -> Result<()> {
        let mut ops: &[u8] = &self.part.ops;
        let mut opcode_index = 0usize;
        while let Some((&op, rest)) = ops.split_first() {
            check_cancelled(cancellable, "delta opcode")?;
            ops = rest;
            self.step(op, &mut ops)
                .with_context(|| format!("At opcode index {opcode_index}"))?;
            opcode_index += 1;
        }
        if self.cursor != self.objects.len() {
            return Err(Error::invalid_delta(format!(
                "Part produced {} of {} declared objects",
                self.cursor,
                self.objects.len()
            )));
        }
        if self.open.is_some() {
            return Err(Error::invalid_delta("Unclosed object at end of part"));
        }
        Ok(())
    }

    fn step(&mut self, op: u8, ops: &mut &[u8]) -> Result<()> {
        match op {
            OP_OPEN_SPLICE_AND_CLOSE => {
                let obj = self.next_object()?;
                if self.open.is_some() {
                    return Err(Error::invalid_delta("Splice with an object open"));
                }
                if obj.objtype.is_meta() {
                    let len = take_varint(ops)?;
                    let offset = take_varint(ops)?;
                    let data = self.payload_slice(offset, len)?;
                    let actual = sha256(data)?;
                    if actual != obj.checksum {
                        return Err(Error::ChecksumMismatch {
                            objtype: obj.objtype,
                            expected: obj.checksum.to_hex(),
                            actual: actual.to_hex(),
                        }
                        .into());
                    }
                    if let Some(txn) = self.txn {
                        let _ = txn.write_metadata(obj.objtype, Some(&obj.checksum), data)?;
                    }
                    self.objects_written += 1;
                    self.bytes_written += len;
                } else {
                    let mode_idx = take_varint(ops)?;
                    let xattr_idx = take_varint(ops)?;
                    let size = take_varint(ops)?;
                    let offset = take_varint(ops)?;
                    let header = self.file_header(mode_idx, xattr_idx)?;
                    let content = self.payload_slice(offset, size)?;
                    self.write_content_object(&obj, header, content)?;
                }
                Ok(())
            }
            OP_OPEN => {
                let mode_idx = take_varint(ops)?;
                let xattr_idx = take_varint(ops)?;
                let size = take_varint(ops)?;
                if self.open.is_some() {
                    return Err(Error::invalid_delta("Open with an object already open"));
                }
                let obj = self.next_object()?;
                if obj.objtype != ObjectType::File {
                    return Err(Error::invalid_delta("Open of a non-content object"));
                }
                let header = self.file_header(mode_idx, xattr_idx)?;
                self.open = Some(OpenObject {
                    name: obj,
                    header,
                    declared_size: size,
                    buf: Vec::with_capacity(size.min(1 << 24) as usize),
                });
                Ok(())
            }
            OP_WRITE => {
                let size = take_varint(ops)?;
                let offset = take_varint(ops)?;
                let source_bytes = match &self.read_source {
                    Some((_, Some(content))) => {
                        let end = offset
                            .checked_add(size)
                            .filter(|&e| e <= content.len() as u64)
                            .ok_or_else(|| {
                                Error::invalid_delta("Write exceeds read source bounds")
                            })?;
                        Some(content[offset as usize..end as usize].to_vec())
                    }
                    // Stats-only: the source was not opened; count only.
                    Some((_, None)) => None,
                    None => Some(self.payload_slice(offset, size)?.to_vec()),
                };
                let open = self
                    .open
                    .as_mut()
                    .ok_or_else(|| Error::invalid_delta("Write with no object open"))?;
                if open.buf.len() as u64 + size > open.declared_size {
                    return Err(Error::invalid_delta(format!(
                        "Write exceeds declared object size {}",
                        open.declared_size
                    )));
                }
                match source_bytes {
                    Some(b) => open.buf.extend_from_slice(&b),
                    None => {
                        // Track progress without materializing.
                        open.buf.resize(open.buf.len() + size as usize, 0);
                    }
                }
                Ok(())
            }
            OP_SET_READ_SOURCE => {
                let offset = take_varint(ops)?;
                let csum = Checksum::from_bytes(self.payload_slice(offset, 32)?)?;
                let content = if self.txn.is_some() {
                    Some(
                        self.repo
                            .load_file_content(&csum)
                            .with_context(|| format!("Opening read source {csum}"))?,
                    )
                } else {
                    None
                };
                self.read_source = Some((csum, content));
                Ok(())
            }
            OP_UNSET_READ_SOURCE => {
                self.read_source = None;
                Ok(())
            }
            OP_BSPATCH => {
                let offset = take_varint(ops)?;
                let len = take_varint(ops)?;
                let patch = self.payload_slice(offset, len)?;
                let open = self
                    .open
                    .as_mut()
                    .ok_or_else(|| Error::invalid_delta("Patch with no object open"))?;
                let expected = (open.declared_size - open.buf.len() as u64) as usize;
                match &self.read_source {
                    Some((_, Some(source))) => {
                        let out = bspatch(source, patch, expected)?;
                        open.buf.extend_from_slice(&out);
                    }
                    Some((_, None)) => {
                        open.buf.resize(open.buf.len() + expected, 0);
                    }
                    None => {
                        return Err(Error::invalid_delta("Patch with no read source"));
                    }
                }
                Ok(())
            }
            OP_CLOSE => {
                let open = self
                    .open
                    .take()
                    .ok_or_else(|| Error::invalid_delta("Close with no object open"))?;
                if open.buf.len() as u64 != open.declared_size {
                    return Err(Error::invalid_delta(format!(
                        "Object closed at {} of {} declared bytes",
                        open.buf.len(),
                        open.declared_size
                    )));
                }
                let OpenObject {
                    name, header, buf, ..
                } = open;
                self.write_content_object(&name, header, &buf)?;
                // Close implicitly drops any read source.
                self.read_source = None;
                Ok(())
            }
            o => Err(Error::invalid_delta(format!("Unknown opcode {o:#x}"))),
        }
    }
}
