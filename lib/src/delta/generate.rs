//! Static-delta generation.
//!
//! The generator computes the object set the target commit adds over
//! the source, matches changed regular files by rolling checksum (with
//! a binary-diff fallback), and packs everything into compressed parts
//! behind a superblock.  Two invocations with identical inputs and
//! options produce byte-identical superblocks, modulo the embedded
//! generation timestamp (which is overridable).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tracing::debug;

use super::rollsum::{rollsum_match, MatchOp};
use super::{
    bsdiff, compress_part, delta_relpath, update_delta_index, wrap_signed, Endianness,
    FallbackEntry, PartHeader, PartPayload, Superblock, INLINE_PART_KEY_PREFIX,
    OP_BSPATCH, OP_CLOSE, OP_OPEN, OP_OPEN_SPLICE_AND_CLOSE, OP_SET_READ_SOURCE,
    OP_UNSET_READ_SOURCE, OP_WRITE,
};
use crate::checksum::{sha256, Checksum};
use crate::objects::{FileHeader, ObjectName, ObjectType, Xattrs};
use crate::repo::Repo;
use crate::sign::{sign_ed25519, SIGN_SCHEME_ED25519};
use crate::traversal::{traverse_commit, TraverseOptions};
use crate::util::{check_cancelled, Cancellable};
use crate::variant::Value;
use crate::varint::write_varint;
use crate::Result;

/// Part compression schemes the generator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaCompression {
    /// No compression (tag `0`).
    None,
    /// gzip (tag `g`).
    #[default]
    Gzip,
}

/// The closed option set of delta generation.
#[derive(Debug, Clone)]
pub struct DeltaGenerateOptions {
    /// Objects at least this large are emitted as fallback entries
    /// instead of being packed into parts.
    pub min_fallback_size: u64,
    /// Upper bound on `from + to` size for attempting a binary diff.
    pub max_bsdiff_size: u64,
    /// Target upper bound on per-part payload bytes.
    pub max_chunk_size: u64,
    /// Whether binary diffing is attempted at all.
    pub enable_bsdiff: bool,
    /// Embed part bodies in the superblock instead of separate files.
    pub inline_parts: bool,
    /// Byte order of superblock and part integers.
    pub endianness: Endianness,
    /// Part compression.
    pub compression: DeltaCompression,
    /// Raw ed25519 secret key; when set, the superblock is wrapped in
    /// a signed envelope.
    pub sign_key: Option<Vec<u8>>,
    /// Generation timestamp override, for reproducible output.
    pub timestamp: Option<u64>,
    /// Print per-object and per-part statistics.  Does not affect
    /// output bytes.
    pub verbose: bool,
}

impl Default for DeltaGenerateOptions {
    fn default() -> Self {
        Self {
            min_fallback_size: 4 * 1024 * 1024,
            max_bsdiff_size: 128 * 1024 * 1024,
            max_chunk_size: 32 * 1024 * 1024,
            enable_bsdiff: true,
            inline_parts: false,
            endianness: Endianness::Little,
            compression: DeltaCompression::Gzip,
            sign_key: None,
            timestamp: None,
            verbose: false,
        }
    }
}

/// Size-similarity window for matching changed files, as a fraction of
/// the larger size.
const SIMILARITY_THRESHOLD_PERCENT: u64 = 30;

#[derive(Debug)]
enum ContentPlan {
    /// Copy runs from a local source object plus literal bytes.
    Rollsum {
        from: Checksum,
        ops: Vec<MatchOp>,
    },
    /// Binary patch over a local source object.
    Bsdiff { from: Checksum, patch: Vec<u8> },
    /// Raw payload bytes.
    Plain,
}

/// One part being assembled.
#[derive(Debug, Default)]
struct PartBuilder {
    modes: Vec<(u32, u32, u32)>,
    mode_index: HashMap<(u32, u32, u32), u64>,
    xattrs: Vec<Xattrs>,
    xattr_index: HashMap<Vec<u8>, u64>,
    payload: Vec<u8>,
    ops: Vec<u8>,
    objects: Vec<ObjectName>,
}

impl PartBuilder {
    fn intern_mode(&mut self, header: &FileHeader) -> u64 {
        let key = (header.uid, header.gid, header.mode);
        if let Some(&idx) = self.mode_index.get(&key) {
            return idx;
        }
        let idx = self.modes.len() as u64;
        self.modes.push(key);
        let _ = self.mode_index.insert(key, idx);
        idx
    }

    fn intern_xattrs(&mut self, xattrs: &Xattrs) -> u64 {
        // Dedup key is bytewise tuple equality.
        let key = crate::objects::xattrs_to_bytes(xattrs);
        if let Some(&idx) = self.xattr_index.get(&key) {
            return idx;
        }
        let idx = self.xattrs.len() as u64;
        self.xattrs.push(xattrs.clone());
        let _ = self.xattr_index.insert(key, idx);
        idx
    }

    fn append_payload(&mut self, data: &[u8]) -> u64 {
        let offset = self.payload.len() as u64;
        self.payload.extend_from_slice(data);
        offset
    }

    fn add_metadata(&mut self, name: ObjectName, data: &[u8]) {
        let offset = self.append_payload(data);
        self.ops.push(OP_OPEN_SPLICE_AND_CLOSE);
        write_varint(&mut self.ops, data.len() as u64);
        write_varint(&mut self.ops, offset);
        self.objects.push(name);
    }

    fn add_plain(&mut self, name: ObjectName, header: &FileHeader, content: &[u8]) {
        let mode_idx = self.intern_mode(header);
        let xattr_idx = self.intern_xattrs(&header.xattrs);
        let content: &[u8] = if header.is_symlink() {
            header.symlink_target.as_bytes()
        } else {
            content
        };
        let offset = self.append_payload(content);
        self.ops.push(OP_OPEN_SPLICE_AND_CLOSE);
        write_varint(&mut self.ops, mode_idx);
        write_varint(&mut self.ops, xattr_idx);
        write_varint(&mut self.ops, content.len() as u64);
        write_varint(&mut self.ops, offset);
        self.objects.push(name);
    }

    fn add_rollsum(
        &mut self,
        name: ObjectName,
        header: &FileHeader,
        from: &Checksum,
        ops: &[MatchOp],
        content: &[u8],
    ) {
        let mode_idx = self.intern_mode(header);
        let xattr_idx = self.intern_xattrs(&header.xattrs);
        let csum_offset = self.append_payload(from.as_bytes());
        self.ops.push(OP_OPEN);
        write_varint(&mut self.ops, mode_idx);
        write_varint(&mut self.ops, xattr_idx);
        write_varint(&mut self.ops, content.len() as u64);
        let mut source_active = false;
        for op in ops {
            match *op {
                MatchOp::Copy { from_offset, len } => {
                    if !source_active {
                        self.ops.push(OP_SET_READ_SOURCE);
                        write_varint(&mut self.ops, csum_offset);
                        source_active = true;
                    }
                    self.ops.push(OP_WRITE);
                    write_varint(&mut self.ops, len);
                    write_varint(&mut self.ops, from_offset);
                }
                MatchOp::Literal { to_offset, len } => {
                    if source_active {
                        self.ops.push(OP_UNSET_READ_SOURCE);
                        source_active = false;
                    }
                    let literal =
                        &content[to_offset as usize..(to_offset + len) as usize];
                    let offset = self.append_payload(literal);
                    self.ops.push(OP_WRITE);
                    write_varint(&mut self.ops, len);
                    write_varint(&mut self.ops, offset);
                }
            }
        }
        if source_active {
            self.ops.push(OP_UNSET_READ_SOURCE);
        }
        self.ops.push(OP_CLOSE);
        self.objects.push(name);
    }

    fn add_bsdiff(
        &mut self,
        name: ObjectName,
        header: &FileHeader,
        from: &Checksum,
        patch: &[u8],
        content_size: u64,
    ) {
        let mode_idx = self.intern_mode(header);
        let xattr_idx = self.intern_xattrs(&header.xattrs);
        let csum_offset = self.append_payload(from.as_bytes());
        let patch_offset = self.append_payload(patch);
        self.ops.push(OP_SET_READ_SOURCE);
        write_varint(&mut self.ops, csum_offset);
        self.ops.push(OP_OPEN);
        write_varint(&mut self.ops, mode_idx);
        write_varint(&mut self.ops, xattr_idx);
        write_varint(&mut self.ops, content_size);
        self.ops.push(OP_BSPATCH);
        write_varint(&mut self.ops, patch_offset);
        write_varint(&mut self.ops, patch.len() as u64);
        self.ops.push(OP_CLOSE);
        self.ops.push(OP_UNSET_READ_SOURCE);
        self.objects.push(name);
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Generate the delta between `from` (possibly absent) and `to`, write
/// it into the repository's `deltas/` directory, and update the delta
/// index for `to`.
#[context("Generating delta to {to}")]
pub fn generate_delta(
    repo: &Repo,
    from: Option<&Checksum>,
    to: &Checksum,
    options: &DeltaGenerateOptions,
    cancellable: Option<&Cancellable>,
) -> Result<Superblock> {
    let _lock = repo.lock_shared()?;
    let topts = TraverseOptions {
        maxdepth: 0,
        commit_only: false,
    };
    let to_set = traverse_commit(repo, to, &topts, cancellable)?;
    anyhow::ensure!(
        to_set.contains(&ObjectName::new(*to, ObjectType::Commit)),
        "Target commit {to} is not present"
    );
    let from_set = match from {
        Some(f) => traverse_commit(repo, f, &topts, cancellable)?,
        None => BTreeSet::new(),
    };
    let new_reachable: BTreeSet<ObjectName> = to_set.difference(&from_set).copied().collect();

    // Partition into metadata, regular-file content, and symlinks.
    let mut metadata: Vec<ObjectName> = Vec::new();
    let mut regulars: Vec<(Checksum, FileHeader, u64)> = Vec::new();
    let mut symlinks: Vec<(Checksum, FileHeader)> = Vec::new();
    for obj in &new_reachable {
        match obj.objtype {
            ObjectType::Commit | ObjectType::CommitMeta => {
                // Carried in the superblock itself.
            }
            ObjectType::DirTree | ObjectType::DirMeta => metadata.push(*obj),
            ObjectType::File => {
                let (header, size) = repo.query_file_info(&obj.checksum)?;
                if header.is_symlink() {
                    symlinks.push((obj.checksum, header));
                } else {
                    regulars.push((obj.checksum, header, size));
                }
            }
            _ => {}
        }
    }

    // Candidate modified pairs: regular files from the source commit
    // whose size is within the similarity window.
    let mut from_regulars: Vec<(Checksum, u64, bool)> = Vec::new();
    for obj in &from_set {
        if obj.objtype == ObjectType::File {
            if let Ok((header, size)) = repo.query_file_info(&obj.checksum) {
                if !header.is_symlink() {
                    let world_readable = header.mode & 0o004 != 0;
                    from_regulars.push((obj.checksum, size, world_readable));
                }
            }
        }
    }
    let similar = |a: u64, b: u64| {
        let max = a.max(b);
        max == 0 || (a.abs_diff(b)).saturating_mul(100) <= max * SIMILARITY_THRESHOLD_PERCENT
    };

    let mut plans: BTreeMap<Checksum, ContentPlan> = BTreeMap::new();
    let mut fallbacks: Vec<FallbackEntry> = Vec::new();
    let mut packed_regulars: Vec<(Checksum, FileHeader, u64)> = Vec::new();
    for (csum, header, size) in regulars {
        check_cancelled(cancellable, "delta planning")?;
        let candidate = from_regulars
            .iter()
            .filter(|(_, fsize, readable)| *readable && similar(*fsize, size))
            .min_by_key(|(fcsum, fsize, _)| (fsize.abs_diff(size), *fcsum));
        let mut plan = ContentPlan::Plain;
        if let Some((fcsum, fsize, _)) = candidate {
            let from_content = repo.load_file_content(fcsum)?;
            let to_content = repo.load_file_content(&csum)?;
            let m = rollsum_match(&from_content, &to_content);
            if m.is_worthwhile(to_content.len()) {
                debug!("rollsum plan for {csum}: {} matched bytes", m.matched);
                plan = ContentPlan::Rollsum {
                    from: *fcsum,
                    ops: m.ops,
                };
            } else if options.enable_bsdiff && fsize + size <= options.max_bsdiff_size {
                debug!("bsdiff plan for {csum}");
                plan = ContentPlan::Bsdiff {
                    from: *fcsum,
                    patch: bsdiff(&from_content, &to_content),
                };
            }
        }
        if matches!(plan, ContentPlan::Plain) && size >= options.min_fallback_size {
            let name = ObjectName::new(csum, ObjectType::File);
            fallbacks.push(FallbackEntry {
                objtype: ObjectType::File,
                checksum: csum,
                compressed_size: repo.object_size(&name)?,
                uncompressed_size: size,
            });
            continue;
        }
        let _ = plans.insert(csum, plan);
        packed_regulars.push((csum, header, size));
    }

    // Pack parts: metadata first, then rollsum objects in insertion
    // order, then bsdiff, then plain content.
    let mut parts: Vec<PartBuilder> = Vec::new();
    let mut current = PartBuilder::default();
    macro_rules! maybe_rotate {
        ($incoming:expr) => {
            if !current.is_empty()
                && current.payload_len() + $incoming > options.max_chunk_size
            {
                parts.push(std::mem::take(&mut current));
            }
        };
    }

    for obj in &metadata {
        check_cancelled(cancellable, "delta packing")?;
        let data = repo.load_metadata(obj)?;
        maybe_rotate!(data.len() as u64);
        current.add_metadata(*obj, &data);
    }
    for phase in ["rollsum", "bsdiff", "plain"] {
        for (csum, header, size) in &packed_regulars {
            check_cancelled(cancellable, "delta packing")?;
            let name = ObjectName::new(*csum, ObjectType::File);
            match (phase, plans.get(csum)) {
                ("rollsum", Some(ContentPlan::Rollsum { from, ops })) => {
                    let content = repo.load_file_content(csum)?;
                    maybe_rotate!(*size);
                    current.add_rollsum(name, header, from, ops, &content);
                }
                ("bsdiff", Some(ContentPlan::Bsdiff { from, patch })) => {
                    maybe_rotate!(patch.len() as u64);
                    current.add_bsdiff(name, header, from, patch, *size);
                }
                ("plain", Some(ContentPlan::Plain)) => {
                    let content = repo.load_file_content(csum)?;
                    maybe_rotate!(*size);
                    current.add_plain(name, header, &content);
                }
                _ => {}
            }
        }
    }
    for (csum, header) in &symlinks {
        let name = ObjectName::new(*csum, ObjectType::File);
        maybe_rotate!(header.symlink_target.len() as u64);
        current.add_plain(name, header, &[]);
    }
    if !current.is_empty() {
        parts.push(current);
    }

    // Serialize, compress and checksum each part.
    let mut metadata_dict: BTreeMap<String, Value> = BTreeMap::new();
    let mut part_headers = Vec::with_capacity(parts.len());
    let mut part_bodies = Vec::with_capacity(parts.len());
    for (idx, part) in parts.iter().enumerate() {
        let body = PartPayload {
            modes: part.modes.clone(),
            xattrs: part.xattrs.clone(),
            payload: part.payload.clone(),
            ops: part.ops.clone(),
        }
        .serialize(options.endianness);
        let stored = compress_part(&body, options.compression == DeltaCompression::Gzip)?;
        let checksum = sha256(&stored)?;
        if options.verbose {
            println!(
                "part {idx}: {} objects, payload {} -> stored {} bytes",
                part.objects.len(),
                body.len(),
                stored.len()
            );
        }
        part_headers.push(PartHeader {
            version: 0,
            checksum,
            compressed_size: stored.len() as u64,
            uncompressed_size: body.len() as u64,
            objects: part.objects.clone(),
        });
        if options.inline_parts {
            let _ = metadata_dict.insert(
                format!("{INLINE_PART_KEY_PREFIX}{idx}"),
                Value::Bytes(stored.clone()),
            );
        }
        part_bodies.push(stored);
    }

    let commit = repo.load_commit(to)?;
    let superblock = Superblock {
        metadata: metadata_dict,
        timestamp: options
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64),
        from: from.copied(),
        to: *to,
        commit,
        detached_metadata: repo.read_commit_detached_metadata(to)?,
        parts: part_headers,
        fallbacks,
        endianness: options.endianness,
    };
    if options.verbose {
        println!(
            "delta: {} parts, {} fallbacks",
            superblock.parts.len(),
            superblock.fallbacks.len()
        );
    }

    let mut superblock_bytes = superblock.serialize()?;
    if let Some(key) = options.sign_key.as_deref() {
        let sig = sign_ed25519(key, &superblock_bytes)?;
        let mut sigs = BTreeMap::new();
        let _ = sigs.insert(SIGN_SCHEME_ED25519.to_string(), vec![sig]);
        superblock_bytes = wrap_signed(&superblock_bytes, &sigs)?;
    }

    // Persist into deltas/<...>/.
    let relpath = delta_relpath(from, to);
    repo.dir().create_dir_all(&relpath)?;
    let delta_dir = repo.dir().open_dir(&relpath)?;
    delta_dir.atomic_write("superblock", &superblock_bytes)?;
    if !options.inline_parts {
        for (idx, stored) in part_bodies.iter().enumerate() {
            delta_dir.atomic_write(format!("{idx}"), stored)?;
        }
    }
    update_delta_index(repo, from, to)?;
    debug!("Wrote delta to {relpath}");
    Ok(superblock)
}
