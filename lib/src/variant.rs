//! Canonical typed-record serialization.
//!
//! Objects and static-delta structures are persisted in a
//! self-describing record format wire-equivalent to the GVariant
//! grammar: little-endian framing offsets sized by serialized container
//! size, NUL-terminated strings, end-offset tables for variable-size
//! array elements, and framing offsets for non-final variable tuple
//! members appended in reverse order.  This module implements the small
//! subset of the grammar the store needs, as a streaming, validating
//! codec; the only schemaless data (commit metadata) is modeled by the
//! closed [`Value`] sum.
//!
//! Integer *values* inside serialized objects are byte-swapped to
//! big-endian by the object layer before they reach this module; the
//! framing itself is always little-endian.

use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::error::Error;
use crate::Result;

pub(crate) fn align_up(v: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Framing offset size for a serialized container of `len` bytes.
fn offset_size(len: usize) -> usize {
    if len <= 0xff {
        1
    } else if len <= 0xffff {
        2
    } else if len <= 0xffff_ffff {
        4
    } else {
        8
    }
}

fn read_le(data: &[u8]) -> usize {
    let mut v = 0usize;
    for (i, &b) in data.iter().enumerate() {
        v |= (b as usize) << (8 * i);
    }
    v
}

/// Append the end-offset table to a container body.  The offset width
/// is the smallest of 1/2/4/8 such that the total serialized size
/// (body plus table) still decodes to the same width.
fn push_offsets(mut body: Vec<u8>, ends: &[usize]) -> Vec<u8> {
    if ends.is_empty() {
        return body;
    }
    let mut z = 1usize;
    loop {
        let total = body.len() + ends.len() * z;
        let fits = match z {
            1 => total <= 0xff,
            2 => total <= 0xffff,
            4 => total <= 0xffff_ffff,
            _ => true,
        };
        if fits {
            break;
        }
        z *= 2;
    }
    for &end in ends {
        body.extend_from_slice(&end.to_le_bytes()[..z]);
    }
    body
}

/// Serializer for one tuple.  Members are pushed in order; the builder
/// records framing offsets for variable-size members and drops the
/// final one if the last member is itself variable-size.
#[derive(Debug, Default)]
pub(crate) struct TupleBuilder {
    body: Vec<u8>,
    ends: Vec<usize>,
    maxalign: usize,
    last_variable: bool,
}

impl TupleBuilder {
    pub(crate) fn new() -> Self {
        Self {
            maxalign: 1,
            ..Default::default()
        }
    }

    fn pad(&mut self, align: usize) {
        self.maxalign = self.maxalign.max(align);
        let pos = align_up(self.body.len(), align);
        self.body.resize(pos, 0);
    }

    pub(crate) fn push_fixed(&mut self, align: usize, bytes: &[u8]) {
        self.pad(align);
        self.body.extend_from_slice(bytes);
        self.last_variable = false;
    }

    pub(crate) fn push_variable(&mut self, align: usize, bytes: &[u8]) {
        self.pad(align);
        self.body.extend_from_slice(bytes);
        self.ends.push(self.body.len());
        self.last_variable = true;
    }

    pub(crate) fn push_str(&mut self, s: &str) {
        let mut b = Vec::with_capacity(s.len() + 1);
        b.extend_from_slice(s.as_bytes());
        b.push(0);
        self.push_variable(1, &b);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.last_variable {
            // The last member is delimited by the end of the tuple.
            let _ = self.ends.pop();
        }
        if self.ends.is_empty() && !self.last_variable {
            // All members fixed-size: the tuple is fixed-size too and is
            // padded out to its own alignment.  The empty tuple is one
            // zero byte.
            if self.body.is_empty() {
                return vec![0];
            }
            let total = align_up(self.body.len(), self.maxalign);
            self.body.resize(total, 0);
            return self.body;
        }
        self.ends.reverse();
        push_offsets(self.body, &self.ends)
    }
}

/// Serializer for one array.
#[derive(Debug)]
pub(crate) struct ArrayBuilder {
    elem_align: usize,
    elem_fixed: Option<usize>,
    body: Vec<u8>,
    ends: Vec<usize>,
}

impl ArrayBuilder {
    pub(crate) fn new(elem_align: usize, elem_fixed: Option<usize>) -> Self {
        Self {
            elem_align,
            elem_fixed,
            body: Vec::new(),
            ends: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, elem: &[u8]) {
        let pos = align_up(self.body.len(), self.elem_align);
        self.body.resize(pos, 0);
        self.body.extend_from_slice(elem);
        match self.elem_fixed {
            Some(sz) => debug_assert_eq!(elem.len(), sz),
            None => self.ends.push(self.body.len()),
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        match self.elem_fixed {
            Some(_) => self.body,
            None => push_offsets(self.body, &self.ends),
        }
    }
}

/// Bounds-checked reader for one serialized tuple.  The caller drives
/// it with the member schema, in order.
#[derive(Debug)]
pub(crate) struct TupleReader<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
    z: usize,
    offsets_read: usize,
    n_offsets: usize,
}

impl<'a> TupleReader<'a> {
    /// `n_offsets` is the number of variable-size members excluding a
    /// variable-size final member.
    pub(crate) fn new(data: &'a [u8], n_offsets: usize) -> Result<Self> {
        let z = if n_offsets > 0 {
            offset_size(data.len())
        } else {
            0
        };
        let table = n_offsets * z;
        if table > data.len() {
            return Err(Error::corrupted("Truncated tuple"));
        }
        Ok(Self {
            data,
            pos: 0,
            limit: data.len() - table,
            z,
            offsets_read: 0,
            n_offsets,
        })
    }

    fn next_offset(&mut self) -> Result<usize> {
        if self.offsets_read == self.n_offsets {
            return Err(Error::corrupted("Tuple framing offsets exhausted"));
        }
        let idx = self.offsets_read;
        self.offsets_read += 1;
        // Offsets are stored in reverse member order at the tail.
        let end = self.data.len() - self.z * (idx + 1);
        Ok(read_le(&self.data[end..end + self.z]))
    }

    fn start(&mut self, align: usize) -> Result<usize> {
        let start = align_up(self.pos, align);
        if start > self.limit {
            return Err(Error::corrupted("Truncated tuple"));
        }
        Ok(start)
    }

    pub(crate) fn field_fixed(&mut self, align: usize, size: usize) -> Result<&'a [u8]> {
        let start = self.start(align)?;
        let end = start
            .checked_add(size)
            .filter(|&e| e <= self.limit)
            .ok_or_else(|| Error::corrupted("Truncated tuple"))?;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    pub(crate) fn field_variable(&mut self, align: usize) -> Result<&'a [u8]> {
        let start = self.start(align)?;
        let end = self.next_offset()?;
        if end < start || end > self.limit {
            return Err(Error::corrupted("Invalid tuple framing offset"));
        }
        self.pos = end;
        Ok(&self.data[start..end])
    }

    pub(crate) fn field_last(&mut self, align: usize) -> Result<&'a [u8]> {
        let start = self.start(align)?;
        self.pos = self.limit;
        Ok(&self.data[start..self.limit])
    }
}

/// Split a serialized array of variable-size elements into element
/// slices using its end-offset table.
pub(crate) fn array_variable<'a>(data: &'a [u8], elem_align: usize) -> Result<Vec<&'a [u8]>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let z = offset_size(data.len());
    if data.len() < z {
        return Err(Error::corrupted("Truncated array"));
    }
    let last_end = read_le(&data[data.len() - z..]);
    if last_end > data.len() - z {
        return Err(Error::corrupted("Invalid array framing offset"));
    }
    let table_len = data.len() - last_end;
    if table_len % z != 0 {
        return Err(Error::corrupted("Invalid array framing"));
    }
    let n = table_len / z;
    let table_start = data.len() - n * z;
    let mut elems = Vec::with_capacity(n);
    let mut prev = 0usize;
    for i in 0..n {
        let end = read_le(&data[table_start + i * z..table_start + (i + 1) * z]);
        let start = align_up(prev, elem_align);
        if start > end || end > table_start {
            return Err(Error::corrupted("Invalid array framing offset"));
        }
        elems.push(&data[start..end]);
        prev = end;
    }
    Ok(elems)
}

/// Split a serialized array of fixed-size elements.
pub(crate) fn array_fixed<'a>(data: &'a [u8], elem_size: usize) -> Result<Vec<&'a [u8]>> {
    debug_assert!(elem_size > 0);
    if data.len() % elem_size != 0 {
        return Err(Error::corrupted("Invalid fixed-size array length"));
    }
    Ok(data.chunks_exact(elem_size).collect())
}

/// Parse a serialized string: UTF-8, NUL-terminated, no interior NUL.
pub(crate) fn parse_string(data: &[u8]) -> Result<String> {
    let (last, content) = data
        .split_last()
        .ok_or_else(|| Error::corrupted("Empty string field"))?;
    if *last != 0 || content.contains(&0) {
        return Err(Error::corrupted("Malformed string field"));
    }
    Ok(std::str::from_utf8(content)
        .map_err(|_| Error::corrupted("Non-UTF-8 string field"))?
        .to_string())
}

pub(crate) fn fixed_u32(data: &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(data.try_into().map_err(|_| {
        Error::corrupted("Invalid integer field width")
    })?))
}

/// A parsed type signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ty {
    Bool,
    Byte,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F64,
    Str,
    Var,
    Array(Box<Ty>),
    Tuple(Vec<Ty>),
    Entry(Box<Ty>, Box<Ty>),
}

impl Ty {
    pub(crate) fn parse(sig: &str) -> Result<Ty> {
        let mut chars = sig.bytes().peekable();
        let ty = Self::parse_one(&mut chars, sig)?;
        if chars.next().is_some() {
            return Err(Error::corrupted(format!("Trailing type characters in {sig:?}")));
        }
        Ok(ty)
    }

    fn parse_one(
        chars: &mut std::iter::Peekable<std::str::Bytes<'_>>,
        sig: &str,
    ) -> Result<Ty> {
        let c = chars
            .next()
            .ok_or_else(|| Error::corrupted(format!("Truncated type signature {sig:?}")))?;
        Ok(match c {
            b'b' => Ty::Bool,
            b'y' => Ty::Byte,
            b'n' => Ty::I16,
            b'q' => Ty::U16,
            b'i' => Ty::I32,
            b'u' => Ty::U32,
            b'x' => Ty::I64,
            b't' => Ty::U64,
            b'd' => Ty::F64,
            b's' => Ty::Str,
            b'v' => Ty::Var,
            b'a' => Ty::Array(Box::new(Self::parse_one(chars, sig)?)),
            b'(' => {
                let mut members = Vec::new();
                loop {
                    if chars.peek() == Some(&b')') {
                        let _ = chars.next();
                        break;
                    }
                    members.push(Self::parse_one(chars, sig)?);
                }
                Ty::Tuple(members)
            }
            b'{' => {
                let k = Self::parse_one(chars, sig)?;
                let v = Self::parse_one(chars, sig)?;
                if chars.next() != Some(b'}') {
                    return Err(Error::corrupted(format!("Malformed dict entry in {sig:?}")));
                }
                Ty::Entry(Box::new(k), Box::new(v))
            }
            o => {
                return Err(Error::corrupted(format!(
                    "Unsupported type character {:?} in {sig:?}",
                    o as char
                )))
            }
        })
    }

    pub(crate) fn signature(&self) -> String {
        match self {
            Ty::Bool => "b".into(),
            Ty::Byte => "y".into(),
            Ty::I16 => "n".into(),
            Ty::U16 => "q".into(),
            Ty::I32 => "i".into(),
            Ty::U32 => "u".into(),
            Ty::I64 => "x".into(),
            Ty::U64 => "t".into(),
            Ty::F64 => "d".into(),
            Ty::Str => "s".into(),
            Ty::Var => "v".into(),
            Ty::Array(t) => format!("a{}", t.signature()),
            Ty::Tuple(ts) => {
                let mut s = String::from("(");
                for t in ts {
                    s.push_str(&t.signature());
                }
                s.push(')');
                s
            }
            Ty::Entry(k, v) => format!("{{{}{}}}", k.signature(), v.signature()),
        }
    }

    pub(crate) fn align(&self) -> usize {
        match self {
            Ty::Bool | Ty::Byte | Ty::Str => 1,
            Ty::I16 | Ty::U16 => 2,
            Ty::I32 | Ty::U32 => 4,
            Ty::I64 | Ty::U64 | Ty::F64 | Ty::Var => 8,
            Ty::Array(t) => t.align(),
            Ty::Tuple(ts) => ts.iter().map(Ty::align).max().unwrap_or(1),
            Ty::Entry(k, v) => k.align().max(v.align()),
        }
    }

    pub(crate) fn fixed_size(&self) -> Option<usize> {
        match self {
            Ty::Bool | Ty::Byte => Some(1),
            Ty::I16 | Ty::U16 => Some(2),
            Ty::I32 | Ty::U32 => Some(4),
            Ty::I64 | Ty::U64 | Ty::F64 => Some(8),
            Ty::Str | Ty::Var | Ty::Array(_) => None,
            Ty::Tuple(ts) => {
                let mut pos = 0usize;
                for t in ts {
                    pos = align_up(pos, t.align()) + t.fixed_size()?;
                }
                Some(align_up(pos, self.align()).max(1))
            }
            Ty::Entry(k, v) => {
                let mut pos = align_up(0, k.align()) + k.fixed_size()?;
                pos = align_up(pos, v.align()) + v.fixed_size()?;
                Some(align_up(pos, self.align()).max(1))
            }
        }
    }
}

/// A dynamically-typed serialized value.
///
/// Commit metadata and detached commit metadata are the only places a
/// truly schemaless dictionary survives; everything else in the store
/// has a closed record layout.  The sum is closed: these are exactly
/// the types the canonical form can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Unsigned byte.
    Byte(u8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// IEEE double.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Raw byte array (`ay`).
    Bytes(Vec<u8>),
    /// Homogeneous array: element signature plus items.
    Array(String, Vec<Value>),
    /// String-keyed dictionary with variant values (`a{sv}`).
    Dict(BTreeMap<String, Value>),
    /// Heterogeneous tuple.
    Tuple(Vec<Value>),
    /// A boxed value carrying its own signature.
    Variant(Box<Value>),
}

impl Value {
    /// The type signature of this value.
    pub fn signature(&self) -> String {
        match self {
            Value::Bool(_) => "b".into(),
            Value::Byte(_) => "y".into(),
            Value::Int16(_) => "n".into(),
            Value::UInt16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::UInt32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::UInt64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::String(_) => "s".into(),
            Value::Bytes(_) => "ay".into(),
            Value::Array(sig, _) => format!("a{sig}"),
            Value::Dict(_) => "a{sv}".into(),
            Value::Tuple(vs) => {
                let mut s = String::from("(");
                for v in vs {
                    s.push_str(&v.signature());
                }
                s.push(')');
                s
            }
            Value::Variant(_) => "v".into(),
        }
    }

    /// Serialize to canonical bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Value::Bool(b) => vec![*b as u8],
            Value::Byte(b) => vec![*b],
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::UInt16(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::UInt32(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::UInt64(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::String(s) => {
                let mut b = s.clone().into_bytes();
                b.push(0);
                b
            }
            Value::Bytes(b) => b.clone(),
            Value::Array(sig, items) => {
                let elem = Ty::parse(sig)?;
                let mut b = ArrayBuilder::new(elem.align(), elem.fixed_size());
                for item in items {
                    if item.signature() != *sig {
                        return Err(anyhow!(
                            "Array element signature {} does not match {}",
                            item.signature(),
                            sig
                        ));
                    }
                    b.push(&item.serialize()?);
                }
                b.finish()
            }
            Value::Dict(map) => {
                let mut b = ArrayBuilder::new(8, None);
                for (k, v) in map {
                    let mut entry = TupleBuilder::new();
                    entry.push_str(k);
                    entry.push_variable(8, &Value::Variant(Box::new(v.clone())).serialize()?);
                    b.push(&entry.finish());
                }
                b.finish()
            }
            Value::Tuple(vs) => {
                let mut b = TupleBuilder::new();
                for v in vs {
                    let ty = Ty::parse(&v.signature())?;
                    let bytes = v.serialize()?;
                    match ty.fixed_size() {
                        Some(_) => b.push_fixed(ty.align(), &bytes),
                        None => b.push_variable(ty.align(), &bytes),
                    }
                }
                b.finish()
            }
            Value::Variant(inner) => {
                let mut b = inner.serialize()?;
                b.push(0);
                b.extend_from_slice(inner.signature().as_bytes());
                b
            }
        })
    }

    /// Parse canonical bytes with the given signature.
    pub fn parse(sig: &str, data: &[u8]) -> Result<Value> {
        let ty = Ty::parse(sig)?;
        Self::parse_ty(&ty, data)
    }

    fn parse_ty(ty: &Ty, data: &[u8]) -> Result<Value> {
        Ok(match ty {
            Ty::Bool => match data {
                [0] => Value::Bool(false),
                [1] => Value::Bool(true),
                _ => return Err(Error::corrupted("Malformed boolean")),
            },
            Ty::Byte => match data {
                [b] => Value::Byte(*b),
                _ => return Err(Error::corrupted("Malformed byte")),
            },
            Ty::I16 => Value::Int16(i16::from_le_bytes(fixed_bytes(data)?)),
            Ty::U16 => Value::UInt16(u16::from_le_bytes(fixed_bytes(data)?)),
            Ty::I32 => Value::Int32(i32::from_le_bytes(fixed_bytes(data)?)),
            Ty::U32 => Value::UInt32(u32::from_le_bytes(fixed_bytes(data)?)),
            Ty::I64 => Value::Int64(i64::from_le_bytes(fixed_bytes(data)?)),
            Ty::U64 => Value::UInt64(u64::from_le_bytes(fixed_bytes(data)?)),
            Ty::F64 => Value::Double(f64::from_le_bytes(fixed_bytes(data)?)),
            Ty::Str => Value::String(parse_string(data)?),
            Ty::Var => {
                let sep = data
                    .iter()
                    .rposition(|&b| b == 0)
                    .ok_or_else(|| Error::corrupted("Malformed variant"))?;
                let sig = std::str::from_utf8(&data[sep + 1..])
                    .map_err(|_| Error::corrupted("Malformed variant signature"))?;
                let inner = Ty::parse(sig)?;
                Value::Variant(Box::new(Self::parse_ty(&inner, &data[..sep])?))
            }
            Ty::Array(elem) => match elem.as_ref() {
                Ty::Byte => Value::Bytes(data.to_vec()),
                Ty::Entry(k, v) if **k == Ty::Str && **v == Ty::Var => {
                    let mut map = BTreeMap::new();
                    for entry in array_variable(data, ty.align())? {
                        let mut r = TupleReader::new(entry, 1)?;
                        let key = parse_string(r.field_variable(1)?)?;
                        let val = Self::parse_ty(&Ty::Var, r.field_last(8)?)?;
                        let val = match val {
                            Value::Variant(inner) => *inner,
                            o => o,
                        };
                        if map.insert(key, val).is_some() {
                            return Err(Error::corrupted("Duplicate dictionary key"));
                        }
                    }
                    Value::Dict(map)
                }
                e => {
                    let items: Result<Vec<Value>> = match e.fixed_size() {
                        Some(sz) => array_fixed(data, sz)?
                            .into_iter()
                            .map(|b| Self::parse_ty(e, b))
                            .collect(),
                        None => array_variable(data, e.align())?
                            .into_iter()
                            .map(|b| Self::parse_ty(e, b))
                            .collect(),
                    };
                    Value::Array(e.signature(), items?)
                }
            },
            Ty::Tuple(members) => {
                let n_offsets = members
                    .iter()
                    .enumerate()
                    .filter(|(i, m)| m.fixed_size().is_none() && *i + 1 != members.len())
                    .count();
                let mut r = TupleReader::new(data, n_offsets)?;
                let mut vs = Vec::with_capacity(members.len());
                for (i, m) in members.iter().enumerate() {
                    let field = match (m.fixed_size(), i + 1 == members.len()) {
                        (Some(sz), _) => r.field_fixed(m.align(), sz)?,
                        (None, false) => r.field_variable(m.align())?,
                        (None, true) => r.field_last(m.align())?,
                    };
                    vs.push(Self::parse_ty(m, field)?);
                }
                Value::Tuple(vs)
            }
            Ty::Entry(k, v) => {
                let n_offsets = usize::from(k.fixed_size().is_none());
                let mut r = TupleReader::new(data, n_offsets)?;
                let key = match k.fixed_size() {
                    Some(sz) => r.field_fixed(k.align(), sz)?,
                    None => r.field_variable(k.align())?,
                };
                let key = Self::parse_ty(k, key)?;
                let val = match v.fixed_size() {
                    Some(sz) => r.field_fixed(v.align(), sz)?,
                    None => r.field_last(v.align())?,
                };
                Value::Tuple(vec![key, Self::parse_ty(v, val)?])
            }
        })
    }
}

fn fixed_bytes<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.try_into()
        .map_err(|_| Error::corrupted("Invalid integer field width"))
}
