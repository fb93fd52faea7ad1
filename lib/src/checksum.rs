//! SHA-256 digest handling and the textual encodings of object names.
//!
//! Binary digests are 32 bytes.  Two textual encodings exist: lowercase
//! hex (64 chars, the canonical form used in refs and object paths) and
//! a modified base64 (`/` replaced by `_`, padding stripped, exactly 43
//! chars) used only to build the short path prefixes of static deltas.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};

use crate::error::Error;
use crate::util::quashed;
use crate::Result;

/// Length in bytes of a binary SHA-256 digest.
pub const DIGEST_LEN: usize = 32;
/// Length in characters of a hex digest.
pub const HEX_LEN: usize = 64;
/// Length in characters of a modified-base64 digest.
pub const B64_LEN: usize = 43;

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+_";

/// A binary SHA-256 digest identifying one object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; DIGEST_LEN]);

impl Checksum {
    /// Wrap a raw 32-byte digest.
    pub fn new(digest: [u8; DIGEST_LEN]) -> Self {
        Self(digest)
    }

    /// Parse from a byte slice; errors unless it is exactly 32 bytes.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        let b: [u8; DIGEST_LEN] = b
            .try_into()
            .map_err(|_| Error::corrupted(format!("Invalid checksum of length {}", b.len())))?;
        Ok(Self(b))
    }

    /// Parse a 64-character lowercase hex digest.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(Error::invalid_arg(format!(
                "Invalid checksum of length {} expected {}: {}",
                s.len(),
                HEX_LEN,
                quashed(s.as_bytes())
            )));
        }
        if !s.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::invalid_arg(format!(
                "Invalid checksum characters: {}",
                quashed(s.as_bytes())
            )));
        }
        let mut buf = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut buf).context("Decoding checksum")?;
        Ok(Self(buf))
    }

    /// Parse the 43-character modified-base64 form.
    pub fn from_b64(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        if b.len() != B64_LEN {
            return Err(Error::invalid_arg(format!(
                "Invalid base64 checksum of length {}: {}",
                b.len(),
                quashed(b)
            )));
        }
        let mut bits = 0u32;
        let mut nbits = 0u32;
        let mut out = [0u8; DIGEST_LEN];
        let mut pos = 0;
        for &c in b {
            let v = B64_ALPHABET
                .iter()
                .position(|&a| a == c)
                .ok_or_else(|| {
                    Error::invalid_arg(format!("Invalid base64 checksum: {}", quashed(b)))
                })? as u32;
            bits = (bits << 6) | v;
            nbits += 6;
            if nbits >= 8 {
                nbits -= 8;
                if pos < DIGEST_LEN {
                    out[pos] = (bits >> nbits) as u8;
                    pos += 1;
                }
            }
        }
        if pos != DIGEST_LEN {
            return Err(Error::invalid_arg(format!(
                "Invalid base64 checksum: {}",
                quashed(b)
            )));
        }
        Ok(Self(out))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Write the hex form into a caller-provided buffer, avoiding
    /// allocation on hot paths, and return it as `&str`.
    pub fn to_hex_buf<'a>(&self, buf: &'a mut [u8; HEX_LEN]) -> &'a str {
        // Unwrap safety: a 64-byte output buffer always fits 32 input bytes,
        // and hex output is ASCII.
        hex::encode_to_slice(self.0, buf).unwrap();
        std::str::from_utf8(buf).unwrap()
    }

    /// The hex form as an owned string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The modified-base64 form: standard base64 with `/` replaced by
    /// `_` and the trailing padding removed.  Contains no `/`, so it is
    /// safe to embed in a single path component.
    pub fn to_b64(&self) -> String {
        let mut out = String::with_capacity(B64_LEN);
        let mut bits = 0u32;
        let mut nbits = 0u32;
        for &b in self.0.iter() {
            bits = (bits << 8) | b as u32;
            nbits += 8;
            while nbits >= 6 {
                nbits -= 6;
                out.push(B64_ALPHABET[((bits >> nbits) & 0x3f) as usize] as char);
            }
        }
        // 256 bits leave 4 trailing bits; pad them with zeroes.
        debug_assert_eq!(nbits, 4);
        out.push(B64_ALPHABET[((bits << 2) & 0x3f) as usize] as char);
        out
    }

    /// Split the hex form into the two-character directory prefix and
    /// the remaining 62 characters, as used by the loose object layout.
    pub fn to_hex_parts(&self) -> (String, String) {
        let hex = self.to_hex();
        let (a, b) = hex.split_at(2);
        (a.to_string(), b.to_string())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; HEX_LEN];
        f.write_str(self.to_hex_buf(&mut buf))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// An in-progress SHA-256 computation.
pub struct Hasher(openssl::hash::Hasher);

impl Hasher {
    /// Begin a new digest computation.
    pub fn new() -> Result<Self> {
        Ok(Self(openssl::hash::Hasher::new(
            openssl::hash::MessageDigest::sha256(),
        )?))
    }

    /// Feed data.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.0.update(data)?;
        Ok(())
    }

    /// Finish and return the digest.
    pub fn finish(mut self) -> Result<Checksum> {
        let digest = self.0.finish()?;
        Checksum::from_bytes(&digest)
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hasher")
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf)
            .map_err(|e| std::io::Error::other(format!("{e}")))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> Result<Checksum> {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)?;
    Checksum::from_bytes(&digest)
}

/// Parse a checksum that arrived as a GVariant-style byte array; an
/// empty array means "absent" (e.g. a commit with no parent).
pub fn optional_checksum(b: &[u8]) -> Result<Option<Checksum>> {
    if b.is_empty() {
        return Ok(None);
    }
    Checksum::from_bytes(b).map(Some)
}

/// Like [`optional_checksum`], but for required fields.
pub fn required_checksum(b: &[u8]) -> Result<Checksum> {
    optional_checksum(b)?.ok_or_else(|| anyhow!("Missing checksum"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "ed33612f9bb2dc97b0bbc50df9b03ac7d17ab26e37a252317e5d5a386db04dc7";

    #[test]
    fn test_hex_roundtrip() {
        let c = Checksum::from_hex(SAMPLE).unwrap();
        assert_eq!(c.to_hex(), SAMPLE);
        let mut buf = [0u8; HEX_LEN];
        assert_eq!(c.to_hex_buf(&mut buf), SAMPLE);
    }

    #[test]
    fn test_hex_rejects() {
        assert!(Checksum::from_hex("").is_err());
        assert!(Checksum::from_hex(&SAMPLE[..63]).is_err());
        assert!(Checksum::from_hex(&format!("{}0", SAMPLE)).is_err());
        // Uppercase is rejected; parsing is case-sensitive.
        assert!(Checksum::from_hex(&SAMPLE.to_uppercase()).is_err());
        let bad = format!("g{}", &SAMPLE[1..]);
        assert!(Checksum::from_hex(&bad).is_err());
    }

    #[test]
    fn test_b64_roundtrip() {
        let c = Checksum::from_hex(SAMPLE).unwrap();
        let b64 = c.to_b64();
        assert_eq!(b64.len(), B64_LEN);
        assert!(!b64.contains('/'));
        assert!(!b64.contains('='));
        assert_eq!(Checksum::from_b64(&b64).unwrap(), c);
    }

    #[test]
    fn test_sha256() {
        // Well-known digest of the empty input.
        let c = sha256(b"").unwrap();
        assert_eq!(
            c.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hasher_matches_oneshot() {
        let mut h = Hasher::new().unwrap();
        h.update(b"hello ").unwrap();
        h.update(b"world").unwrap();
        assert_eq!(h.finish().unwrap(), sha256(b"hello world").unwrap());
    }

    quickcheck::quickcheck! {
        fn prop_roundtrip(data: Vec<u8>) -> bool {
            let c = sha256(&data).unwrap();
            let hex = c.to_hex();
            let b64 = c.to_b64();
            Checksum::from_hex(&hex).unwrap() == c && Checksum::from_b64(&b64).unwrap() == c
        }
    }
}
