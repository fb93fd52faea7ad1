//! Ref, refspec and collection-ID grammars.
//!
//! The grammars are small and regular, so they are enforced by
//! hand-written validators rather than compiled patterns.  File-level
//! storage of refs lives on [`crate::Repo`]; everything here is pure.

use crate::error::Error;
use crate::util::quashed;
use crate::Result;

fn valid_fragment(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {}
        _ => return false,
    }
    bytes.all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_'))
}

/// Validate a ref name: one or more `/`-separated fragments, each
/// starting with `[A-Za-z0-9_]` and continuing with `[-._A-Za-z0-9]`.
/// This implies no empty name, no leading/trailing `/`, and no `//`.
pub fn validate_ref(s: &str) -> Result<()> {
    if !s.is_empty() && s.split('/').all(valid_fragment) {
        Ok(())
    } else {
        Err(Error::invalid_arg(format!(
            "Invalid ref name {}",
            quashed(s.as_bytes())
        )))
    }
}

/// Validate a remote name: a single ref fragment.  Names ending in
/// `.sig` are rejected so that the summary-cache layout (which stores
/// `<name>` next to `<name>.sig`) stays unambiguous.
pub fn validate_remote_name(s: &str) -> Result<()> {
    if !valid_fragment(s) {
        return Err(Error::invalid_arg(format!(
            "Invalid remote name {}",
            quashed(s.as_bytes())
        )));
    }
    if s.ends_with(".sig") {
        return Err(Error::invalid_arg(format!(
            "Invalid remote name {}: the \".sig\" suffix is reserved",
            quashed(s.as_bytes())
        )));
    }
    Ok(())
}

/// Parse a refspec `[<remote>:]<ref>` into its parts.
pub fn parse_refspec(s: &str) -> Result<(Option<String>, String)> {
    match s.split_once(':') {
        Some((remote, r)) => {
            validate_remote_name(remote)?;
            validate_ref(r)?;
            Ok((Some(remote.to_string()), r.to_string()))
        }
        None => {
            validate_ref(s)?;
            Ok((None, s.to_string()))
        }
    }
}

/// Validate a collection ID: reverse-DNS style, at most 255 characters,
/// at least two dot-separated elements, each starting with a letter or
/// underscore and continuing with `[A-Za-z0-9_-]`.
pub fn validate_collection_id(s: &str) -> Result<()> {
    let element_ok = |e: &str| {
        let mut bytes = e.bytes();
        match bytes.next() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {}
            _ => return false,
        }
        bytes.all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_'))
    };
    if s.len() <= 255 && s.split('.').count() >= 2 && s.split('.').all(element_ok) {
        Ok(())
    } else {
        Err(Error::invalid_arg(format!(
            "Invalid collection ID {}",
            quashed(s.as_bytes())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_refs() {
        for r in [
            "main",
            "heads/main",
            "exampleos/x86_64/standard",
            "_private",
            "v1.2.3",
            "a",
            "0ref",
            "a/b/c/d",
            "with-dash",
        ] {
            assert!(validate_ref(r).is_ok(), "{r} should be valid");
        }
    }

    #[test]
    fn test_invalid_refs() {
        for r in [
            "", "/", "/main", "main/", "a//b", "-lead", ".lead", "a b", "a:b", "å", "a/",
        ] {
            assert!(validate_ref(r).is_err(), "{r:?} should be invalid");
        }
    }

    #[test]
    fn test_refspec() {
        assert_eq!(
            parse_refspec("origin:exampleos/x86_64/standard").unwrap(),
            (
                Some("origin".to_string()),
                "exampleos/x86_64/standard".to_string()
            )
        );
        assert_eq!(parse_refspec("main").unwrap(), (None, "main".to_string()));
        // A remote name cannot contain '/'.
        assert!(parse_refspec("bad/remote:ref").is_err());
        assert!(parse_refspec(":ref").is_err());
        assert!(parse_refspec("origin:").is_err());
    }

    #[test]
    fn test_remote_names() {
        assert!(validate_remote_name("origin").is_ok());
        assert!(validate_remote_name("my-mirror.example").is_ok());
        assert!(validate_remote_name("a/b").is_err());
        assert!(validate_remote_name("").is_err());
        // Reserved to keep the summary cache layout unambiguous.
        assert!(validate_remote_name("tricky.sig").is_err());
    }

    #[test]
    fn test_collection_ids() {
        assert!(validate_collection_id("org.example.Os").is_ok());
        assert!(validate_collection_id("com.example.my-os").is_ok());
        assert!(validate_collection_id("nodots").is_err());
        assert!(validate_collection_id("org..example").is_err());
        assert!(validate_collection_id("org.1starts-with-digit").is_err());
        assert!(validate_collection_id(&"a.".repeat(200)).is_err());
    }
}
