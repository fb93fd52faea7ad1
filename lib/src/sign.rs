//! Signing support for static-delta envelopes and commits.
//!
//! One scheme is implemented: ed25519 over raw key bytes.  The
//! envelope binds the exact superblock bytes; changing any byte of the
//! superblock invalidates all signatures.

use anyhow::Context;
use openssl::pkey::{Id, PKey};

use crate::error::Error;
use crate::Result;

/// The sign-scheme key used in signature maps.
pub const SIGN_SCHEME_ED25519: &str = "ed25519";

/// Generate a fresh keypair, returning (public, secret) raw bytes.
pub fn generate_ed25519_keypair() -> Result<(Vec<u8>, Vec<u8>)> {
    let key = PKey::generate_ed25519().context("Generating keypair")?;
    Ok((key.raw_public_key()?, key.raw_private_key()?))
}

/// Sign `data` with a raw ed25519 secret key.
pub fn sign_ed25519(secret: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let key = PKey::private_key_from_raw_bytes(secret, Id::ED25519)
        .map_err(|_| Error::invalid_arg("Malformed ed25519 secret key"))?;
    let mut signer =
        openssl::sign::Signer::new_without_digest(&key).context("Initializing signer")?;
    Ok(signer.sign_oneshot_to_vec(data)?)
}

/// Verify `sig` over `data` with a raw ed25519 public key.  Returns
/// `Ok(false)` on a well-formed but wrong signature; errors only on
/// malformed keys.
pub fn verify_ed25519(public: &[u8], data: &[u8], sig: &[u8]) -> Result<bool> {
    let key = PKey::public_key_from_raw_bytes(public, Id::ED25519)
        .map_err(|_| Error::invalid_arg("Malformed ed25519 public key"))?;
    let mut verifier =
        openssl::sign::Verifier::new_without_digest(&key).context("Initializing verifier")?;
    Ok(verifier.verify_oneshot(sig, data).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let (public, secret) = generate_ed25519_keypair().unwrap();
        let data = b"superblock bytes";
        let sig = sign_ed25519(&secret, data).unwrap();
        assert!(verify_ed25519(&public, data, &sig).unwrap());
        // Any modification invalidates the signature.
        assert!(!verify_ed25519(&public, b"superblock byteS", &sig).unwrap());
        let mut bad = sig.clone();
        bad[0] ^= 1;
        assert!(!verify_ed25519(&public, data, &bad).unwrap());
        // A different key does not verify.
        let (other, _) = generate_ed25519_keypair().unwrap();
        assert!(!verify_ed25519(&other, data, &sig).unwrap());
    }

    #[test]
    fn test_malformed_keys() {
        assert!(sign_ed25519(b"short", b"data").is_err());
        assert!(verify_ed25519(b"short", b"data", &[0; 64]).is_err());
    }
}
