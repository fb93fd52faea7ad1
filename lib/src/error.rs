//! The typed error taxonomy.
//!
//! Most APIs in this crate return [`anyhow::Result`]; the variants here
//! are embedded in the error chain so callers that need to distinguish
//! failure classes (scripts keying on exit codes, the delta applier's
//! strict mode, tests) can `downcast_ref` to [`Error`].

use crate::objects::ObjectType;

/// The closed set of failure kinds surfaced by the store.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An object or ref is absent.
    #[error("{0} not found")]
    NotFound(String),
    /// An object parses structurally but fails an invariant check.
    #[error("Corrupted object: {0}")]
    Corrupted(String),
    /// A computed digest differs from the expected one.
    #[error("Corrupted {objtype} object; checksum expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Type of the object that failed validation.
        objtype: ObjectType,
        /// The checksum the caller declared.
        expected: String,
        /// The checksum computed from the data.
        actual: String,
    },
    /// Opcode bounds violation, truncated stream, or unknown opcode.
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),
    /// The caller passed a malformed ref name, refspec, or option value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Cancellation or an underlying error aborted an active transaction.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    /// The filesystem refused an operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// A ref create collision where the caller asked for exclusive creation.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// All other underlying I/O errors, preserved with the original code.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An envelope or commit signature failed verification.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),
}

impl Error {
    pub(crate) fn not_found(what: impl std::fmt::Display) -> anyhow::Error {
        Self::NotFound(what.to_string()).into()
    }

    pub(crate) fn corrupted(what: impl std::fmt::Display) -> anyhow::Error {
        Self::Corrupted(what.to_string()).into()
    }

    pub(crate) fn invalid_delta(what: impl std::fmt::Display) -> anyhow::Error {
        Self::InvalidDelta(what.to_string()).into()
    }

    pub(crate) fn invalid_arg(what: impl std::fmt::Display) -> anyhow::Error {
        Self::InvalidArgument(what.to_string()).into()
    }
}

/// Whether the root cause of this error is a missing object or ref.
///
/// Traversal of partial commits and the CLI's distinguished exit code
/// both key on this rather than matching error strings.
pub fn is_not_found(e: &anyhow::Error) -> bool {
    for cause in e.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            if matches!(e, Error::NotFound(_)) {
                return true;
            }
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            if e.kind() == std::io::ErrorKind::NotFound {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        let e = Error::not_found("commit 1234");
        assert!(is_not_found(&e));
        let e = e.context("Loading commit");
        assert!(is_not_found(&e));
        let e = Error::corrupted("bad mode");
        assert!(!is_not_found(&e));
        let e: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into();
        assert!(is_not_found(&e.context("opening object")));
    }
}
