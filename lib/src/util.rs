//! Small internal helpers shared across modules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::Result;

/// Maximum length of untrusted input echoed into error messages.
const MAX_QUOTED_LEN: usize = 64;

/// Render untrusted bytes for an error message: non-printable bytes are
/// replaced with a space and the result is truncated to a bounded
/// length, so adversarial input cannot produce unbounded or
/// terminal-corrupting output.
pub(crate) fn quashed(input: &[u8]) -> String {
    let truncated = input.len() > MAX_QUOTED_LEN;
    let mut s: String = input
        .iter()
        .take(MAX_QUOTED_LEN)
        .map(|&b| {
            if (0x20..0x7f).contains(&b) {
                b as char
            } else {
                ' '
            }
        })
        .collect();
    if truncated {
        s.push_str("...");
    }
    s
}

/// A cooperative cancellation token.
///
/// Long operations accept `Option<&Cancellable>` and poll it at the top
/// of each opcode, before each part, before each object write, and
/// inside I/O loops.  Triggering is sticky.
#[derive(Clone, Debug, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
    /// Create a new, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of all operations holding this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Check a cancellation point; errors with the operation name if the
/// token was triggered.
pub(crate) fn check_cancelled(c: Option<&Cancellable>, op: &str) -> Result<()> {
    match c {
        Some(c) if c.is_cancelled() => Err(Error::TransactionAborted(format!(
            "Cancelled during {op}"
        ))
        .into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quashed() {
        assert_eq!(quashed(b"abc"), "abc");
        assert_eq!(quashed(b"a\x00b\nc"), "a b c");
        let long = vec![b'x'; 200];
        let q = quashed(&long);
        assert_eq!(q.len(), MAX_QUOTED_LEN + 3);
        assert!(q.ends_with("..."));
    }

    #[test]
    fn test_cancellable() {
        let c = Cancellable::new();
        assert!(check_cancelled(Some(&c), "test").is_ok());
        assert!(check_cancelled(None, "test").is_ok());
        c.cancel();
        assert!(check_cancelled(Some(&c), "test").is_err());
        assert!(c.is_cancelled());
    }
}
