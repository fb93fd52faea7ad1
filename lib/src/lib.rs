//! # Content-addressed filesystem tree store
//!
//! This crate records immutable versions of POSIX directory hierarchies
//! as a Merkle forest of four object types (file content, directory
//! metadata, directory tree, and commit), stored under a repository root
//! and addressed by SHA-256.  It supports multiple on-disk encodings,
//! named mutable pointers ("refs") to commits, and a binary patch format
//! ("static deltas") for transporting the diff between two commits.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
pub type Result<T> = anyhow::Result<T>;

mod async_util;
pub mod checksum;
pub mod cli;
pub mod commit;
pub mod delta;
mod error;
pub mod fsck;
pub mod objects;
pub mod prune;
pub mod pull;
pub mod refs;
pub mod repo;
pub mod sign;
pub mod traversal;
mod util;
mod variant;
mod varint;

pub use error::{is_not_found, Error};
pub use objects::{ObjectName, ObjectType};
pub use repo::Repo;
pub use util::Cancellable;
pub use variant::Value;
