//! Bridging the synchronous store core onto an async runtime.
//!
//! The store core is synchronous and blocking on I/O; long operations
//! are pushed onto the runtime's worker-thread pool by callers (the
//! CLI does this for commit, fsck and delta work).  The core does not
//! own an executor.

use anyhow::Context;

use crate::Result;

/// Run a blocking store operation on the worker pool of the ambient
/// runtime.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Worker thread panicked")?
}
