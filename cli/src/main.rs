//! Command-line interface for treestore.

// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

/// Initialize tracing with the default configuration: compact format,
/// no timestamps (log collectors add their own), stderr writer.
fn initialize_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<()> {
    initialize_tracing();
    tracing::trace!("starting");
    treestore_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(treestore_lib::cli::exit_code_for_error(&e));
    }
}
