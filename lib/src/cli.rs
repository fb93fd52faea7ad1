//! # Command line tool for the tree store
//!
//! Thin veneer over the library APIs; the binary crate dispatches
//! here.

use std::collections::BTreeMap;
use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::checksum::Checksum;
use crate::commit::{commit_filesystem, CommitOptions};
use crate::delta::{
    apply_delta, apply_delta_from_path, generate_delta, list_deltas, load_superblock,
    ApplyOptions, DeltaGenerateOptions,
};
use crate::prune::{prune, PruneOptions};
use crate::pull::{pull_local, PullOptions};
use crate::repo::{CheckoutOptions, Repo, RepoMode};
use crate::variant::Value;

/// Shared repository locator.
#[derive(Debug, Parser)]
struct RepoOpts {
    /// Path to the repository
    #[clap(long, default_value = ".")]
    repo: Utf8PathBuf,
}

impl RepoOpts {
    fn open(&self) -> Result<Repo> {
        Repo::open(&self.repo)
    }
}

/// Initialize a new repository
#[derive(Debug, Parser)]
struct InitOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// On-disk encoding: bare, bare-user, bare-user-only,
    /// bare-split-xattrs or archive
    #[clap(long, default_value = "bare")]
    mode: String,
}

/// Commit a directory tree
#[derive(Debug, Parser)]
struct CommitOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Ref to update with the new commit
    #[clap(long, short = 'b')]
    branch: String,

    /// One-line subject
    #[clap(long, short = 's', default_value = "")]
    subject: String,

    /// Full description
    #[clap(long, default_value = "")]
    body: String,

    /// Add a string-valued metadata key (KEY=VALUE)
    #[clap(long = "add-metadata-string")]
    metadata: Vec<String>,

    /// Override the commit timestamp (seconds since the epoch)
    #[clap(long)]
    timestamp: Option<u64>,

    /// Record this uid for all filesystem entries
    #[clap(long)]
    owner_uid: Option<u32>,

    /// Record this gid for all filesystem entries
    #[clap(long)]
    owner_gid: Option<u32>,

    /// Record extended attributes of the source files
    #[clap(long)]
    record_xattrs: bool,

    /// The tree to commit
    path: Utf8PathBuf,
}

/// Check out a commit into a new directory
#[derive(Debug, Parser)]
struct CheckoutOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Do not restore ownership or xattrs (default when not root)
    #[clap(long, short = 'U')]
    user_mode: bool,

    /// Ref or commit checksum
    rev: String,

    /// Destination directory (must not exist)
    target: Utf8PathBuf,
}

/// Check repository consistency
#[derive(Debug, Parser)]
struct FsckOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Output the report in JSON format
    #[clap(long)]
    json: bool,
}

/// Delete unreachable objects
#[derive(Debug, Parser)]
struct PruneOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Only keep objects reachable from refs
    #[clap(long)]
    refs_only: bool,

    /// Parent-chain depth to keep (-1 for unbounded)
    #[clap(long, default_value_t = -1)]
    depth: i32,

    /// Only compute and display what would be deleted
    #[clap(long)]
    no_prune: bool,

    /// Explicitly delete this commit first
    #[clap(long)]
    delete_commit: Option<String>,

    /// Output the totals in JSON format
    #[clap(long)]
    json: bool,
}

/// List refs
#[derive(Debug, Parser)]
struct RefsOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Restrict to a prefix (or `remote:` namespace)
    prefix: Option<String>,

    /// Delete this ref instead of listing
    #[clap(long)]
    delete: Option<String>,

    /// Point a new ref at a commit (REF=CHECKSUM); fails if it exists
    #[clap(long)]
    create: Option<String>,
}

/// Show the commit history of a ref
#[derive(Debug, Parser)]
struct LogOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Ref or commit checksum
    rev: String,
}

/// Show details of one commit
#[derive(Debug, Parser)]
struct ShowOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Ref or commit checksum
    rev: String,
}

/// Generate a static delta
#[derive(Debug, Parser)]
struct StaticDeltaGenerateOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Source commit or ref (omit for a from-scratch delta)
    #[clap(long)]
    from: Option<String>,

    /// Target commit or ref
    #[clap(long)]
    to: String,

    /// Embed part bodies in the superblock
    #[clap(long)]
    inline: bool,

    /// Do not attempt binary diffs
    #[clap(long)]
    disable_bsdiff: bool,

    /// Store parts uncompressed
    #[clap(long)]
    disable_compression: bool,

    /// Upper bound on per-part payload, in MiB
    #[clap(long)]
    max_chunk_size: Option<u64>,

    /// Sign the superblock with the raw ed25519 secret key in this
    /// file
    #[clap(long)]
    sign_key_file: Option<Utf8PathBuf>,

    /// Override the embedded generation timestamp
    #[clap(long)]
    timestamp: Option<u64>,

    /// Print per-object and per-part statistics
    #[clap(long, short = 'v')]
    verbose: bool,
}

/// Apply a static delta
#[derive(Debug, Parser)]
struct StaticDeltaApplyOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Delta directory; omit to use the repository's own delta for
    /// --from/--to
    path: Option<Utf8PathBuf>,

    /// Source commit or ref
    #[clap(long)]
    from: Option<String>,

    /// Target commit or ref
    #[clap(long)]
    to: Option<String>,

    /// Validate every opcode without writing objects
    #[clap(long)]
    stats_only: bool,

    /// Abort on the first failed part
    #[clap(long)]
    strict: bool,

    /// Trusted raw ed25519 public key file; may be repeated
    #[clap(long = "trusted-key")]
    trusted_keys: Vec<Utf8PathBuf>,
}

/// Show a delta superblock
#[derive(Debug, Parser)]
struct StaticDeltaShowOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Source commit or ref
    #[clap(long)]
    from: Option<String>,

    /// Target commit or ref
    #[clap(long)]
    to: String,
}

/// Operations on static deltas
#[derive(Debug, clap::Subcommand)]
enum StaticDeltaOpts {
    Generate(StaticDeltaGenerateOpts),
    Apply(StaticDeltaApplyOpts),
    Show(StaticDeltaShowOpts),
    /// List deltas present in the repository
    List {
        #[clap(flatten)]
        repo: RepoOpts,
    },
}

/// Pull refs from a local source repository
#[derive(Debug, Parser)]
struct PullOpts {
    #[clap(flatten)]
    repo: RepoOpts,

    /// Configured remote name, or a filesystem path
    src: String,

    /// Refs to pull
    #[clap(required = true)]
    refs: Vec<String>,

    /// Parent-chain depth (-1 for unbounded)
    #[clap(long, default_value_t = 0)]
    depth: i32,
}

/// Manage remotes
#[derive(Debug, clap::Subcommand)]
enum RemoteOpts {
    /// Add a remote
    Add {
        #[clap(flatten)]
        repo: RepoOpts,
        name: String,
        url: String,
        /// Disable signature verification for this remote
        #[clap(long)]
        no_gpg_verify: bool,
    },
    /// Remove a remote, its refs and cached state
    Remove {
        #[clap(flatten)]
        repo: RepoOpts,
        name: String,
    },
    /// List remotes
    List {
        #[clap(flatten)]
        repo: RepoOpts,
    },
}

/// Toplevel commands.
#[derive(Debug, Parser)]
#[clap(name = "treestore", version, rename_all = "kebab-case")]
enum Opt {
    Init(InitOpts),
    Commit(CommitOpts),
    Checkout(CheckoutOpts),
    Fsck(FsckOpts),
    Prune(PruneOpts),
    Refs(RefsOpts),
    Log(LogOpts),
    Show(ShowOpts),
    #[clap(subcommand)]
    StaticDelta(StaticDeltaOpts),
    Pull(PullOpts),
    #[clap(subcommand)]
    Remote(RemoteOpts),
}

/// The distinguished exit code for missing objects/refs, so scripts
/// can tell a partial repository from a real failure.
pub const EXIT_NOT_FOUND: i32 = 77;

/// Map an error to the process exit code contract.
pub fn exit_code_for_error(e: &anyhow::Error) -> i32 {
    if crate::is_not_found(e) {
        EXIT_NOT_FOUND
    } else {
        1
    }
}

fn format_timestamp(ts: u64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S +0000").to_string())
        .unwrap_or_else(|| format!("@{ts}"))
}

fn parse_keyvalue(s: &str) -> Result<(String, Value)> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Missing '=' in metadata {s}"))?;
    Ok((k.to_string(), Value::String(v.to_string())))
}

async fn init(opts: InitOpts) -> Result<()> {
    let mode = RepoMode::from_str(&opts.mode)?;
    std::fs::create_dir_all(&opts.repo.repo)
        .with_context(|| format!("Creating {}", opts.repo.repo))?;
    let _ = Repo::create(&opts.repo.repo, mode)?;
    Ok(())
}

async fn commit(opts: CommitOpts) -> Result<()> {
    let checksum = crate::async_util::run_blocking(move || {
        let repo = opts.repo.open()?;
        let mut metadata = BTreeMap::new();
        for kv in &opts.metadata {
            let (k, v) = parse_keyvalue(kv)?;
            let _ = metadata.insert(k, v);
        }
        let parent = opts.branch_parent(&repo)?;
        let options = CommitOptions {
            subject: opts.subject.clone(),
            body: opts.body.clone(),
            metadata,
            parent,
            timestamp: opts.timestamp,
            owner_uid: opts.owner_uid,
            owner_gid: opts.owner_gid,
            record_xattrs: opts.record_xattrs,
        };
        let checksum = commit_filesystem(&repo, &opts.path, &options, None)?;
        repo.set_ref(&opts.branch, Some(&checksum))?;
        Ok(checksum)
    })
    .await?;
    println!("{checksum}");
    Ok(())
}

impl CommitOpts {
    fn branch_parent(&self, repo: &Repo) -> Result<Option<Checksum>> {
        crate::refs::validate_ref(&self.branch)?;
        repo.try_resolve_ref(&self.branch)
    }
}

async fn checkout(opts: CheckoutOpts) -> Result<()> {
    crate::async_util::run_blocking(move || {
        let repo = opts.repo.open()?;
        let rev = repo.resolve_rev(&opts.rev)?;
        let mut options = CheckoutOptions::default();
        if opts.user_mode {
            options.restore_ownership = false;
        }
        repo.checkout_commit(&rev, &opts.target, &options, None)
    })
    .await
}

async fn fsck(opts: FsckOpts) -> Result<()> {
    let json = opts.json;
    let report = crate::async_util::run_blocking(move || {
        let repo = opts.repo.open()?;
        crate::fsck::fsck(&repo, None)
    })
    .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Checked {} objects", report.objects_checked);
        for e in &report.errors {
            eprintln!("error: {e}");
        }
    }
    if !report.is_ok() {
        anyhow::bail!("Found {} errors", report.errors.len());
    }
    Ok(())
}

async fn prune_cmd(opts: PruneOpts) -> Result<()> {
    let json = opts.json;
    let stats = crate::async_util::run_blocking(move || {
        let repo = opts.repo.open()?;
        if let Some(rev) = &opts.delete_commit {
            let checksum = repo.resolve_rev(rev)?;
            repo.delete_commit(&checksum)?;
            let _ = crate::prune::prune_static_deltas(&repo, Some(&checksum), None)?;
        }
        let options = PruneOptions {
            no_prune: opts.no_prune,
            refs_only: opts.refs_only,
            commit_only: false,
            depth: opts.depth,
        };
        prune(&repo, &options, None)
    })
    .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Total objects: {}\nDeleted {} objects, {} bytes freed",
            stats.objects_total, stats.objects_pruned, stats.bytes_freed
        );
    }
    Ok(())
}

async fn refs(opts: RefsOpts) -> Result<()> {
    let repo = opts.repo.open()?;
    if let Some(r) = &opts.delete {
        repo.set_ref(r, None)?;
        return Ok(());
    }
    if let Some(spec) = &opts.create {
        let (name, target) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Missing '=' in {spec}"))?;
        let target = repo.resolve_rev(target)?;
        repo.create_ref(name, &target)?;
        return Ok(());
    }
    for (name, checksum) in repo.list_refs(opts.prefix.as_deref())? {
        println!("{name}\t{checksum}");
    }
    Ok(())
}

async fn log(opts: LogOpts) -> Result<()> {
    let repo = opts.repo.open()?;
    let mut rev = Some(repo.resolve_rev(&opts.rev)?);
    while let Some(checksum) = rev {
        let commit = match repo.load_commit(&checksum) {
            Ok(c) => c,
            Err(e) if crate::is_not_found(&e) => {
                println!("<< History beyond this commit not fetched >>");
                break;
            }
            Err(e) => return Err(e),
        };
        println!("commit {checksum}");
        println!("Date:  {}", format_timestamp(commit.timestamp));
        if !commit.subject.is_empty() {
            println!("\n    {}", commit.subject);
        }
        if !commit.body.is_empty() {
            println!("\n    {}", commit.body);
        }
        println!();
        rev = commit.parent;
    }
    Ok(())
}

async fn show(opts: ShowOpts) -> Result<()> {
    let repo = opts.repo.open()?;
    let checksum = repo.resolve_rev(&opts.rev)?;
    let commit = repo.load_commit(&checksum)?;
    println!("commit {checksum}");
    if let Some(parent) = &commit.parent {
        println!("Parent: {parent}");
    }
    println!("ContentChecksum: {}", commit.content_checksum()?);
    println!("Date:  {}", format_timestamp(commit.timestamp));
    for (k, v) in &commit.metadata {
        println!("Metadata: {k}={v:?}");
    }
    if repo.commit_is_partial(&checksum)? {
        println!("State: partial");
    }
    if let Some(detached) = repo.read_commit_detached_metadata(&checksum)? {
        for k in detached.keys() {
            println!("DetachedMetadata: {k}");
        }
    }
    if !commit.subject.is_empty() {
        println!("\n    {}", commit.subject);
    }
    if !commit.body.is_empty() {
        println!("\n    {}", commit.body);
    }
    Ok(())
}

async fn static_delta(opts: StaticDeltaOpts) -> Result<()> {
    match opts {
        StaticDeltaOpts::Generate(opts) => {
            let superblock = crate::async_util::run_blocking(move || {
                let repo = opts.repo.open()?;
                let from = opts
                    .from
                    .as_deref()
                    .map(|f| repo.resolve_rev(f))
                    .transpose()?;
                let to = repo.resolve_rev(&opts.to)?;
                let mut options = DeltaGenerateOptions {
                    enable_bsdiff: !opts.disable_bsdiff,
                    inline_parts: opts.inline,
                    timestamp: opts.timestamp,
                    verbose: opts.verbose,
                    ..Default::default()
                };
                if opts.disable_compression {
                    options.compression = crate::delta::DeltaCompression::None;
                }
                if let Some(mib) = opts.max_chunk_size {
                    options.max_chunk_size = mib * 1024 * 1024;
                }
                if let Some(keyfile) = &opts.sign_key_file {
                    options.sign_key =
                        Some(std::fs::read(keyfile).context("Reading signing key")?);
                }
                generate_delta(&repo, from.as_ref(), &to, &options, None)
            })
            .await?;
            println!(
                "Generated delta to {} ({} parts, {} fallbacks)",
                superblock.to,
                superblock.parts.len(),
                superblock.fallbacks.len()
            );
            Ok(())
        }
        StaticDeltaOpts::Apply(opts) => {
            let stats = crate::async_util::run_blocking(move || {
                let repo = opts.repo.open()?;
                let mut keys = Vec::new();
                for k in &opts.trusted_keys {
                    keys.push(std::fs::read(k).context("Reading trusted key")?);
                }
                let options = ApplyOptions {
                    stats_only: opts.stats_only,
                    strict: opts.strict,
                    trusted_keys: keys,
                };
                match (&opts.path, &opts.to) {
                    (Some(path), _) => apply_delta_from_path(&repo, path, &options, None),
                    (None, Some(to)) => {
                        let from = opts
                            .from
                            .as_deref()
                            .map(|f| repo.resolve_rev(f))
                            .transpose()?;
                        let to = repo.resolve_rev(to)?;
                        apply_delta(&repo, from.as_ref(), &to, &options, None)
                    }
                    (None, None) => {
                        anyhow::bail!("Either a delta path or --to is required")
                    }
                }
            })
            .await?;
            println!(
                "Applied {}/{} parts, {} objects, {} bytes",
                stats.parts_applied,
                stats.parts_total,
                stats.objects_written,
                stats.bytes_written
            );
            if !stats.parts_failed.is_empty() {
                anyhow::bail!("{} parts failed", stats.parts_failed.len());
            }
            Ok(())
        }
        StaticDeltaOpts::Show(opts) => {
            let repo = opts.repo.open()?;
            let from = opts
                .from
                .as_deref()
                .map(|f| repo.resolve_rev(f))
                .transpose()?;
            let to = repo.resolve_rev(&opts.to)?;
            let superblock = load_superblock(&repo, from.as_ref(), &to)?;
            println!("Generated: {}", format_timestamp(superblock.timestamp));
            match &superblock.from {
                Some(f) => println!("From: {f}"),
                None => println!("From: <scratch>"),
            }
            println!("To: {}", superblock.to);
            println!("Endianness: {:?}", superblock.endianness);
            for (i, part) in superblock.parts.iter().enumerate() {
                println!(
                    "Part {i}: {} objects, {} compressed, {} uncompressed",
                    part.objects.len(),
                    part.compressed_size,
                    part.uncompressed_size
                );
            }
            for fb in &superblock.fallbacks {
                println!("Fallback: {}.{} ({} bytes)", fb.checksum, fb.objtype, fb.uncompressed_size);
            }
            Ok(())
        }
        StaticDeltaOpts::List { repo } => {
            let repo = repo.open()?;
            for (from, to) in list_deltas(&repo)? {
                match from {
                    Some(f) => println!("{f}-{to}"),
                    None => println!("{to}"),
                }
            }
            Ok(())
        }
    }
}

async fn pull(opts: PullOpts) -> Result<()> {
    let pulled = crate::async_util::run_blocking(move || {
        let repo = opts.repo.open()?;
        // A configured remote name resolves through its url; anything
        // else is taken as a filesystem path.
        let (src, remote) = match repo.get_remote(&opts.src) {
            Ok(remote) => {
                let url = remote
                    .url
                    .strip_prefix("file://")
                    .unwrap_or(&remote.url)
                    .to_string();
                (Utf8PathBuf::from(url), Some(remote.name))
            }
            Err(_) => (Utf8PathBuf::from(&opts.src), None),
        };
        let options = PullOptions {
            depth: opts.depth,
            remote,
        };
        pull_local(&repo, &src, &opts.refs, &options, None)
    })
    .await?;
    for checksum in pulled {
        println!("{checksum}");
    }
    Ok(())
}

async fn remote(opts: RemoteOpts) -> Result<()> {
    match opts {
        RemoteOpts::Add {
            repo,
            name,
            url,
            no_gpg_verify,
        } => repo.open()?.add_remote(&name, &url, !no_gpg_verify),
        RemoteOpts::Remove { repo, name } => repo.open()?.remove_remote(&name),
        RemoteOpts::List { repo } => {
            for remote in repo.open()?.list_remotes()? {
                println!("{}\t{}", remote.name, remote.url);
            }
            Ok(())
        }
    }
}

/// Parse the provided arguments and execute.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    match opt {
        Opt::Init(opts) => init(opts).await,
        Opt::Commit(opts) => commit(opts).await,
        Opt::Checkout(opts) => checkout(opts).await,
        Opt::Fsck(opts) => fsck(opts).await,
        Opt::Prune(opts) => prune_cmd(opts).await,
        Opt::Refs(opts) => refs(opts).await,
        Opt::Log(opts) => log(opts).await,
        Opt::Show(opts) => show(opts).await,
        Opt::StaticDelta(opts) => static_delta(opts).await,
        Opt::Pull(opts) => pull(opts).await,
        Opt::Remote(opts) => remote(opts).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let opt = Opt::parse_from([
            "treestore", "commit", "--repo", "/r", "-b", "main", "-s", "hi", "/tree",
        ]);
        match opt {
            Opt::Commit(c) => {
                assert_eq!(c.branch, "main");
                assert_eq!(c.path, Utf8PathBuf::from("/tree"));
            }
            o => panic!("unexpected {o:?}"),
        }
        let opt = Opt::parse_from([
            "treestore",
            "static-delta",
            "generate",
            "--repo",
            "/r",
            "--to",
            "main",
        ]);
        assert!(matches!(
            opt,
            Opt::StaticDelta(StaticDeltaOpts::Generate(_))
        ));
        let opt = Opt::parse_from(["treestore", "remote", "add", "--repo", "/r", "origin", "file:///src"]);
        assert!(matches!(opt, Opt::Remote(RemoteOpts::Add { .. })));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            exit_code_for_error(&crate::Error::not_found("x")),
            EXIT_NOT_FOUND
        );
        assert_eq!(exit_code_for_error(&anyhow::anyhow!("other")), 1);
    }
}
