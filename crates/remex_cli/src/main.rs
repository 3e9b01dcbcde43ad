//! remex CLI
//!
//! Digests inputs, computes action keys and runs spawns through the
//! dispatcher against a disk-backed cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use remex_core::{DigestFunction, DigestUtil};
use remex_exec::{
    parse_platform, prepare_action, PreparedAction, ProcessSpawnRunner, RemoteOptions, RemoteSpawnRunner,
    SimpleSpawnContext, Spawn, SpawnError, SpawnExecutionContext, SpawnRunner, SpawnSpec,
};
use remex_remote::{DiskCas, RemoteActionCache};
use remex_storage::{FsMetadataProvider, MerkleTree};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "remex=info";

#[derive(Parser)]
#[command(name = "remex")]
#[command(about = "remex - remote execution dispatch with a content-addressed cache", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the digest of a file, or the Merkle root of a directory
    Digest {
        /// File or directory
        path: PathBuf,
        /// Digest function
        #[arg(long, default_value = "sha256", value_parser = DigestFunction::parse)]
        digest_function: DigestFunction,
    },
    /// Print the command digest, input root and action key of a spawn
    ActionKey {
        /// Spawn description (JSON)
        #[arg(short, long)]
        spawn: PathBuf,
        /// Directory the spawn's paths are relative to
        #[arg(long, default_value = ".")]
        exec_root: PathBuf,
        /// Options file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a spawn through the remote cache with local execution
    Run {
        /// Spawn description (JSON)
        #[arg(short, long)]
        spawn: PathBuf,
        /// Cache directory
        #[arg(long)]
        cache_dir: PathBuf,
        /// Directory the spawn runs in
        #[arg(long, default_value = ".")]
        exec_root: PathBuf,
        /// Options file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Ignore cached results
        #[arg(long)]
        no_accept_cached: bool,
        /// Do not upload local results
        #[arg(long)]
        no_upload: bool,
        /// Report failures with their full cause chain
        #[arg(long)]
        verbose_failures: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Digest { path, digest_function } => {
            let util = DigestUtil::new(digest_function);
            let digest = if path.is_dir() {
                MerkleTree::build_from_dir(&path, &util)?.root_digest().clone()
            } else {
                util.compute_file(&path)
                    .wrap_err_with(|| format!("reading {}", path.display()))?
            };
            println!("{digest}");
            Ok(())
        }
        Commands::ActionKey {
            spawn,
            exec_root,
            config,
        } => {
            let options = load_options(config.as_deref())?;
            let spawn = load_spawn(&spawn)?;
            let prepared = prepare(&spawn, &exec_root, &options)?;
            println!("command:    {}", prepared.command_digest);
            println!("input root: {}", prepared.tree.root_digest());
            println!("action key: {}", prepared.key.digest());
            Ok(())
        }
        Commands::Run {
            spawn,
            cache_dir,
            exec_root,
            config,
            no_accept_cached,
            no_upload,
            verbose_failures,
        } => {
            let mut options = load_options(config.as_deref())?;
            if no_accept_cached {
                options = options.with_accept_cached(false);
            }
            if no_upload {
                options = options.with_upload_local_results(false);
            }
            if verbose_failures {
                options = options.with_verbose_failures(true);
            }
            let spawn = load_spawn(&spawn)?;
            let code = run(&spawn, &cache_dir, &exec_root, options).await?;
            std::process::exit(code);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_options(path: Option<&Path>) -> Result<RemoteOptions> {
    let Some(path) = path else {
        return Ok(RemoteOptions::default());
    };
    let json = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    RemoteOptions::from_json(&json).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn load_spawn(path: &Path) -> Result<Spawn> {
    let json = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    let spec = SpawnSpec::from_json(&json).wrap_err_with(|| format!("parsing {}", path.display()))?;
    Ok(spec.into_spawn())
}

fn prepare(spawn: &Spawn, exec_root: &Path, options: &RemoteOptions) -> Result<PreparedAction> {
    let util = DigestUtil::new(options.digest_function);
    let ctx = SimpleSpawnContext::for_spawn(spawn, Arc::new(FsMetadataProvider::new(exec_root, util)));
    let tree = MerkleTree::build(&ctx.input_mapping()?, ctx.metadata_provider(), &util)?;
    let platform = parse_platform(spawn.execution_platform(), &options.default_platform_properties)?;
    Ok(prepare_action(spawn, tree, platform, spawn.timeout(), &util)?)
}

async fn run(spawn: &Spawn, cache_dir: &Path, exec_root: &Path, options: RemoteOptions) -> Result<i32> {
    let util = DigestUtil::new(options.digest_function);
    let transport = DiskCas::open(cache_dir).wrap_err_with(|| format!("opening cache {}", cache_dir.display()))?;
    let cache = Arc::new(RemoteActionCache::new(Arc::new(transport), util));
    let runner = RemoteSpawnRunner::new(exec_root, options, cache)
        .with_fallback(Arc::new(ProcessSpawnRunner::new(exec_root)));

    let token = CancellationToken::new();
    let ctx = SimpleSpawnContext::for_spawn(spawn, Arc::new(FsMetadataProvider::new(exec_root, util)))
        .with_cancellation(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });

    let outcome = runner.exec(spawn, &ctx).await;
    print!("{}", ctx.file_out_err().stdout_string());
    eprint!("{}", ctx.file_out_err().stderr_string());
    debug!(progress = ?ctx.progress(), "spawn finished");

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.exit_code)
        }
        Err(SpawnError::Exec(err)) => {
            eprintln!("ERROR: {}", err.message);
            println!("{}", serde_json::to_string_pretty(&err.result)?);
            Ok(err.result.exit_code)
        }
        Err(err) => Err(err.into()),
    }
}
