//! nozem: a hermetic, content-addressed build tool for JS/TS monorepos.

mod build;
mod cache;
mod config;
mod env;
mod error;
mod fileset;
mod graph;
mod hoist;
mod ignore_matcher;
mod lerna;
mod merkle;
mod sandbox;
mod scheduler;
mod unit;
mod workspace;

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use cache::inplace::InPlaceCache;
use cache::local::LocalCache;
use cache::remote::RemoteCache;
use cache::CacheChain;
use error::NozemError;
use graph::Graph;
use scheduler::RunReport;
use workspace::RunOptions;

/// Minimum log level currently printed; raised by repeated `-v`. Set once
/// at startup, read from anywhere without threading a context object
/// through every call (§9 "Global state").
static VERBOSITY: AtomicU8 = AtomicU8::new(0);

fn set_verbosity(level: u8) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

#[derive(Parser)]
#[command(name = "nozem", version, about = "Hermetic, content-addressed build tool for JS/TS monorepos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the monorepo root for a Lerna-style manifest and emit nozem.json.
    FromLerna,
    /// Build one or more targets.
    Build(BuildArgs),
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Unit identifiers or directories to build. Defaults to the current
    /// directory's units, or the whole graph when run at the monorepo root.
    targets: Vec<String>,

    #[arg(short = 'c', long, default_value_t = scheduler::default_concurrency())]
    concurrency: usize,

    #[arg(short = 'b', long, action = clap::ArgAction::SetTrue)]
    bail: bool,

    #[arg(long = "no-bail", action = clap::ArgAction::SetTrue)]
    no_bail: bool,

    /// Include downstream-reachable nodes of the selected targets.
    #[arg(short = 'd', long)]
    down: bool,

    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long = "cache-dir")]
    cache_dir: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &anyhow::Error) {
    if let Some(nozem_err) = err.downcast_ref::<NozemError>() {
        if nozem_err.is_simple() {
            eprintln!("{} {}", "error:".red().bold(), nozem_err);
            return;
        }
    }
    eprintln!("{} {:#}", "error:".red().bold(), err);
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    match cli.command {
        Commands::FromLerna => run_from_lerna(&cwd),
        Commands::Build(args) => {
            let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
            runtime.block_on(run_build(&cwd, args))
        }
    }
}

fn run_from_lerna(root: &Path) -> Result<()> {
    let unit_file = lerna::import(root)?;
    let json = serde_json::to_string_pretty(&unit_file).context("serializing nozem.json")?;
    let path = root.join(config::UNIT_FILE_NAME);
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    eprintln!(
        "{} {} ({} units)",
        "wrote".green().bold(),
        path.display(),
        unit_file.units.len()
    );
    Ok(())
}

async fn run_build(cwd: &Path, args: BuildArgs) -> Result<()> {
    set_verbosity(args.verbose);

    let (unit_file, monorepo_root) = config::load_unit_file(cwd)?;
    let cache_config = config::load_cache_config(&monorepo_root)?;
    let cache_dir = config::resolve_cache_dir(&cache_config, args.cache_dir.as_deref())?;

    let graph = Graph::load(&unit_file).map_err(|err| NozemError::Graph(err.to_string()))?;
    let targets = resolve_default_targets(&args.targets, cwd, &monorepo_root, &graph);

    let remote_mirror_dir = cache_dir.join("remote-mirror");
    let local = Some(LocalCache::new(cache_dir, cache::local::DEFAULT_MAX_SIZE_MB));
    let remote = cache_config
        .cache_bucket
        .map(|bucket| RemoteCache::new(bucket.into(), remote_mirror_dir));
    if let Some(remote) = &remote {
        remote.spawn_startup_mirror_scan();
    }
    let cache = CacheChain {
        inplace: InPlaceCache::new(),
        local,
        remote,
    };

    let options = RunOptions {
        concurrency: args.concurrency,
        bail: !args.no_bail,
        downstream: args.down,
    };

    let report = workspace::run_build(monorepo_root, unit_file, graph, &targets, options, cache).await?;
    print_report(&report);

    if report.is_success() {
        Ok(())
    } else {
        Err(NozemError::Build(format!("{} unit(s) failed", report.failed.len())).into())
    }
}

/// Resolves an empty `TARGET` list per §4.7: build the whole graph when run
/// at the monorepo root, otherwise build whatever units live under the
/// current directory (falling back to the whole graph if none do).
fn resolve_default_targets(targets: &[String], cwd: &Path, monorepo_root: &Path, graph: &Graph) -> Vec<String> {
    if !targets.is_empty() {
        return targets.to_vec();
    }
    if cwd == monorepo_root {
        return Vec::new();
    }
    let relative = cwd.strip_prefix(monorepo_root).unwrap_or_else(|_| Path::new(""));
    let relative_str = relative.to_string_lossy().replace('\\', "/");
    if graph.select_by_directory(&relative_str).is_empty() {
        Vec::new()
    } else {
        vec![relative_str]
    }
}

fn print_report(report: &RunReport) {
    eprintln!(
        "{} {} succeeded, {} failed, {} pruned",
        "summary:".bold(),
        report.succeeded.len(),
        report.failed.len(),
        report.pruned
    );
    if !report.stuck.is_empty() {
        eprintln!("{}", "stuck nodes:".yellow().bold());
        for (id, missing) in &report.stuck {
            eprintln!("  {} waiting on [{}]", id, missing.join(", "));
        }
    }
    if verbosity() > 0 {
        for id in &report.succeeded {
            eprintln!("  {} {}", "ok".green(), id);
        }
    }
}
