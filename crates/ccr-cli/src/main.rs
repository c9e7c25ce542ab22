use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod diagnostics;
mod session;

use session::{Overrides, Session};

/// Core contracts resolver.
///
/// Reads target definitions from a contracts tree, checks a base directory
/// against them, generates artifacts into it and plans builds.
///
/// EXAMPLES:
///     ccr check //base:system              Check the base directory
///     ccr generate //base:system           Generate everything into the base directory
///     ccr plan //base:system --plan-only   Print the build phases
///     ccr query //base:motd%path           Print an attribute
///     ccr fmt --check                      Verify definition formatting
///
/// ENVIRONMENT VARIABLES:
///     CCR_CONTRACTS_DIR  Contracts tree (default: project root or working directory)
///     CCR_BASE_DIR       Base directory (default: working directory)
///     CCR_CACHE_DIR      Build cache directory
///     CCR_WORKERS        Parallel build workers
///     RUST_LOG           Log filter (default: warn)
#[derive(Parser)]
#[command(name = "ccr")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Read contracts from this directory
    #[arg(long, global = true)]
    contracts_dir: Option<PathBuf>,

    /// Use this directory as the base directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Store build outputs in this cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Verbose output and debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite definition files in canonical form
    ///
    /// With no paths, every definition file under the contracts directory
    /// is formatted.
    Fmt {
        /// Files or directories to format
        paths: Vec<PathBuf>,
        /// Report files that would change and exit non-zero instead of writing
        #[arg(long)]
        check: bool,
    },

    /// Check the base directory against one or more targets
    Check {
        /// Targets to check (e.g. //base:system)
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Generate a target into the base directory
    Generate {
        /// Target to generate
        target: String,
    },

    /// Plan the builds a target needs and run them phase by phase
    ///
    /// Builds inside one phase do not depend on each other and run in
    /// parallel. Cached builds are marked with a check.
    Plan {
        /// Target whose builds are planned
        target: String,
        /// Print the plan and exit
        #[arg(long)]
        plan_only: bool,
        /// Parallel build workers per phase
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print an attribute of a target by name or class name
    ///
    /// EXAMPLES:
    ///     ccr query //base:motd%path
    Query {
        /// <target>%<attribute>
        target_attr: String,
    },

    /// Print an attribute of a target by attribute class path
    ///
    /// EXAMPLES:
    ///     ccr query-by-class //base:motd%common://attrs:path
    QueryByClass {
        /// <target>%<class>
        target_attr: String,
    },

    /// Print the rollup hash of a target
    Hash {
        /// Target to fingerprint
        target: String,
    },

    /// Remove cache entries older than the configured horizon
    CleanCache,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        diagnostics::report(&err);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let session = Session::load(Overrides {
        contracts_dir: cli.contracts_dir,
        base_dir: cli.base_dir,
        cache_dir: cli.cache_dir,
        verbose: cli.verbose,
    })?;

    match cli.command {
        Commands::Fmt { paths, check } => commands::fmt::run(&session, &paths, check),
        Commands::Check { targets } => commands::check::run(&session, &targets),
        Commands::Generate { target } => commands::generate::run(&session, &target),
        Commands::Plan {
            target,
            plan_only,
            workers,
        } => commands::plan::run(
            &session,
            commands::plan::PlanArgs {
                target,
                plan_only,
                workers,
            },
        ),
        Commands::Query { target_attr } => {
            commands::query::run(&session, &target_attr, commands::query::QueryBy::Name)
        }
        Commands::QueryByClass { target_attr } => {
            commands::query::run(&session, &target_attr, commands::query::QueryBy::Class)
        }
        Commands::Hash { target } => commands::hash::run(&session, &target),
        Commands::CleanCache => commands::clean::run(&session),
    }
}
