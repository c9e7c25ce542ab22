//! Plan command - phase the builds under a target and run them in parallel

use anyhow::{Context, Result};
use ccr_universe::{Cache, NodeId, PhaseExecutor, RunnerEnv, TargetRef, TargetType, Universe};
use colored::Colorize;
use std::time::Instant;

use crate::session::Session;

pub struct PlanArgs {
    pub target: String,
    /// Print the plan and stop
    pub plan_only: bool,
    /// Overrides the configured worker count
    pub workers: Option<usize>,
}

pub fn run(session: &Session, args: PlanArgs) -> Result<()> {
    let (universe, _) = session.universe(&[args.target.clone()])?;
    let phases = universe.plan(&TargetRef::path(&args.target), TargetType::Build)?;
    let ctx = session.generation_context()?;
    let env = RunnerEnv::new(&session.base_dir);

    print_plan(&universe, &phases, &ctx.cache, &env)?;
    if args.plan_only {
        return Ok(());
    }

    let workers = args.workers.unwrap_or(session.workers);
    let executor = PhaseExecutor::new(workers)?;
    let start = Instant::now();
    for (index, phase) in phases.iter().enumerate() {
        println!(
            "{}",
            format!("Commencing phase {}", index + 1).red().bold()
        );
        executor
            .run(std::slice::from_ref(phase), |_, id| {
                universe.generate_build(&ctx, *id, &env).map(|_| ())
            })
            .with_context(|| format!("Phase {} failed", index + 1))?;
    }

    if session.verbose {
        println!(
            "{} {} phase(s) with {} worker(s) in {:.2}s",
            "Finished".green().bold(),
            phases.len(),
            workers,
            start.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

/// One block per phase, one line per build: cache mark, rollup key, label.
fn print_plan(
    universe: &Universe,
    phases: &[Vec<NodeId>],
    cache: &Cache,
    env: &RunnerEnv,
) -> Result<()> {
    for (index, phase) in phases.iter().enumerate() {
        println!(
            "{} ({} builds):",
            format!("Phase {:03}", index + 1).blue().bold(),
            phase.len()
        );
        for id in phase {
            let hash = universe.rollup_hash(*id, env)?;
            let mark = if cache.is_hash_cached(&hash) {
                "✓".green().bold()
            } else {
                "✖".red().bold()
            };
            println!(
                "  {} [{}] {}",
                mark,
                Cache::hash_string(&hash),
                universe.label(*id).yellow().bold()
            );
        }
        println!();
    }
    Ok(())
}
