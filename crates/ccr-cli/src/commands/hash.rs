//! Hash command - print the rollup hash of a target

use anyhow::Result;
use ccr_universe::{Cache, RunnerEnv};

use crate::session::Session;

pub fn run(session: &Session, target: &str) -> Result<()> {
    let (universe, _) = session.universe(&[target.to_string()])?;
    let hash = universe.target_rollup_hash(target, &RunnerEnv::new(&session.base_dir))?;
    println!("{}", Cache::hash_string(&hash));
    Ok(())
}
