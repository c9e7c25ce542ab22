//! Generate command - materialize a target into the base directory

use anyhow::Result;
use ccr_universe::TargetRef;
use colored::Colorize;
use std::time::Instant;

use crate::session::Session;

pub fn run(session: &Session, target: &str) -> Result<()> {
    let start = Instant::now();
    let (mut universe, _) = session.universe(&[target.to_string()])?;
    let ctx = session.generation_context()?;

    universe.generate(&ctx, &TargetRef::path(target), &session.base_dir)?;

    if session.verbose {
        println!(
            "{} {} into {} in {:.2}s",
            "Generated".green().bold(),
            target,
            session.base_dir.display(),
            start.elapsed().as_secs_f64()
        );
    }
    Ok(())
}
