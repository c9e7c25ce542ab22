//! Check command - verify the base directory against targets

use anyhow::Result;
use colored::Colorize;

use crate::session::Session;

pub fn run(session: &Session, targets: &[String]) -> Result<()> {
    let (universe, roots) = session.universe(targets)?;
    universe.check(&roots, &session.base_dir)?;

    if session.verbose {
        println!(
            "{} {} target(s) against {}",
            "Checked".green().bold(),
            roots.len(),
            session.base_dir.display()
        );
    }
    Ok(())
}
