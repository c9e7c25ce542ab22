//! Query commands - print one attribute of a target

use anyhow::{anyhow, bail, Result};
use ccr_universe::RunnerEnv;

use crate::session::Session;

/// How the attribute after `%` is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryBy {
    /// Attribute name or attribute class name
    Name,
    /// Attribute class path
    Class,
}

pub fn run(session: &Session, target_attr: &str, by: QueryBy) -> Result<()> {
    let (target, attr) = split_query(target_attr)?;
    let (universe, _) = session.universe(&[target.to_string()])?;
    let env = RunnerEnv::new(&session.base_dir);

    let value = match by {
        QueryBy::Name => universe.query_by_name(target, attr, &env)?,
        QueryBy::Class => universe.query_by_class(target, attr, &env)?,
    };
    let value = value.ok_or_else(|| anyhow!("{} has no attribute {:?}", target, attr))?;
    println!("{}", value);
    Ok(())
}

/// Split `<target>%<attr>`. The target must be an absolute package path.
pub fn split_query(target_attr: &str) -> Result<(&str, &str)> {
    if !target_attr.starts_with("//") {
        bail!("{:?}: must provide absolute path", target_attr);
    }
    match target_attr.split_once('%') {
        Some((_, "")) | None => bail!("no attribute specified"),
        Some(parts) => Ok(parts),
    }
}
