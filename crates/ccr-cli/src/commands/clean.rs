//! Clean-cache command

use anyhow::Result;

use crate::session::Session;

pub fn run(session: &Session) -> Result<()> {
    let cache = session.open_cache()?;
    let removed = cache.clean(session.cache_max_age)?;
    println!(
        "Removed {} cache entr{} older than {}h from {}",
        removed,
        if removed == 1 { "y" } else { "ies" },
        session.cache_max_age.as_secs() / 3600,
        cache.dir().display()
    );
    Ok(())
}
