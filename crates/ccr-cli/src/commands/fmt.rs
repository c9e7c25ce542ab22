//! Definition file formatter command

use anyhow::{bail, Context, Result};
use ccr_universe::resolver::DefinitionFile;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::session::Session;

/// Project configuration lives next to definitions but is not one.
const PROJECT_FILE: &str = "ccr.toml";

/// Run the fmt command
pub fn run(session: &Session, paths: &[PathBuf], check: bool) -> Result<()> {
    let roots = if paths.is_empty() {
        vec![session.contracts_dir.clone()]
    } else {
        paths.to_vec()
    };
    let files = collect_files(&roots)?;

    if files.is_empty() {
        eprintln!("No definition files found");
        return Ok(());
    }
    if session.verbose {
        eprintln!("Processing {} file(s)...", files.len());
    }

    let mut unformatted = 0;
    for file in &files {
        let source = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let formatted = format_source(&source, file)?;
        if formatted == source {
            continue;
        }

        if check {
            eprintln!("Would reformat: {}", file.display());
            unformatted += 1;
        } else {
            std::fs::write(file, &formatted)
                .with_context(|| format!("Failed to write {}", file.display()))?;
            eprintln!("Formatted: {}", file.display());
        }
    }

    if unformatted > 0 {
        bail!("{} file(s) would be reformatted", unformatted);
    }
    Ok(())
}

/// Canonical text of one definition file.
pub fn format_source(source: &str, file: &Path) -> Result<String> {
    let defs = DefinitionFile::parse(source, file)?;
    Ok(defs.to_canonical_string()?)
}

/// Definition files named by `roots`: files as given, directories walked.
fn collect_files(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        if !root.exists() {
            bail!("Path not found: {}", root.display());
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().map_or(false, |ext| ext == "toml")
                && path.file_name().map_or(true, |name| name != PROJECT_FILE)
            {
                files.push(path.to_path_buf());
            }
        }
    }
    Ok(files)
}
