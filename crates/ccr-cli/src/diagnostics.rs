//! Error banners printed when a command fails.

use ccr_universe::UniverseError;
use colored::Colorize;
use std::fmt::Write;

/// Print `err` to stderr, with the graph context of a universe error when
/// there is one.
pub fn report(err: &anyhow::Error) {
    let universe = err
        .chain()
        .find_map(|e| e.downcast_ref::<UniverseError>());
    match universe {
        Some(u) => {
            let outer: Vec<String> = err
                .chain()
                .take_while(|e| e.downcast_ref::<UniverseError>().is_none())
                .map(ToString::to_string)
                .collect();
            eprint!("{}", render(u, &outer));
        }
        None => eprintln!("{} {:#}", "Error:".red().bold(), err),
    }
}

/// The banner for a universe error. `outer` holds messages of context that
/// was added on top of it by the command.
pub fn render(err: &UniverseError, outer: &[String]) -> String {
    let mut out = String::new();
    let ctx = err.context();

    let _ = write!(out, "{} ({}) ", "Error:".red().bold(), err.category());
    if let Some(target) = ctx.and_then(|c| c.target.as_deref()) {
        let _ = write!(out, "{}: ", target.yellow().bold());
    }
    let _ = writeln!(out, "{}", err);

    for msg in outer {
        let _ = writeln!(out, "  While:               {}", msg);
    }

    let constraint = err.failing_constraint();
    if let Some(c) = constraint {
        let _ = writeln!(
            out,
            "  Failing constraint:  {}  {}  {}",
            c.left.yellow().bold(),
            c.op,
            c.right.yellow().bold()
        );
    }

    let Some(ctx) = ctx else {
        return out;
    };

    if let Some(cv) = &ctx.computed_value {
        let _ = writeln!(out, "  Originating from:    {}", cv.yellow().bold());
    }
    if let Some(path) = &ctx.path {
        let _ = writeln!(
            out,
            "  Affected path at:    {}",
            path.display().to_string().yellow().bold()
        );
    }
    if let Some(pos) = &ctx.pos {
        let verb = if constraint.is_some() { "Constrained" } else { "Failing" };
        let _ = writeln!(
            out,
            "  {} target at:  {}",
            verb,
            pos.to_string().yellow().bold()
        );
    }
    if let Some(action) = &ctx.action_target {
        let verb = if constraint.is_some() {
            "Constraint set on"
        } else {
            "Failed by"
        };
        let _ = writeln!(out, "  {}:\n    {}", verb, action.magenta().bold());
    }

    if !ctx.chain.is_empty() {
        out.push('\n');
        for parent in &ctx.chain {
            let _ = writeln!(out, "  Parent target {}", parent.yellow().bold());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccr_universe::error::FailingConstraint;
    use pretty_assertions::assert_eq;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_banner_for_bare_error() {
        plain();
        let err = UniverseError::NotExists("//p:gone".into());
        assert_eq!(
            render(&err, &[]),
            "Error: (not-found) target \"//p:gone\" does not exist\n"
        );
    }

    #[test]
    fn test_banner_lists_context() {
        plain();
        let err = UniverseError::check_failed("/etc/motd is not a file (found missing)")
            .with_path("/srv/root/etc/motd")
            .with_action_target("common://checks:file_present")
            .with_target("//base:motd")
            .with_target("//base:system");

        assert_eq!(
            render(&err, &["Check failed".to_string()]),
            "Error: (checker-failure) //base:motd: /etc/motd is not a file (found missing)\n\
             \x20 While:               Check failed\n\
             \x20 Affected path at:    /srv/root/etc/motd\n\
             \x20 Failed by:\n\
             \x20   common://checks:file_present\n\
             \n\
             \x20 Parent target //base:system\n"
        );
    }

    #[test]
    fn test_banner_for_constraint() {
        plain();
        let err = UniverseError::CheckFailed {
            message: "constraint not satisfied".into(),
            constraint: Some(FailingConstraint {
                left: "1.2.0".into(),
                op: ">=".into(),
                right: "2.0.0".into(),
            }),
        }
        .with_action_target("//app:server")
        .with_target("//lib:ssl");

        let banner = render(&err, &[]);
        assert!(banner.contains("Failing constraint:  1.2.0  >=  2.0.0"));
        assert!(banner.contains("Constraint set on:\n    //app:server"));
    }
}
