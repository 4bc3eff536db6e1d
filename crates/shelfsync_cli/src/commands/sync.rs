//! Sync, push and pull commands.

use crate::error::CliResult;
use crate::prompt::PromptPolicy;
use crate::workspace::Workspace;
use crate::PolicyArg;
use chrono::{DateTime, Utc};
use shelfsync_engine::SyncResult;
use shelfsync_model::{ConflictPolicy, ResolutionPolicy};
use std::process::ExitCode;

/// Which part of a run to perform.
#[derive(Debug, Clone, Copy)]
pub enum Mode {
    /// Push, then pull.
    Sync,
    /// Push only.
    Push,
    /// Pull only, optionally from a fixed point in time.
    Pull {
        /// Overrides the stored cursors.
        since: Option<DateTime<Utc>>,
    },
}

/// Runs a sync, push or pull and prints its summary.
///
/// Returns exit status 2 if the run finished with item errors.
pub fn run(ws: &Workspace, mode: Mode, policy: PolicyArg) -> CliResult<ExitCode> {
    let processor = ws.processor()?;
    let policy = make_policy(policy);

    let result = match mode {
        Mode::Sync => processor.sync(&*policy)?,
        Mode::Push => processor.push_pending(&*policy)?,
        Mode::Pull { since } => processor.pull_changes(since, &*policy)?,
    };

    print_summary(&result);
    Ok(exit_code(&result))
}

fn make_policy(policy: PolicyArg) -> Box<dyn ResolutionPolicy> {
    match policy {
        PolicyArg::Prompt => Box::new(PromptPolicy::terminal()),
        PolicyArg::RemoteWins => Box::new(ConflictPolicy::RemoteWins),
        PolicyArg::LocalWins => Box::new(ConflictPolicy::LocalWins),
        PolicyArg::NewestWins => Box::new(ConflictPolicy::NewestWins),
        PolicyArg::Skip => Box::new(ConflictPolicy::Skip),
    }
}

fn print_summary(result: &SyncResult) {
    println!("Pushed:    {}", result.pushed);
    println!("Pulled:    {}", result.pulled);
    println!("Conflicts: {}", result.conflicts);
    if result.skipped > 0 {
        println!("Skipped:   {}", result.skipped);
    }
    if !result.errors.is_empty() {
        println!();
        println!("Errors ({}):", result.errors.len());
        for (label, message) in &result.errors {
            println!("  {label}: {message}");
        }
    }
}

fn exit_code(result: &SyncResult) -> ExitCode {
    if result.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_errors_exit_with_two() {
        let mut result = SyncResult::default();
        assert_eq!(exit_code(&result), ExitCode::SUCCESS);

        result.errors.push(("Dune".into(), "remote error: HTTP 400".into()));
        assert_eq!(exit_code(&result), ExitCode::from(2));
    }
}
