//! FUNCTIONAL_TEST phase
//!
//! Runs the configured commands in the merged sandbox. A command that cannot
//! be run counts as a failure, except when the sandbox reports a cancel.
//! Failures are traced to the components owning the files named in the
//! output, or to every component when none is named.

use crate::component::Component;
use crate::error::ForgeResult;
use crate::gate::mentioned_paths;
use crate::ports::WorkspaceSandbox;
use crate::types::ComponentId;
use forge_artifact::{Snapshot, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

const OUTPUT_TAIL_LINES: usize = 20;

/// One command run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRun {
    /// Command line
    pub command: String,
    /// Exit code; `None` when the command could not run
    pub exit_code: Option<i32>,
    /// Tail of stdout and stderr, or the sandbox error
    pub output: String,
}

impl CommandRun {
    /// Exited zero
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of the phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalReport {
    /// Every command, in configured order
    pub runs: Vec<CommandRun>,
    /// Files named by failing output
    pub paths: BTreeSet<WorkspacePath>,
    /// Components to rebuild
    pub affected: BTreeSet<ComponentId>,
}

impl FunctionalReport {
    /// Every command passed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.runs.iter().all(CommandRun::passed)
    }

    /// Failing runs
    pub fn failures(&self) -> impl Iterator<Item = &CommandRun> {
        self.runs.iter().filter(|r| !r.passed())
    }
}

/// Configured functional test commands
#[derive(Debug, Clone, Default)]
pub struct FunctionalTests {
    commands: Vec<String>,
}

impl FunctionalTests {
    /// Suite of `commands`
    #[must_use]
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// Run every command, even after a failure
    ///
    /// # Errors
    /// [`crate::ForgeError::AbortRequested`] when the sandbox was cancelled;
    /// every other sandbox error is recorded as a failed run
    pub async fn run(
        &self,
        sandbox: &Arc<dyn WorkspaceSandbox>,
        snapshot: &Snapshot,
        components: &[Component],
    ) -> ForgeResult<FunctionalReport> {
        let mut report = FunctionalReport::default();
        for command in &self.commands {
            let run = match sandbox.exec(command).await {
                Ok(out) => CommandRun {
                    command: command.clone(),
                    exit_code: Some(out.exit_code),
                    output: tail(&format!("{}\n{}", out.stdout, out.stderr)),
                },
                Err(err) if err.is_abort() => return Err(err),
                Err(err) => CommandRun {
                    command: command.clone(),
                    exit_code: None,
                    output: err.to_string(),
                },
            };
            if run.passed() {
                tracing::debug!(%command, "functional test passed");
            } else {
                tracing::warn!(%command, exit_code = ?run.exit_code, "functional test failed");
                report.paths.extend(mentioned_paths(snapshot, &run.output));
            }
            report.runs.push(run);
        }

        if !report.passed() {
            report.affected = components
                .iter()
                .filter(|c| report.paths.iter().any(|p| c.owned_files.contains(p)))
                .map(|c| c.id)
                .collect();
            if report.affected.is_empty() {
                report.affected = components.iter().map(|c| c.id).collect();
            }
        }
        Ok(report)
    }
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}
