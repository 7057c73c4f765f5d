use super::{is_c_like, scan_delimiters};
use crate::error::{ForgeError, ForgeResult};
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;

/// Structural validity of every file, plus an optional build/test command
///
/// Empty files, invalid JSON and unbalanced delimiters are blocking. When a
/// command is configured and a sandbox is available, a non-zero exit is
/// blocking too; a sandbox error propagates and becomes a crash.
#[derive(Debug, Clone, Default)]
pub struct CorrectnessChecker {
    command: Option<String>,
}

impl CorrectnessChecker {
    /// Checker with an optional command
    #[must_use]
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Checker for CorrectnessChecker {
    fn name(&self) -> &str {
        "correctness"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Blocking
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let mut findings = Vec::new();

        for (path, text) in ctx.text_files() {
            if text.trim().is_empty() {
                findings.push(
                    Finding::blocking(Severity::High, "file is empty")
                        .at(&path)
                        .with_tag("empty-file"),
                );
                continue;
            }
            if path.extension() == Some("json") {
                if let Err(err) = serde_json::from_str::<serde_json::Value>(&text) {
                    findings.push(
                        Finding::blocking(Severity::High, format!("invalid JSON: {err}"))
                            .at(&path)
                            .with_tag("invalid-json"),
                    );
                }
                continue;
            }
            if is_c_like(&path) {
                let scan = scan_delimiters(&text);
                if !scan.balanced() {
                    let message = match scan.error_line {
                        Some(line) => format!("mismatched delimiter on line {line}"),
                        None => format!("{} unclosed delimiter(s) at end of file", scan.unclosed),
                    };
                    findings.push(
                        Finding::blocking(Severity::High, message)
                            .at(&path)
                            .with_tag("unbalanced-delimiters"),
                    );
                }
            }
        }

        if let (Some(command), Some(sandbox)) = (&self.command, &ctx.sandbox) {
            let output = sandbox.exec(command).await.map_err(|e| ForgeError::CheckerCrash {
                checker: self.name().to_string(),
                message: e.to_string(),
            })?;
            if !output.success() {
                let tail: String = output
                    .stderr
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                findings.push(
                    Finding::blocking(
                        Severity::High,
                        format!("`{command}` exited with {}: {tail}", output.exit_code),
                    )
                    .with_tag("command-failed"),
                );
            }
        }

        Ok(CheckOutcome {
            score: None,
            findings,
        })
    }
}
