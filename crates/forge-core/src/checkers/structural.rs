use super::{clamp_score, is_c_like, scan_delimiters};
use crate::error::ForgeResult;
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;
use forge_artifact::{ContentHash, WorkspacePath};
use std::collections::BTreeMap;

const MAX_LINES: usize = 400;
const MAX_LINE_WIDTH: usize = 160;
const MAX_BRACE_DEPTH: usize = 6;
const MIN_DUPLICATE_LINES: usize = 4;

/// Size, nesting and duplication
#[derive(Debug, Clone)]
pub struct StructuralQualityChecker {
    threshold: f64,
}

impl StructuralQualityChecker {
    /// Checker passing at `threshold`
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Checker for StructuralQualityChecker {
    fn name(&self) -> &str {
        "structural-quality"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Threshold(self.threshold)
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let mut findings = Vec::new();
        let mut penalty = 0.0;
        let mut by_content: BTreeMap<ContentHash, Vec<WorkspacePath>> = BTreeMap::new();

        for (path, text) in ctx.text_files() {
            if !is_c_like(&path) {
                continue;
            }
            let lines = text.lines().count();
            if lines > MAX_LINES {
                penalty += 10.0;
                findings.push(
                    Finding::new(Severity::Medium, format!("{lines} lines; split files over {MAX_LINES}"))
                        .at(&path)
                        .with_tag("oversized-file"),
                );
            }

            let wide = text.lines().filter(|l| l.chars().count() > MAX_LINE_WIDTH).count();
            if wide > 0 {
                penalty += wide.min(10) as f64;
                findings.push(
                    Finding::new(Severity::Low, format!("{wide} line(s) wider than {MAX_LINE_WIDTH}"))
                        .at(&path)
                        .with_tag("long-line"),
                );
            }

            let depth = scan_delimiters(&text).max_brace_depth;
            if depth > MAX_BRACE_DEPTH {
                penalty += 5.0;
                findings.push(
                    Finding::new(Severity::Medium, format!("nesting depth {depth}"))
                        .at(&path)
                        .with_tag("deep-nesting"),
                );
            }

            if lines >= MIN_DUPLICATE_LINES {
                by_content
                    .entry(ContentHash::compute(text.as_bytes()))
                    .or_default()
                    .push(path);
            }
        }

        for paths in by_content.values().filter(|p| p.len() > 1) {
            penalty += 10.0;
            let names: Vec<&str> = paths.iter().map(WorkspacePath::as_str).collect();
            findings.push(
                Finding::new(Severity::Medium, format!("identical files: {}", names.join(", ")))
                    .at(&paths[1])
                    .with_tag("duplicate-file"),
            );
        }

        Ok(CheckOutcome {
            score: Some(clamp_score(penalty)),
            findings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::IntentContract;
    use forge_artifact::{ChangeSet, SnapshotArena};
    use std::sync::Arc;

    fn ctx(files: Vec<(String, String)>) -> CheckContext {
        let mut set = ChangeSet::new("ui");
        for (path, text) in files {
            set.write(WorkspacePath::new(path).unwrap(), text.into_bytes());
        }
        CheckContext::new(SnapshotArena::new().head().overlay(&set), Arc::new(IntentContract::draft("x")))
    }

    #[tokio::test]
    async fn small_clean_code_scores_full() {
        let outcome = StructuralQualityChecker::new(80.0)
            .check(&ctx(vec![("src/a.ts".into(), "export const a = 1;\n".into())]))
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(100.0));
        assert!(outcome.findings.is_empty());
    }

    #[tokio::test]
    async fn penalties_accumulate() {
        let huge = "let x = 1;\n".repeat(MAX_LINES + 1);
        let nested = format!("{}{}\n", "{".repeat(8), "}".repeat(8));
        let dup = "a();\nb();\nc();\nd();\n".to_string();
        let checker = StructuralQualityChecker::new(80.0);
        let outcome = checker
            .check(&ctx(vec![
                ("src/huge.ts".into(), huge),
                ("src/nested.ts".into(), nested),
                ("src/one.ts".into(), dup.clone()),
                ("src/two.ts".into(), dup),
            ]))
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(75.0));
        assert!(!checker.policy().passes(&outcome));
    }
}
