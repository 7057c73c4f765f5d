use super::clamp_score;
use crate::error::ForgeResult;
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

static IMPORT_QUOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*import\b[^'"]*(['"])"#).expect("static regex"));

const TRAILING_CAP: f64 = 15.0;

#[derive(Debug, Default)]
struct Tally {
    tab_files: usize,
    space_files: usize,
    single_quotes: usize,
    double_quotes: usize,
}

/// Cross-file formatting consistency
#[derive(Debug, Clone)]
pub struct StyleConsistencyChecker {
    threshold: f64,
}

impl StyleConsistencyChecker {
    /// Checker passing at `threshold`
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Checker for StyleConsistencyChecker {
    fn name(&self) -> &str {
        "style-consistency"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Threshold(self.threshold)
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let mut findings = Vec::new();
        let mut penalty = 0.0;
        let mut trailing_total = 0.0;
        let mut tally = Tally::default();

        for (path, text) in ctx.text_files() {
            if text.is_empty() {
                continue;
            }
            let trailing = text
                .split('\n')
                .filter(|l| {
                    let l = l.strip_suffix('\r').unwrap_or(l);
                    l.ends_with(' ') || l.ends_with('\t')
                })
                .count();
            if trailing > 0 {
                trailing_total += trailing as f64;
                findings.push(
                    Finding::new(Severity::Low, format!("{trailing} line(s) with trailing whitespace"))
                        .at(&path)
                        .with_tag("trailing-whitespace"),
                );
            }
            if !text.ends_with('\n') {
                penalty += 3.0;
                findings.push(
                    Finding::new(Severity::Low, "no newline at end of file")
                        .at(&path)
                        .with_tag("missing-final-newline"),
                );
            }
            if text.contains("\r\n") {
                penalty += 5.0;
                findings.push(
                    Finding::new(Severity::Low, "CRLF line endings")
                        .at(&path)
                        .with_tag("crlf-line-endings"),
                );
            }

            let tabs = text.lines().any(|l| l.starts_with('\t'));
            let spaces = text.lines().any(|l| l.starts_with("  "));
            if tabs && !spaces {
                tally.tab_files += 1;
            } else if spaces && !tabs {
                tally.space_files += 1;
            }

            for line in text.lines() {
                if let Some(caps) = IMPORT_QUOTE.captures(line) {
                    match &caps[1] {
                        "'" => tally.single_quotes += 1,
                        _ => tally.double_quotes += 1,
                    }
                }
            }
        }

        penalty += trailing_total.min(TRAILING_CAP);

        if tally.tab_files > 0 && tally.space_files > 0 {
            penalty += 10.0;
            findings.push(
                Finding::new(
                    Severity::Medium,
                    format!(
                        "{} tab-indented and {} space-indented files",
                        tally.tab_files,
                        tally.space_files
                    ),
                )
                .with_tag("mixed-indentation"),
            );
        }
        if tally.single_quotes > 0 && tally.double_quotes > 0 {
            penalty += 5.0;
            findings.push(
                Finding::new(
                    Severity::Low,
                    format!(
                        "imports use both quote styles ({} single, {} double)",
                        tally.single_quotes, tally.double_quotes
                    ),
                )
                .with_tag("mixed-quotes"),
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
    use forge_artifact::{ChangeSet, SnapshotArena, WorkspacePath};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn run(files: &[(&str, &str)]) -> CheckOutcome {
        let mut set = ChangeSet::new("ui");
        for (path, text) in files {
            set.write(WorkspacePath::new(path).unwrap(), text.as_bytes().to_vec());
        }
        let ctx = CheckContext::new(SnapshotArena::new().head().overlay(&set), Arc::new(IntentContract::draft("x")));
        StyleConsistencyChecker::new(85.0).check(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn consistent_files_score_full() {
        let outcome = run(&[
            ("src/a.ts", "import { b } from './b';\nexport const a = () => {\n  return b;\n};\n"),
            ("src/b.ts", "import x from 'x';\nexport const b = x;\n"),
        ])
        .await;
        assert_eq!(outcome.score, Some(100.0));
    }

    #[tokio::test]
    async fn whitespace_problems_are_tagged() {
        let outcome = run(&[("src/a.ts", "const a = 1;  \r\nconst b = 2;")]).await;
        let tags: Vec<_> = outcome.findings.iter().filter_map(|f| f.tag.as_deref()).collect();
        assert_eq!(tags, vec!["trailing-whitespace", "missing-final-newline", "crlf-line-endings"]);
        assert_eq!(outcome.score, Some(91.0));
    }

    #[tokio::test]
    async fn mixed_conventions_across_files() {
        let outcome = run(&[
            ("src/a.ts", "import a from 'a';\nif (a) {\n\treturn;\n}\n"),
            ("src/b.ts", "import b from \"b\";\nif (b) {\n  return;\n}\n"),
        ])
        .await;
        assert_eq!(outcome.score, Some(85.0));
    }
}
