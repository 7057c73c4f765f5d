use super::clamp_score;
use crate::error::ForgeResult;
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

struct Rule {
    tag: &'static str,
    severity: Severity,
    message: &'static str,
    pattern: Regex,
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        (
            "hardcoded-secret",
            Severity::Critical,
            "hardcoded credential",
            r#"(?i)\b(?:api[_-]?key|secret|password|passwd|auth[_-]?token|access[_-]?token)\b\s*[:=]\s*["'][^"'\s]{8,}["']"#,
        ),
        (
            "private-key",
            Severity::Critical,
            "private key material",
            r"-----BEGIN (?:[A-Z]+ )?PRIVATE KEY-----",
        ),
        ("cloud-credential", Severity::Critical, "cloud access key id", r"\bAKIA[0-9A-Z]{16}\b"),
        ("eval", Severity::High, "dynamic code evaluation", r"\beval\s*\(|new\s+Function\s*\("),
        (
            "raw-html",
            Severity::Medium,
            "unescaped HTML injection",
            r"dangerouslySetInnerHTML|\.innerHTML\s*=[^=]",
        ),
        (
            "insecure-transport",
            Severity::Low,
            "plain http URL",
            r"http://(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}",
        ),
    ]
    .into_iter()
    .map(|(tag, severity, message, pattern)| Rule {
        tag,
        severity,
        message,
        pattern: Regex::new(pattern).expect("static regex"),
    })
    .collect()
});

fn weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 40.0,
        Severity::High => 15.0,
        Severity::Medium => 5.0,
        Severity::Low => 1.0,
        Severity::Info => 0.0,
    }
}

/// Secrets, injection sinks and insecure transport
///
/// Critical findings block; the rest only lower the score.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityChecker;

impl SecurityChecker {
    /// New checker
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Checker for SecurityChecker {
    fn name(&self) -> &str {
        "security"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::BlockingOnCritical
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let mut findings = Vec::new();
        let mut penalty = 0.0;

        for (path, text) in ctx.text_files() {
            for (idx, line) in text.lines().enumerate() {
                for rule in RULES.iter() {
                    if !rule.pattern.is_match(line) {
                        continue;
                    }
                    penalty += weight(rule.severity);
                    let message = format!("{} on line {}", rule.message, idx + 1);
                    let finding = if rule.severity == Severity::Critical {
                        Finding::blocking(rule.severity, message)
                    } else {
                        Finding::new(rule.severity, message)
                    };
                    findings.push(finding.at(&path).with_tag(rule.tag));
                }
            }
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
    use std::sync::Arc;

    fn ctx(path: &str, text: &str) -> CheckContext {
        let mut set = ChangeSet::new("api");
        set.write(WorkspacePath::new(path).unwrap(), text.as_bytes().to_vec());
        CheckContext::new(SnapshotArena::new().head().overlay(&set), Arc::new(IntentContract::draft("x")))
    }

    #[tokio::test]
    async fn env_lookups_are_clean() {
        let outcome = SecurityChecker::new()
            .check(&ctx("src/api.ts", "const key = process.env.API_KEY;\nfetch('http://localhost:3000');\n"))
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(100.0));
        assert!(outcome.findings.is_empty());
    }

    #[tokio::test]
    async fn hardcoded_secret_blocks() {
        let checker = SecurityChecker::new();
        let outcome = checker
            .check(&ctx("src/api.ts", "const api_key = \"sk-live-1234567890\";\n"))
            .await
            .unwrap();
        assert_eq!(outcome.findings[0].tag.as_deref(), Some("hardcoded-secret"));
        assert!(outcome.findings[0].blocking);
        assert!(!checker.policy().passes(&outcome));
    }

    #[tokio::test]
    async fn lesser_issues_only_cost_points() {
        let checker = SecurityChecker::new();
        let outcome = checker
            .check(&ctx(
                "src/view.ts",
                "el.innerHTML = html;\nconst url = 'http://example.com/feed';\n",
            ))
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(94.0));
        assert!(checker.policy().passes(&outcome));
    }
}
