use crate::error::ForgeResult;
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

static PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("todo-marker", r"\b(?:TODO|FIXME|XXX|HACK)\b"),
        ("lorem-ipsum", r"(?i)\blorem ipsum\b"),
        (
            "not-implemented",
            r"(?i)\bnot (?:yet )?implemented\b|\btodo!\(|\bunimplemented!\(|NotImplementedError",
        ),
        ("placeholder-content", r"(?i)\bplaceholder (?:text|content|data|image)\b|\bcoming soon\b"),
        (
            "elided-code",
            r"(?i)(?://|#|/\*|\{/\*)\s*\.\.\.|\brest of (?:the )?(?:code|implementation|file)\b",
        ),
        ("stub-value", r"REPLACE_ME|CHANGEME|(?i:your[_-]api[_-]key(?:[_-]here)?)"),
    ]
    .into_iter()
    .map(|(tag, pattern)| (tag, Regex::new(pattern).expect("static regex")))
    .collect()
});

/// Unfinished work left in generated files
///
/// Any hit fails the checker; there is no score.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderChecker;

impl PlaceholderChecker {
    /// New checker
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Checker for PlaceholderChecker {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::ZeroTolerance
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let mut findings = Vec::new();
        for (path, text) in ctx.text_files() {
            for (idx, line) in text.lines().enumerate() {
                for (tag, pattern) in PATTERNS.iter() {
                    if let Some(hit) = pattern.find(line) {
                        findings.push(
                            Finding::blocking(
                                Severity::High,
                                format!("line {}: `{}`", idx + 1, hit.as_str()),
                            )
                            .at(&path)
                            .with_tag(*tag),
                        );
                    }
                }
            }
        }
        Ok(CheckOutcome {
            score: None,
            findings,
        })
    }
}
