use super::{clamp_score, is_style_bearing};
use crate::error::ForgeResult;
use crate::swarm::{CheckContext, CheckOutcome, Checker, Finding, GatePolicy, Severity};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#(?:[0-9a-fA-F]{6}|[0-9a-fA-F]{3})\b").expect("static regex"));
static FONT_FAMILY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)font-?family\s*:\s*([^;}\n]+)").expect("static regex"));
static INLINE_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"style=(?:\{\{|")"#).expect("static regex"));

const GENERIC_FONTS: &[&str] = &[
    "serif", "sans-serif", "monospace", "system-ui", "inherit", "initial", "cursive",
];

fn normalize_color(raw: &str) -> String {
    let hex = raw.trim_start_matches('#').to_ascii_lowercase();
    if hex.len() == 3 {
        let expanded: String = hex.chars().flat_map(|c| [c, c]).collect();
        format!("#{expanded}")
    } else {
        format!("#{hex}")
    }
}

/// Adherence to the contract's visual identity
///
/// Colors outside the palette and fonts outside the font list cost points
/// when the identity names them; inline styles and `!important` always do.
#[derive(Debug, Clone)]
pub struct VisualDesignChecker {
    threshold: f64,
}

impl VisualDesignChecker {
    /// Checker passing at `threshold`
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Checker for VisualDesignChecker {
    fn name(&self) -> &str {
        "visual-design"
    }

    fn policy(&self) -> GatePolicy {
        GatePolicy::Threshold(self.threshold)
    }

    async fn check(&self, ctx: &CheckContext) -> ForgeResult<CheckOutcome> {
        let identity = ctx.contract.identity();
        let palette: BTreeSet<String> = identity.palette.iter().map(|c| normalize_color(c)).collect();
        let fonts: BTreeSet<String> = identity.fonts.iter().map(|f| f.to_ascii_lowercase()).collect();

        let mut findings = Vec::new();
        let mut penalty = 0.0;
        let mut inline_total = 0usize;

        for (path, text) in ctx.text_files() {
            if !is_style_bearing(&path) {
                continue;
            }

            if !palette.is_empty() {
                let off: BTreeSet<String> = HEX_COLOR
                    .find_iter(&text)
                    .map(|m| normalize_color(m.as_str()))
                    .filter(|c| !palette.contains(c))
                    .collect();
                for color in off {
                    penalty += 5.0;
                    findings.push(
                        Finding::new(Severity::Medium, format!("color {color} is not in the palette"))
                            .at(&path)
                            .with_tag("off-palette-color"),
                    );
                }
            }

            if !fonts.is_empty() {
                for caps in FONT_FAMILY.captures_iter(&text) {
                    let first = caps[1]
                        .split(',')
                        .next()
                        .unwrap_or_default()
                        .trim()
                        .trim_matches(|c| c == '"' || c == '\'')
                        .to_ascii_lowercase();
                    if first.is_empty() || GENERIC_FONTS.contains(&first.as_str()) || fonts.contains(&first) {
                        continue;
                    }
                    penalty += 10.0;
                    findings.push(
                        Finding::new(Severity::Medium, format!("font {first} is not in the identity"))
                            .at(&path)
                            .with_tag("off-brand-font"),
                    );
                }
            }

            let inline = INLINE_STYLE.find_iter(&text).count();
            if inline > 0 {
                inline_total += inline;
                findings.push(
                    Finding::new(Severity::Low, format!("{inline} inline style(s)"))
                        .at(&path)
                        .with_tag("inline-style"),
                );
            }

            let important = text.matches("!important").count();
            if important > 0 {
                penalty += important as f64;
                findings.push(
                    Finding::new(Severity::Low, format!("{important} !important override(s)"))
                        .at(&path)
                        .with_tag("important-override"),
                );
            }
        }
        penalty += (inline_total * 2).min(20) as f64;

        Ok(CheckOutcome {
            score: Some(clamp_score(penalty)),
            findings,
        })
    }
}
