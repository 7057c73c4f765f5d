//! The six standard checkers
//!
//! | Checker | Policy |
//! |---|---|
//! | [`CorrectnessChecker`] | blocking |
//! | [`StructuralQualityChecker`] | threshold (80) |
//! | [`VisualDesignChecker`] | threshold (85) |
//! | [`SecurityChecker`] | blocking on critical |
//! | [`PlaceholderChecker`] | zero tolerance |
//! | [`StyleConsistencyChecker`] | threshold (85) |

mod correctness;
mod placeholder;
mod security;
mod structural;
mod style;
mod visual;

pub use correctness::CorrectnessChecker;
pub use placeholder::PlaceholderChecker;
pub use security::SecurityChecker;
pub use structural::StructuralQualityChecker;
pub use style::StyleConsistencyChecker;
pub use visual::VisualDesignChecker;

use forge_artifact::WorkspacePath;

const C_LIKE: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "css", "scss", "less", "rs", "go", "java", "c", "h", "cpp", "cs",
    "kt", "swift",
];

const STYLE_BEARING: &[&str] = &["css", "scss", "less", "html", "tsx", "jsx", "vue", "svelte"];

fn has_ext(path: &WorkspacePath, set: &[&str]) -> bool {
    path.extension().is_some_and(|ext| set.contains(&ext))
}

/// Brace-delimited source where delimiter balance is meaningful
pub(crate) fn is_c_like(path: &WorkspacePath) -> bool {
    has_ext(path, C_LIKE)
}

/// Files that carry visual styling
pub(crate) fn is_style_bearing(path: &WorkspacePath) -> bool {
    has_ext(path, STYLE_BEARING)
}

/// Clamp a penalty-based score into `[0, 100]`
pub(crate) fn clamp_score(penalty: f64) -> f64 {
    (100.0 - penalty).clamp(0.0, 100.0)
}

/// Outcome of scanning delimiters outside strings and comments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DelimiterScan {
    /// First unmatched or mismatched delimiter, 1-based line
    pub(crate) error_line: Option<usize>,
    /// Unclosed openers at end of file
    pub(crate) unclosed: usize,
    /// Deepest `{` nesting seen
    pub(crate) max_brace_depth: usize,
}

impl DelimiterScan {
    pub(crate) fn balanced(&self) -> bool {
        self.error_line.is_none() && self.unclosed == 0
    }
}

/// Scan `()[]{}` skipping string literals and `//`, `/* */` comments
pub(crate) fn scan_delimiters(source: &str) -> DelimiterScan {
    let mut scan = DelimiterScan::default();
    let mut stack: Vec<char> = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut quote: Option<char> = None;
    let mut brace_depth = 0usize;

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }
        if let Some(q) = quote {
            if c == '\\' {
                if chars.next() == Some('\n') {
                    line += 1;
                }
            } else if c == q || (c == '\n' && q != '`') {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                    }
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '(' | '[' | '{' => {
                if c == '{' {
                    brace_depth += 1;
                    scan.max_brace_depth = scan.max_brace_depth.max(brace_depth);
                }
                stack.push(c);
            }
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if c == '}' {
                    brace_depth = brace_depth.saturating_sub(1);
                }
                if stack.pop() != Some(expected) && scan.error_line.is_none() {
                    scan.error_line = Some(line);
                }
            }
            _ => {}
        }
    }
    scan.unclosed = stack.len();
    scan
}
