//! INTEGRATION exit predicate
//!
//! The merged workspace integrates when every component is merged, no write
//! conflict is outstanding, every relative import resolves to a file that
//! exists, and every file belongs to a live component.

use crate::component::Component;
use crate::swarm::{Finding, Severity};
use forge_artifact::{Snapshot, WorkspacePath};
use forge_kernel::ComponentStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Extensions tried for extension-less imports
const RESOLVE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "css"];
const INDEX_FILES: &[&str] = &["index.ts", "index.tsx", "index.js", "index.jsx"];

static SCRIPT_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)["'](\.{1,2}/[^"']+)["']"#).expect("static regex")
});
static MARKUP_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\b(?:src|href)\s*=\s*["'](\.{1,2}/[^"'#?]+)["']"#).expect("static regex"));
static STYLE_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"@import\s+(?:url\()?["'](\.{1,2}/[^"']+)["']"#).expect("static regex"));

/// Integration findings, all blocking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationReport {
    /// Findings, grouped by check
    pub findings: Vec<Finding>,
}

impl IntegrationReport {
    /// Exit predicate holds
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.findings.is_empty()
    }

    /// Files named by findings
    #[must_use]
    pub fn paths(&self) -> BTreeSet<WorkspacePath> {
        self.findings.iter().filter_map(|f| f.path.clone()).collect()
    }

    /// Sorted distinct finding tags
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let tags: BTreeSet<&str> = self.findings.iter().filter_map(|f| f.tag.as_deref()).collect();
        tags.into_iter().map(str::to_string).collect()
    }
}

/// Cross-component checks over the merged snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrationCheck;

impl IntegrationCheck {
    /// Run every check
    #[must_use]
    pub fn run(&self, snapshot: &Snapshot, components: &[Component]) -> IntegrationReport {
        let mut findings = Vec::new();
        conflicts(snapshot, components, &mut findings);
        dead_references(snapshot, &mut findings);
        orphans(snapshot, components, &mut findings);
        tracing::info!(
            revision = %snapshot.revision(),
            findings = findings.len(),
            "integration checked"
        );
        IntegrationReport { findings }
    }
}

fn conflicts(snapshot: &Snapshot, components: &[Component], out: &mut Vec<Finding>) {
    for component in components {
        if component.status != ComponentStatus::Merged {
            out.push(
                Finding::blocking(
                    Severity::High,
                    format!("component {} is {:?}, not merged", component.name, component.status),
                )
                .with_tag("unmerged-component"),
            );
        }
        for path in &component.flagged_paths {
            out.push(
                Finding::blocking(
                    Severity::High,
                    format!("write conflict on {path} is unresolved for {}", component.name),
                )
                .at(path)
                .with_tag("write-conflict"),
            );
        }
        for path in &component.owned_files {
            if let Some(writer) = snapshot.owner_of(path).filter(|w| *w != component.name) {
                out.push(
                    Finding::blocking(
                        Severity::Critical,
                        format!("{path} is owned by {} but was merged by {writer}", component.name),
                    )
                    .at(path)
                    .with_tag("write-conflict"),
                );
            }
        }
    }
}

fn references(path: &WorkspacePath, text: &str) -> Vec<String> {
    let patterns: Vec<&Regex> = match path.extension() {
        Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs") => vec![&*SCRIPT_IMPORT],
        Some("html" | "htm" | "vue" | "svelte") => vec![&*SCRIPT_IMPORT, &*MARKUP_REF],
        Some("css" | "scss") => vec![&*STYLE_IMPORT],
        _ => Vec::new(),
    };
    patterns
        .iter()
        .flat_map(|re| re.captures_iter(text).filter_map(|c| c.get(1).map(|m| m.as_str().to_string())))
        .collect()
}

fn resolves(snapshot: &Snapshot, target: &WorkspacePath) -> bool {
    if snapshot.contains(target) {
        return true;
    }
    let base = target.as_str();
    RESOLVE_EXTENSIONS
        .iter()
        .map(|ext| format!("{base}.{ext}"))
        .chain(INDEX_FILES.iter().map(|index| format!("{base}/{index}")))
        .filter_map(|candidate| WorkspacePath::new(candidate).ok())
        .any(|candidate| snapshot.contains(&candidate))
}

fn dead_references(snapshot: &Snapshot, out: &mut Vec<Finding>) {
    for path in snapshot.paths() {
        let Some(text) = snapshot.read_text(path) else { continue };
        for reference in references(path, &text) {
            let live = path
                .resolve_relative(&reference)
                .is_ok_and(|target| resolves(snapshot, &target));
            if !live {
                out.push(
                    Finding::blocking(Severity::High, format!("`{reference}` does not resolve"))
                        .at(path)
                        .with_tag("dead-reference"),
                );
            }
        }
    }
}

fn orphans(snapshot: &Snapshot, components: &[Component], out: &mut Vec<Finding>) {
    let live: BTreeSet<&str> = components.iter().map(|c| c.name.as_str()).collect();
    for path in snapshot.paths() {
        let owner = snapshot.owner_of(path).unwrap_or_default();
        if !live.contains(owner) {
            out.push(
                Finding::blocking(
                    Severity::Medium,
                    format!("{path} belongs to no component (last written by `{owner}`)"),
                )
                .at(path)
                .with_tag("orphan-file"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::InterfaceContract;
    use crate::types::{ComponentId, SessionId};
    use forge_artifact::{ChangeSet, SnapshotArena};
    use std::sync::Arc;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    fn component(name: &str, files: &[&str]) -> Component {
        Component {
            id: ComponentId::new(),
            session_id: SessionId::new(),
            name: name.into(),
            depends_on: Vec::new(),
            status: ComponentStatus::Merged,
            owned_files: files.iter().map(|f| p(f)).collect(),
            interface: InterfaceContract::default(),
            criteria: Vec::new(),
            feature: None,
            flagged_paths: BTreeSet::new(),
            build_count: 1,
            merged_revision: None,
        }
    }

    fn merged(sets: &[(&str, &[(&str, &str)])]) -> Snapshot {
        let mut arena = SnapshotArena::new();
        let mut staging = arena.stage();
        for (owner, files) in sets {
            for (path, body) in *files {
                staging.put(p(path), Arc::from(body.as_bytes()), owner);
            }
        }
        arena.commit(staging, "test").unwrap();
        arena.head()
    }

    #[test]
    fn clean_workspace_integrates() {
        let snap = merged(&[
            ("ui", &[("src/ui/App.tsx", "import { api } from '../api/client';\nimport './App.css';\n"), ("src/ui/App.css", "body {}\n")]),
            ("api", &[("src/api/client/index.ts", "export const api = {};\n")]),
        ]);
        let components = [
            component("ui", &["src/ui/App.tsx", "src/ui/App.css"]),
            component("api", &["src/api/client/index.ts"]),
        ];
        let report = IntegrationCheck.run(&snap, &components);
        assert!(report.passed(), "{:?}", report.findings);
    }

    #[test]
    fn dead_imports_and_orphans_block() {
        let snap = merged(&[
            ("ui", &[("src/ui/App.tsx", "import { x } from './missing';\nconst y = require('../../../etc');\n")]),
            ("legacy", &[("src/old.ts", "export {};\n")]),
        ]);
        let components = [component("ui", &["src/ui/App.tsx"])];
        let report = IntegrationCheck.run(&snap, &components);
        assert_eq!(report.tags(), vec!["dead-reference".to_string(), "orphan-file".to_string()]);
        assert_eq!(report.findings.iter().filter(|f| f.tag.as_deref() == Some("dead-reference")).count(), 2);
        assert_eq!(report.paths(), BTreeSet::from([p("src/old.ts"), p("src/ui/App.tsx")]));
    }

    #[test]
    fn unresolved_conflicts_block() {
        let snap = merged(&[("api", &[("src/ui/App.tsx", "export {};\n")])]);
        let mut ui = component("ui", &["src/ui/App.tsx"]);
        ui.status = ComponentStatus::Building;
        ui.flagged_paths.insert(p("src/ui/App.tsx"));
        let api = component("api", &[]);
        let report = IntegrationCheck.run(&snap, &[ui, api]);
        assert_eq!(report.tags(), vec!["unmerged-component".to_string(), "write-conflict".to_string()]);
        assert_eq!(report.findings.len(), 3);
    }

    #[test]
    fn markup_and_style_references() {
        let snap = merged(&[(
            "web",
            &[
                ("index.html", "<script src=\"./main.js\"></script><link href=\"./gone.css\">"),
                ("main.js", "export {};\n"),
                ("theme.css", "@import './base.css';\n"),
            ],
        )]);
        let components = [component("web", &["index.html", "main.js", "theme.css"])];
        let report = IntegrationCheck.run(&snap, &components);
        let messages: Vec<&str> = report.findings.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, vec!["`./gone.css` does not resolve", "`./base.css` does not resolve"]);
    }
}
