//! Concrete fix suggestions.
//!
//! Only two categories get one, and only when the offending line can be
//! found: a changed selector literal in `pages/` or `steps/` gets a
//! `data-testid` alternative, and a `timeout=` in the failing step's
//! definition or the classes it references gets a larger value.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::analysis::rules::FailureCategory;
use crate::triage::context::FailureContext;
use crate::triage::stepdefs::python_files;

static SELECTOR_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"locator\(\s*(?:\\?["'])(.+?)(?:\\?["'])\s*\)"#,
        r#""selector"\s*:\s*"(.+?)""#,
        r#"waiting for (?:selector|locator)\s+["'](.+?)["']"#,
        r#"get_by_test_id\(\s*["'](.+?)["']\s*\)"#,
        r#"(?:css|xpath)=([^\s"']+)"#,
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});
static TIMEOUT_ARG_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\btimeout\s*=\s*(\d+)").ok());
static IDENT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9_-]*").ok());

/// Cap for a suggested timeout, in the unit of the literal found.
const MAX_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_SECS: u64 = 120;
const SEARCH_FILE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    /// Relative to the project root.
    pub file: String,
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_code: Option<String>,
    pub explanation: String,
    pub confidence: f64,
}

/// Selector literal quoted in an error message, if any.
#[must_use]
pub fn extract_selector(error: &str) -> Option<String> {
    SELECTOR_RES
        .iter()
        .find_map(|re| re.captures(error))
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `#submit-btn`, `.cart .total`, `button[name='go']` → `submit-btn`,
/// `total`, `go`.
#[must_use]
pub fn test_id_for(selector: &str) -> Option<String> {
    let re = IDENT_RE.as_ref()?;
    let quoted = selector
        .split(['\'', '"'])
        .nth(1)
        .filter(|q| re.is_match(q));
    let token = match quoted {
        Some(q) => q,
        None => re
            .find_iter(selector)
            .map(|m| m.as_str())
            .filter(|t| !matches!(*t, "div" | "span" | "button" | "input" | "a" | "nth-child"))
            .last()?,
    };
    let id: String = token
        .chars()
        .map(|c| if c == '_' { '-' } else { c.to_ascii_lowercase() })
        .collect();
    (!id.is_empty()).then_some(id)
}

/// `[data-testid=…]` quoted so it nests inside the literal that holds
/// `selector` on `line`.
fn test_id_selector(line: &str, selector: &str, test_id: &str) -> String {
    let enclosing = line
        .find(selector)
        .and_then(|at| line[..at].chars().next_back());
    if enclosing == Some('"') {
        format!("[data-testid='{test_id}']")
    } else {
        format!("[data-testid=\"{test_id}\"]")
    }
}

/// Finds source lines to attach suggestions to.
#[derive(Debug, Clone)]
pub struct Suggester {
    pub project_root: PathBuf,
    pub pages_dir: PathBuf,
    pub steps_dir: PathBuf,
}

struct SourceHit {
    file: String,
    line: usize,
    text: String,
}

impl Suggester {
    #[must_use]
    pub fn suggest(
        &self,
        category: FailureCategory,
        context: &FailureContext,
        confidence: f64,
    ) -> Vec<Suggestion> {
        match category {
            FailureCategory::SelectorChanged => self.selector(context, confidence),
            FailureCategory::TimingIssue => self.timeout(context, confidence),
            _ => Vec::new(),
        }
    }

    fn selector(&self, context: &FailureContext, confidence: f64) -> Vec<Suggestion> {
        let Some(error) = context.error.as_deref() else {
            return Vec::new();
        };
        let Some(selector) = extract_selector(error) else {
            return Vec::new();
        };
        let Some(test_id) = test_id_for(&selector) else {
            return Vec::new();
        };
        if selector.contains("data-testid") || selector == test_id {
            return Vec::new();
        }
        let dirs = [self.pages_dir.as_path(), self.steps_dir.as_path()];
        let Some(hit) = self.search(&dirs, |line| line.contains(&selector)) else {
            return Vec::new();
        };
        let replacement = test_id_selector(&hit.text, &selector, &test_id);
        let suggested = hit.text.replacen(&selector, &replacement, 1);
        vec![Suggestion {
            file: hit.file,
            line: hit.line,
            current_code: Some(hit.text),
            suggested_code: Some(suggested),
            explanation: format!(
                "Selector '{selector}' no longer matches. Target a stable test id instead and add data-testid=\"{test_id}\" to the element if it is missing."
            ),
            confidence: round2(confidence * 0.8),
        }]
    }

    fn timeout(&self, context: &FailureContext, confidence: f64) -> Vec<Suggestion> {
        let Some(re) = TIMEOUT_ARG_RE.as_ref() else {
            return Vec::new();
        };
        // Only code tied to the failing step: its definition, then the
        // page and service classes it references.
        let files: Vec<PathBuf> = context
            .step_definition
            .iter()
            .map(|d| d.file.as_str())
            .chain(context.related_code.iter().map(|r| r.file.as_str()))
            .map(|f| self.project_root.join(f))
            .collect();
        let hit = files
            .iter()
            .find_map(|f| self.search_file(f, |line| re.is_match(line)));
        let Some(hit) = hit else {
            return Vec::new();
        };
        let Some(caps) = re.captures(&hit.text) else {
            return Vec::new();
        };
        let Ok(current) = caps[1].parse::<u64>() else {
            return Vec::new();
        };
        let cap = if current >= 1000 { MAX_TIMEOUT_MS } else { MAX_TIMEOUT_SECS };
        let raised = current.saturating_mul(2).min(cap);
        if raised <= current {
            return Vec::new();
        }
        let old = caps[0].to_string();
        let suggested = hit
            .text
            .replacen(&old, &old.replacen(&caps[1], &raised.to_string(), 1), 1);
        vec![Suggestion {
            file: hit.file,
            line: hit.line,
            current_code: Some(hit.text),
            suggested_code: Some(suggested),
            explanation: format!(
                "The wait ran out. Raise the timeout from {current} to {raised}, or wait for a specific element state instead of a fixed delay."
            ),
            confidence: round2(confidence * 0.6),
        }]
    }

    fn search(&self, dirs: &[&Path], matches: impl Fn(&str) -> bool) -> Option<SourceHit> {
        dirs.iter()
            .flat_map(|d| python_files(d))
            .take(SEARCH_FILE_LIMIT)
            .find_map(|f| self.search_file(&f, &matches))
    }

    fn search_file(&self, path: &Path, matches: impl Fn(&str) -> bool) -> Option<SourceHit> {
        let text = fs::read_to_string(path).ok()?;
        let (idx, line) = text.lines().enumerate().find(|&(_, l)| matches(l))?;
        Some(SourceHit {
            file: path
                .strip_prefix(&self.project_root)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned(),
            line: idx + 1,
            text: line.trim().to_string(),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}
