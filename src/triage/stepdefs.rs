//! Best-effort static association from a failing step to source code.
//!
//! Two lookups, both allowed to come back empty:
//! - the step definition, from the report's match location or by scanning
//!   step modules for a decorator whose pattern matches the step text
//! - related page/service classes named near that definition

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::paths::PathValidator;
use crate::results::report::split_location;

static DECORATOR_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"@(?:given|when|then|step)\(\s*[rRuUfF]*['"](.+?)['"]\s*\)"#).ok()
});
static PLACEHOLDER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\\\{[A-Za-z0-9_]*(?::([A-Za-z]+))?\\\}").ok());
static DEF_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z0-9_]+)").ok());
static CLASS_REF_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9]+(?:Page|Service)\b").ok());

const STEP_KEYWORDS: [&str; 5] = ["Given", "When", "Then", "And", "But"];
/// How far below a decorator or match location the `def` may sit.
const DEF_LOOKAHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSource {
    ReportMatch,
    DecoratorScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Relative to the project root.
    pub file: String,
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub snippet: String,
    pub source: DefinitionSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedCode {
    pub symbol: String,
    pub file: String,
    pub line: usize,
    pub snippet: String,
}

/// Drop a leading Gherkin keyword from step text.
#[must_use]
pub fn strip_step_keyword(text: &str) -> &str {
    let text = text.trim();
    STEP_KEYWORDS
        .iter()
        .find_map(|kw| text.strip_prefix(kw).and_then(|rest| rest.strip_prefix(' ')))
        .unwrap_or(text)
}

/// Decorator pattern → anchored regex; `{name}` placeholders match anything.
#[must_use]
pub fn pattern_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern);
    let body = PLACEHOLDER_RE
        .as_ref()?
        .replace_all(&escaped, |caps: &regex::Captures<'_>| {
            placeholder_regex(caps.get(1).map(|m| m.as_str()))
        });
    Regex::new(&format!("^{body}$")).ok()
}

/// Regex for a `{name:type}` field; untyped fields match any text.
fn placeholder_regex(kind: Option<&str>) -> &'static str {
    match kind {
        Some("d" | "n") => r"-?\d+",
        Some("f" | "g" | "e") => r"-?\d+(?:\.\d+)?",
        Some("w") => r"\w+",
        Some("l") => r"[a-z]+",
        _ => ".+",
    }
}

/// `CamelCase` → `camel_case`.
#[must_use]
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `start..end` lines of `lines` numbered from 1, centred on `center`.
fn snippet(lines: &[&str], center: usize, radius: usize) -> String {
    let start = center.saturating_sub(radius);
    let end = (center + radius + 1).min(lines.len());
    (start..end)
        .map(|i| format!("{}: {}", i + 1, lines[i]))
        .collect::<Vec<_>>()
        .join("\n")
}

fn find_def(lines: &[&str], from: usize) -> Option<(usize, String)> {
    let re = DEF_RE.as_ref()?;
    lines
        .iter()
        .enumerate()
        .skip(from)
        .take(DEF_LOOKAHEAD)
        .find_map(|(i, line)| re.captures(line).map(|c| (i, c[1].to_string())))
}

/// Looks up code under one project's steps/pages/services directories.
#[derive(Debug, Clone)]
pub struct CodeIndex {
    pub validator: PathValidator,
    pub steps_dir: PathBuf,
    pub pages_dir: PathBuf,
    pub services_dir: PathBuf,
    pub snippet_radius: usize,
    pub related_limit: usize,
}

impl CodeIndex {
    /// Locate the definition of `step_text`. The second value is the
    /// source window around it, fed to [`related_code`](Self::related_code).
    #[must_use]
    pub fn find_step_definition(
        &self,
        step_text: &str,
        report_location: Option<&str>,
    ) -> Option<(StepDefinition, Vec<String>)> {
        report_location
            .and_then(|loc| self.from_location(loc))
            .or_else(|| self.scan_decorators(step_text))
    }

    fn from_location(&self, location: &str) -> Option<(StepDefinition, Vec<String>)> {
        let (file, line) = split_location(location);
        let path = self.validator.validate(&file).ok()?;
        let text = fs::read_to_string(&path).ok()?;
        let lines: Vec<&str> = text.lines().collect();
        let idx = line?.checked_sub(1)? as usize;
        if idx >= lines.len() {
            return None;
        }
        let pattern = lines[idx.saturating_sub(3)..=idx]
            .iter()
            .rev()
            .find_map(|l| DECORATOR_RE.as_ref()?.captures(l).map(|c| c[1].to_string()));
        let (def_idx, function) = match find_def(&lines, idx) {
            Some((i, name)) => (i, Some(name)),
            None => (idx, None),
        };
        Some(self.definition(&path, &lines, def_idx, function, pattern, DefinitionSource::ReportMatch))
    }

    fn scan_decorators(&self, step_text: &str) -> Option<(StepDefinition, Vec<String>)> {
        let target = strip_step_keyword(step_text);
        if target.is_empty() {
            return None;
        }
        let decorator = DECORATOR_RE.as_ref()?;
        for file in python_files(&self.steps_dir) {
            let Ok(text) = fs::read_to_string(&file) else {
                continue;
            };
            let lines: Vec<&str> = text.lines().collect();
            for (idx, line) in lines.iter().enumerate() {
                let Some(caps) = decorator.captures(line) else {
                    continue;
                };
                let pattern = caps[1].to_string();
                if !pattern_to_regex(&pattern).is_some_and(|re| re.is_match(target)) {
                    continue;
                }
                let Some((def_idx, function)) = find_def(&lines, idx + 1) else {
                    continue;
                };
                return Some(self.definition(
                    &file,
                    &lines,
                    def_idx,
                    Some(function),
                    Some(pattern),
                    DefinitionSource::DecoratorScan,
                ));
            }
        }
        None
    }

    fn definition(
        &self,
        path: &Path,
        lines: &[&str],
        def_idx: usize,
        function: Option<String>,
        pattern: Option<String>,
        source: DefinitionSource,
    ) -> (StepDefinition, Vec<String>) {
        let radius = self.snippet_radius;
        let start = def_idx.saturating_sub(radius);
        let end = (def_idx + radius + 1).min(lines.len());
        let context = lines[start..end].iter().map(|l| (*l).to_string()).collect();
        (
            StepDefinition {
                pattern,
                file: self.relative(path),
                line: def_idx + 1,
                function,
                snippet: snippet(lines, def_idx, radius),
                source,
            },
            context,
        )
    }

    /// Page/service classes referenced in `context`, resolved to their
    /// modules, at most `related_limit` of them.
    #[must_use]
    pub fn related_code(&self, context: &[String]) -> Vec<RelatedCode> {
        let Some(re) = CLASS_REF_RE.as_ref() else {
            return Vec::new();
        };
        let text = context.join("\n");
        let names: BTreeSet<&str> = re.find_iter(&text).map(|m| m.as_str()).collect();

        let mut related = Vec::new();
        for name in names {
            if related.len() >= self.related_limit {
                break;
            }
            let dir = if name.ends_with("Page") {
                &self.pages_dir
            } else {
                &self.services_dir
            };
            let path = dir.join(format!("{}.py", camel_to_snake(name)));
            let Ok(source) = fs::read_to_string(&path) else {
                continue;
            };
            let lines: Vec<&str> = source.lines().collect();
            let header = format!("class {name}");
            let class_idx = lines
                .iter()
                .position(|l| {
                    l.trim_start()
                        .strip_prefix(&header)
                        .is_some_and(|rest| rest.starts_with(['(', ':']))
                })
                .unwrap_or(0);
            related.push(RelatedCode {
                symbol: name.to_string(),
                file: self.relative(&path),
                line: class_idx + 1,
                snippet: snippet(&lines, class_idx, self.snippet_radius),
            });
        }
        related
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.validator.root())
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// `*.py` files under `dir`, recursively, in sorted order.
pub(crate) fn python_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let Ok(kind) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() && path.extension().is_some_and(|e| e == "py") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: &str = r#"from behave import given, when, then
from pages.admin_page import AdminPage
from services.booking_service import BookingService


@given('I am on the home page')
def step_home(context):
    context.page.open()


@when('I create a booking for "{guest}" in room {room:d}')
def step_create_booking(context, guest, room):
    service = BookingService(context.api)
    context.booking = service.create(guest, room)


@then(u"the admin sees {count} bookings")
def step_admin_sees(context, count):
    page = AdminPage(context.page)
    assert page.booking_count() == int(count)
"#;

    fn project() -> (tempfile::TempDir, CodeIndex) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("steps")).unwrap();
        fs::create_dir_all(root.join("pages")).unwrap();
        fs::create_dir_all(root.join("services")).unwrap();
        fs::write(root.join("steps/booking_steps.py"), STEPS).unwrap();
        fs::write(
            root.join("pages/admin_page.py"),
            "import x\n\n\nclass AdminPage(BasePage):\n    pass\n",
        )
        .unwrap();
        fs::write(
            root.join("services/booking_service.py"),
            "class BookingService:\n    pass\n",
        )
        .unwrap();
        let index = CodeIndex {
            validator: PathValidator::new(root),
            steps_dir: root.join("steps"),
            pages_dir: root.join("pages"),
            services_dir: root.join("services"),
            snippet_radius: 10,
            related_limit: 2,
        };
        (dir, index)
    }

    #[test]
    fn keyword_is_stripped() {
        assert_eq!(strip_step_keyword("Then the thing"), "the thing");
        assert_eq!(strip_step_keyword("Thence"), "Thence");
    }

    #[test]
    fn placeholders_follow_their_type() {
        let re = pattern_to_regex(r#"I create a booking for "{guest}" in room {room:d}"#).unwrap();
        assert!(re.is_match(r#"I create a booking for "Ann (VIP)" in room 12"#));
        assert!(!re.is_match(r#"I create a booking for "Ann" in room 12 today"#));
        assert!(!re.is_match(r#"I create a booking for "Ann" in room twelve"#));

        let re = pattern_to_regex("the total is {amount:f} after {n} items").unwrap();
        assert!(re.is_match("the total is 12.50 after three items"));
        assert!(!re.is_match("the total is cheap after three items"));
    }

    #[test]
    fn camel_case_to_module_name() {
        assert_eq!(camel_to_snake("AdminPage"), "admin_page");
        assert_eq!(camel_to_snake("BookingService"), "booking_service");
    }

    #[test]
    fn scan_finds_definition_and_related_classes() {
        let (_dir, index) = project();
        let (def, context) = index
            .find_step_definition("Then the admin sees 3 bookings", None)
            .unwrap();
        assert_eq!(def.source, DefinitionSource::DecoratorScan);
        assert_eq!(def.function.as_deref(), Some("step_admin_sees"));
        assert_eq!(def.file, "steps/booking_steps.py");
        assert_eq!(def.line, 18);
        assert!(def.snippet.contains("18: def step_admin_sees"));

        let related = index.related_code(&context);
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].symbol, "AdminPage");
        assert_eq!(related[0].file, "pages/admin_page.py");
        assert_eq!(related[0].line, 4);
        assert_eq!(related[1].symbol, "BookingService");
    }

    #[test]
    fn report_location_wins() {
        let (_dir, index) = project();
        let (def, _) = index
            .find_step_definition("I am on the home page", Some("steps/booking_steps.py:12"))
            .unwrap();
        assert_eq!(def.source, DefinitionSource::ReportMatch);
        assert_eq!(def.function.as_deref(), Some("step_create_booking"));
        assert!(def.pattern.unwrap().starts_with("I create a booking"));
    }

    #[test]
    fn escaping_location_is_ignored() {
        let (_dir, index) = project();
        let (def, _) = index
            .find_step_definition("I am on the home page", Some("../../etc/passwd:1"))
            .unwrap();
        assert_eq!(def.source, DefinitionSource::DecoratorScan);
        assert_eq!(def.function.as_deref(), Some("step_home"));
    }

    #[test]
    fn unknown_step_is_none() {
        let (_dir, index) = project();
        assert!(index.find_step_definition("Given nothing matches", None).is_none());
    }
}
