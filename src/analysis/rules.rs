//! Failure categorization rule table.
//!
//! Each rule is (name, category, pattern, weight, scope). A rule fires at
//! most once per diagnosis; a category's score is the sum of its fired
//! weights clamped to 1.0. The highest score wins and ties go to the
//! category declared first in [`FailureCategory`].
//!
//! | category          | rules (weight)                                                                  |
//! |-------------------|---------------------------------------------------------------------------------|
//! | selector_changed  | no_such_element .50, strict_mode .50, locator_wait .45, stale_element .45, selector_literal .20 |
//! | timing_issue      | timeout_exceeded .40, not_actionable .30, navigation_wait .30                   |
//! | app_bug           | assertion_mismatch .40, server_error .35, unexpected_status .25                 |
//! | test_bug          | glue_exception .50, undefined_step .50, context_attribute .30, glue_frame .15   |
//! | environment       | connection_failure .60, missing_config .60, browser_launch .50, tls_failure .40 |
//!
//! A selector signature on a timeout (`locator_wait` + `selector_literal`)
//! outweighs the bare timeout rule, so "waited for a locator" reads as a
//! changed selector rather than slowness.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

/// Confidence reported when no rule fires.
pub const FALLBACK_CONFIDENCE: f64 = 0.15;
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SelectorChanged,
    TimingIssue,
    AppBug,
    TestBug,
    Environment,
}

impl FailureCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SelectorChanged => "selector_changed",
            Self::TimingIssue => "timing_issue",
            Self::AppBug => "app_bug",
            Self::TestBug => "test_bug",
            Self::Environment => "environment",
        }
    }
}

/// Which text a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Error message and failed step text.
    Failure,
    /// Failure text plus extracted log lines.
    Anywhere,
}

#[derive(Debug, Clone, Copy)]
struct RuleSpec {
    name: &'static str,
    category: FailureCategory,
    pattern: &'static str,
    weight: f64,
    scope: Scope,
    cause: &'static str,
}

const fn rule(
    name: &'static str,
    category: FailureCategory,
    pattern: &'static str,
    weight: f64,
    scope: Scope,
    cause: &'static str,
) -> RuleSpec {
    RuleSpec {
        name,
        category,
        pattern,
        weight,
        scope,
        cause,
    }
}

fn builtin_rules() -> Vec<RuleSpec> {
    use FailureCategory::{AppBug, Environment, SelectorChanged, TestBug, TimingIssue};
    use Scope::{Anywhere, Failure};
    vec![
        rule(
            "no_such_element",
            SelectorChanged,
            r"(?i)no ?such ?element|element not found|unable to locate element",
            0.50,
            Failure,
            "The element the step looks for is no longer on the page under that selector.",
        ),
        rule(
            "strict_mode",
            SelectorChanged,
            r"(?i)strict mode violation|resolved to \d+ elements",
            0.50,
            Failure,
            "The selector now matches several elements; the page structure changed.",
        ),
        rule(
            "locator_wait",
            SelectorChanged,
            r"(?i)waiting for (?:locator|selector)\b",
            0.45,
            Failure,
            "A wait for a specific locator ran out; the selector most likely no longer matches.",
        ),
        rule(
            "stale_element",
            SelectorChanged,
            r"(?i)stale element reference|element is not attached",
            0.45,
            Failure,
            "The element was re-rendered between lookup and use.",
        ),
        rule(
            "selector_literal",
            SelectorChanged,
            r#"(?i)locator\(|get_by_\w+\(|css=|xpath=|data-testid|"selector"|\[[a-z-]+=['"]?[^\]]+\]"#,
            0.20,
            Failure,
            "The failure names a concrete selector.",
        ),
        rule(
            "timeout_exceeded",
            TimingIssue,
            r"(?i)timeout \d+ ?ms exceeded|timed? ?out\b|TimeoutError|TimeoutException",
            0.40,
            Failure,
            "An operation did not finish within its timeout.",
        ),
        rule(
            "not_actionable",
            TimingIssue,
            r"(?i)element is not (?:visible|stable|enabled|ready)|intercepts pointer events|not yet (?:visible|ready)",
            0.30,
            Failure,
            "The element existed but was not ready for interaction yet.",
        ),
        rule(
            "navigation_wait",
            TimingIssue,
            r"(?i)waiting for (?:navigation|load state|event|url)|networkidle",
            0.30,
            Failure,
            "A page transition took longer than the test allows.",
        ),
        rule(
            "assertion_mismatch",
            AppBug,
            r"(?i)AssertionError|assert .+(?:==|!=)|expected .+ (?:but )?(?:got|was|received)",
            0.40,
            Failure,
            "The application returned a value different from what the scenario expects.",
        ),
        rule(
            "server_error",
            AppBug,
            r"(?i)internal server error|\bstatus(?:_code)?\W{1,4}5\d\d\b|\b5\d\d (?:server )?error",
            0.35,
            Anywhere,
            "The application answered with a server error.",
        ),
        rule(
            "unexpected_status",
            AppBug,
            r"(?i)expected (?:status(?: code)?\W{0,3})?\d{3}\b.{0,40}\b\d{3}\b|\b[1-5]\d\d != [1-5]\d\d\b",
            0.25,
            Failure,
            "The application returned an unexpected HTTP status.",
        ),
        rule(
            "glue_exception",
            TestBug,
            r"\b(?:TypeError|AttributeError|NameError|KeyError|IndexError|ImportError|ModuleNotFoundError|UnboundLocalError|SyntaxError|ValueError)\b",
            0.50,
            Failure,
            "The step implementation itself raised a programming error.",
        ),
        rule(
            "undefined_step",
            TestBug,
            r"(?i)undefined step|step (?:is )?not implemented|NotImplementedError",
            0.50,
            Failure,
            "A step has no matching implementation.",
        ),
        rule(
            "context_attribute",
            TestBug,
            r"(?i)'Context' object has no attribute",
            0.30,
            Failure,
            "A step reads state that an earlier step or hook never set.",
        ),
        rule(
            "glue_frame",
            TestBug,
            r#"File "[^"]*steps/[^"]+\.py""#,
            0.15,
            Failure,
            "The traceback ends inside step-definition code.",
        ),
        rule(
            "connection_failure",
            Environment,
            r"(?i)connection refused|ECONNREFUSED|failed to establish a new connection|max retries exceeded|name or service not known|getaddrinfo|net::ERR_|ConnectionError",
            0.60,
            Anywhere,
            "The application or a dependency was unreachable.",
        ),
        rule(
            "missing_config",
            Environment,
            r"(?i)(?:environment variable|env var|setting)\s+\S+\s+(?:is\s+)?(?:not set|missing|required)|KeyError: '(?:BASE_URL|API_BASE_URL|BROWSER|ADMIN_\w+)'",
            0.60,
            Anywhere,
            "Required configuration is missing from the environment.",
        ),
        rule(
            "browser_launch",
            Environment,
            r"(?i)executable doesn't exist|browserType\.launch|playwright install|chromedriver|failed to launch",
            0.50,
            Anywhere,
            "The browser could not be started.",
        ),
        rule(
            "tls_failure",
            Environment,
            r"(?i)certificate verify failed|SSLError|ssl: ",
            0.40,
            Anywhere,
            "A TLS handshake failed.",
        ),
    ]
}

#[derive(Debug, Clone)]
struct CompiledRule {
    def: RuleSpec,
    regex: Regex,
}

/// One fired rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleHit {
    pub rule: &'static str,
    pub category: FailureCategory,
    pub weight: f64,
    /// The line that fired the rule.
    pub excerpt: String,
    #[serde(skip)]
    pub cause: &'static str,
}

impl RuleHit {
    #[must_use]
    pub fn evidence(&self) -> String {
        format!("[{}] {}", self.rule, self.excerpt)
    }
}

/// Outcome of running the table over one failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub category: FailureCategory,
    pub confidence: f64,
    pub likely_cause: String,
    pub hits: Vec<RuleHit>,
    pub scores: BTreeMap<FailureCategory, f64>,
}

/// Texts a diagnosis looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evidence<'a> {
    pub error: &'a str,
    pub failed_step: &'a str,
    pub logs: &'a [String],
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<CompiledRule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        let rules = builtin_rules()
            .into_iter()
            .filter_map(|def| match Regex::new(def.pattern) {
                Ok(regex) => Some(CompiledRule { def, regex }),
                Err(err) => {
                    eprintln!("[TRG-ANALYSIS] dropping rule {}: {err}", def.name);
                    None
                }
            })
            .collect();
        Self { rules }
    }
}

fn excerpt_of(text: &str, start: usize) -> String {
    let bytes = text.as_bytes();
    let line_start = memchr::memrchr(b'\n', &bytes[..start]).map_or(0, |i| i + 1);
    let line_end = memchr::memchr(b'\n', &bytes[start..]).map_or(text.len(), |i| start + i);
    let line = text[line_start..line_end].trim();
    if line.chars().count() > EXCERPT_CHARS {
        let cut: String = line.chars().take(EXCERPT_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

impl RuleTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule and pick a category.
    #[must_use]
    pub fn evaluate(&self, evidence: &Evidence<'_>) -> Verdict {
        let failure_text = format!("{}\n{}", evidence.failed_step, evidence.error);
        let log_text = evidence.logs.join("\n");

        let mut hits = Vec::new();
        for rule in &self.rules {
            let found = rule
                .regex
                .find(&failure_text)
                .map(|m| excerpt_of(&failure_text, m.start()))
                .or_else(|| match rule.def.scope {
                    Scope::Anywhere => rule
                        .regex
                        .find(&log_text)
                        .map(|m| excerpt_of(&log_text, m.start())),
                    Scope::Failure => None,
                });
            if let Some(excerpt) = found {
                hits.push(RuleHit {
                    rule: rule.def.name,
                    category: rule.def.category,
                    weight: rule.def.weight,
                    excerpt,
                    cause: rule.def.cause,
                });
            }
        }

        let mut scores: BTreeMap<FailureCategory, f64> = BTreeMap::new();
        for hit in &hits {
            *scores.entry(hit.category).or_insert(0.0) += hit.weight;
        }
        for score in scores.values_mut() {
            *score = score.clamp(0.0, 1.0);
        }

        // BTreeMap iterates in declaration order; strict `>` keeps the first on ties.
        let best = scores.iter().fold(None, |best: Option<(FailureCategory, f64)>, (&c, &s)| {
            match best {
                Some((_, top)) if s <= top => best,
                _ => Some((c, s)),
            }
        });

        match best {
            Some((category, confidence)) => {
                let likely_cause = hits
                    .iter()
                    .filter(|h| h.category == category)
                    .fold(None::<&RuleHit>, |top, h| match top {
                        Some(t) if t.weight >= h.weight => Some(t),
                        _ => Some(h),
                    })
                    .map_or_else(String::new, |h| h.cause.to_string());
                Verdict {
                    category,
                    confidence: round3(confidence),
                    likely_cause,
                    hits,
                    scores,
                }
            }
            None => Verdict {
                category: FailureCategory::AppBug,
                confidence: FALLBACK_CONFIDENCE,
                likely_cause: "No known failure signature matched; treat as a possible application defect and inspect the error and logs.".to_string(),
                hits,
                scores,
            },
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(error: &str) -> Verdict {
        RuleTable::default().evaluate(&Evidence {
            error,
            failed_step: "",
            logs: &[],
        })
    }

    #[test]
    fn every_builtin_rule_compiles() {
        assert_eq!(RuleTable::default().len(), builtin_rules().len());
    }

    #[test]
    fn locator_timeout_is_a_selector_change() {
        let v = verdict(
            "playwright._impl._errors.TimeoutError: Locator.click: Timeout 30000ms exceeded.\n\
             Call log:\n  - waiting for locator(\"#submit-btn\")",
        );
        assert_eq!(v.category, FailureCategory::SelectorChanged);
        assert!(v.scores[&FailureCategory::SelectorChanged] > v.scores[&FailureCategory::TimingIssue]);
    }

    #[test]
    fn bare_timeout_is_timing() {
        let v = verdict("TimeoutError: page.wait_for_load_state: Timeout 10000ms exceeded. waiting for load state");
        assert_eq!(v.category, FailureCategory::TimingIssue);
        assert!((v.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn assertion_is_app_bug() {
        let v = verdict("AssertionError: Expected status 200, got 500");
        assert_eq!(v.category, FailureCategory::AppBug);
        assert!(v.hits.iter().any(|h| h.rule == "assertion_mismatch"));
    }

    #[test]
    fn glue_type_error_is_test_bug() {
        let v = verdict(
            "Traceback (most recent call last):\n  File \"steps/api_steps.py\", line 40, in step_impl\n\
             TypeError: unsupported operand type(s) for +: 'int' and 'str'",
        );
        assert_eq!(v.category, FailureCategory::TestBug);
        assert!((v.confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn connection_refused_in_logs_is_environment() {
        let logs = vec!["requests.exceptions.ConnectionError: Connection refused".to_string()];
        let v = RuleTable::default().evaluate(&Evidence {
            error: "something failed",
            failed_step: "Given the API is up",
            logs: &logs,
        });
        assert_eq!(v.category, FailureCategory::Environment);
        assert!(v.hits[0].evidence().contains("Connection refused"));
    }

    #[test]
    fn unknown_signature_falls_back() {
        let v = verdict("the moon is made of cheese");
        assert_eq!(v.category, FailureCategory::AppBug);
        assert!((v.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
        assert!(v.hits.is_empty());
    }

    #[test]
    fn confidence_is_clamped() {
        let v = verdict(
            "NoSuchElementException: no such element: Unable to locate element: \
             {\"method\":\"css selector\",\"selector\":\"#x\"} strict mode violation \
             waiting for locator stale element reference",
        );
        assert!(v.confidence <= 1.0);
        assert!(v.scores.values().all(|s| (0.0..=1.0).contains(s)));
    }
}
