//! Line-oriented extraction of feature names, scenarios, and tags.
//!
//! Only what listing and coverage need: tag lines, the `Feature:` header,
//! and `Scenario:` / `Scenario Outline:` headers. Steps, tables, and doc
//! strings are skipped.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::core::errors::{Result, TriageError};

const SCENARIO_KEYWORDS: [&str; 3] = ["Scenario:", "Scenario Outline:", "Scenario Template:"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioOutline {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureFile {
    pub name: String,
    pub tags: Vec<String>,
    pub scenarios: Vec<ScenarioOutline>,
    /// Path relative to the project root.
    pub path: String,
}

/// Parse feature text. `fallback_name` is used when there is no
/// `Feature:` header.
#[must_use]
pub fn parse_feature_text(text: &str, fallback_name: &str, path: String) -> FeatureFile {
    let mut feature_name: Option<String> = None;
    let mut feature_tags = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut scenarios = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            pending.extend(line.split_whitespace().map(str::to_string));
            continue;
        }
        if let Some(rest) = line.strip_prefix("Feature:") {
            feature_name = Some(rest.trim().to_string());
            feature_tags = std::mem::take(&mut pending);
            continue;
        }
        if let Some(rest) = SCENARIO_KEYWORDS
            .iter()
            .find_map(|kw| line.strip_prefix(kw))
        {
            scenarios.push(ScenarioOutline {
                name: rest.trim().to_string(),
                tags: std::mem::take(&mut pending),
            });
            continue;
        }
        // Tags only bind to the header directly below them.
        pending.clear();
    }

    FeatureFile {
        name: feature_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_name.to_string()),
        tags: feature_tags,
        scenarios,
        path,
    }
}

/// Read and parse one `.feature` file.
pub fn parse_feature_file(path: &Path, project_root: &Path) -> Result<FeatureFile> {
    let text = fs::read_to_string(path).map_err(|e| TriageError::io(path, e))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = path
        .strip_prefix(project_root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    Ok(parse_feature_text(&text, &stem, relative))
}
