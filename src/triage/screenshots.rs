//! Screenshot lookup for a failed scenario.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

const SLUG_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotMatch {
    /// File name carries the scenario slug, or the run id of a run that
    /// left a single screenshot.
    Exact,
    /// Best effort: newest shot of the run, else newest in the directory.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenshotRef {
    pub path: PathBuf,
    #[serde(rename = "screenshot_match")]
    pub matched: ScreenshotMatch,
    pub size_bytes: u64,
}

/// Lowercase, non-alphanumerics folded to `_`.
fn fold(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// File-name slug for a scenario: folded and cut to 30 characters.
#[must_use]
pub fn scenario_slug(name: &str) -> String {
    fold(name).chars().take(SLUG_LEN).collect()
}

/// Find the screenshot for a scenario in `dir`.
///
/// A scenario-name match wins, newest first. A run-id match is exact only
/// when it is the run's sole screenshot; several run-id matches yield the
/// newest as a fallback, as does a directory with no match at all. A
/// missing or empty directory yields `None`.
#[must_use]
pub fn find_screenshot(dir: &Path, scenario_name: &str, run_id: Option<&str>) -> Option<ScreenshotRef> {
    let mut shots: Vec<(PathBuf, SystemTime, u64)> = fs::read_dir(dir)
        .ok()?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        })
        .filter_map(|p| {
            let meta = p.metadata().ok()?;
            meta.is_file().then(|| {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                (p, modified, meta.len())
            })
        })
        .collect();
    shots.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let slug = scenario_slug(scenario_name);
    let run_key = run_id.map(fold);
    let stem_of = |path: &Path| {
        path.file_stem()
            .map(|s| fold(&s.to_string_lossy()))
            .unwrap_or_default()
    };

    let by_name = shots
        .iter()
        .find(|(p, _, _)| !slug.is_empty() && stem_of(p).contains(&slug));
    let by_run: Vec<_> = shots
        .iter()
        .filter(|(p, _, _)| run_key.as_deref().is_some_and(|k| stem_of(p).contains(k)))
        .collect();

    // A run id alone only identifies the scenario when the run left one shot.
    let (chosen, matched) = match (by_name, by_run.as_slice()) {
        (Some(hit), _) => (hit, ScreenshotMatch::Exact),
        (None, [only]) => (*only, ScreenshotMatch::Exact),
        (None, [newest, ..]) => (*newest, ScreenshotMatch::Fallback),
        (None, []) => (shots.first()?, ScreenshotMatch::Fallback),
    };
    Some(ScreenshotRef {
        path: chosen.0.clone(),
        matched,
        size_bytes: chosen.2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};

    fn shot(dir: &Path, name: &str, secs: i64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"\x89PNG").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000 + secs, 0)).unwrap();
        path
    }

    #[test]
    fn slug_folds_and_truncates() {
        assert_eq!(scenario_slug("Login - happy path!"), "login___happy_path_");
        assert_eq!(scenario_slug(&"a".repeat(50)).len(), 30);
    }

    #[test]
    fn exact_match_beats_newer_files() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = shot(dir.path(), "failure_Login_-_happy_path_20260101.png", 1);
        shot(dir.path(), "failure_Other_20260102.png", 5);
        let found = find_screenshot(dir.path(), "Login - happy path", None).unwrap();
        assert_eq!(found.path, wanted);
        assert_eq!(found.matched, ScreenshotMatch::Exact);
    }

    #[test]
    fn run_id_in_name_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = shot(dir.path(), "run_20260101_000000_000_ab12_step.png", 1);
        shot(dir.path(), "unrelated.png", 9);
        let found =
            find_screenshot(dir.path(), "Something", Some("run_20260101_000000_000_ab12")).unwrap();
        assert_eq!(found.path, wanted);
        assert_eq!(found.matched, ScreenshotMatch::Exact);
    }

    #[test]
    fn scenario_name_beats_newer_shot_of_the_same_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = "run_20260101_000000_000_ab12";
        let checkout = shot(dir.path(), &format!("{run}_checkout_fails.png"), 1);
        let login = shot(dir.path(), &format!("{run}_login_fails.png"), 2);

        let found = find_screenshot(dir.path(), "Checkout fails", Some(run)).unwrap();
        assert_eq!(found.path, checkout);
        assert_eq!(found.matched, ScreenshotMatch::Exact);

        let found = find_screenshot(dir.path(), "Login fails", Some(run)).unwrap();
        assert_eq!(found.path, login);
        assert_eq!(found.matched, ScreenshotMatch::Exact);
    }

    #[test]
    fn shared_run_id_is_not_exact() {
        let dir = tempfile::tempdir().unwrap();
        let run = "run_20260101_000000_000_ab12";
        shot(dir.path(), &format!("{run}_checkout_fails.png"), 1);
        let newest = shot(dir.path(), &format!("{run}_login_fails.png"), 2);
        shot(dir.path(), "other_run.png", 0);

        let found = find_screenshot(dir.path(), "Search works", Some(run)).unwrap();
        assert_eq!(found.path, newest);
        assert_eq!(found.matched, ScreenshotMatch::Fallback);
    }

    #[test]
    fn falls_back_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        shot(dir.path(), "a.png", 1);
        let newest = shot(dir.path(), "b.png", 2);
        fs::write(dir.path().join("c.txt"), "no").unwrap();
        let found = find_screenshot(dir.path(), "Checkout", None).unwrap();
        assert_eq!(found.path, newest);
        assert_eq!(found.matched, ScreenshotMatch::Fallback);
    }

    #[test]
    fn missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_screenshot(&dir.path().join("nope"), "x", None).is_none());
        assert!(find_screenshot(dir.path(), "x", None).is_none());
    }
}
