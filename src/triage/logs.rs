//! Bounded log extraction around a failure, with secret masking.

#![allow(missing_docs)]

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;

static TIMESTAMP_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})[ T](\d{2}:\d{2}:\d{2})").ok());

/// (pattern, replacement) pairs applied in order.
static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r#"(?i)"password"\s*:\s*"[^"]*""#, r#""password": "***""#),
        (r#"(?i)"token"\s*:\s*"[^"]*""#, r#""token": "***""#),
        (r#"(?i)"authorization"\s*:\s*"[^"]*""#, r#""authorization": "***""#),
        (r#"(?i)"cookie"\s*:\s*"[^"]*""#, r#""cookie": "***""#),
        (r"(?i)bearer\s+\S+", "Bearer ***"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Replace credential-looking values with `***`.
#[must_use]
pub fn mask_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in SECRET_PATTERNS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, *replacement).into_owned();
        }
    }
    out
}

/// Where a context's log lines came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    OutputLog,
    RunTails,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogExtract {
    pub lines: Vec<String>,
    /// The byte cap dropped older content.
    pub truncated: bool,
    /// Lines were limited to the window around the anchor timestamp.
    pub windowed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LogExtractor {
    pub max_bytes: usize,
    pub window_secs: i64,
}

impl LogExtractor {
    /// Pick the lines relevant to a failure.
    ///
    /// `anchors` are tried in order; the last line mentioning the first
    /// anchor that appears at all fixes the failure's timestamp. With a
    /// timestamp, only lines within the window survive. Whatever remains is
    /// masked and cut to `max_bytes` from the front, keeping the tail.
    #[must_use]
    pub fn extract(&self, text: &str, anchors: &[&str]) -> LogExtract {
        let stamped = stamp_lines(text);

        let anchor_ts = anchors
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .find_map(|anchor| {
                stamped
                    .iter()
                    .rev()
                    .find(|(_, line)| line.to_lowercase().contains(&anchor))
            })
            .and_then(|(ts, _)| *ts);

        let (selected, windowed): (Vec<&str>, bool) = match anchor_ts {
            Some(anchor) => {
                let window = chrono::Duration::seconds(self.window_secs);
                let kept = stamped
                    .iter()
                    .filter(|(ts, _)| ts.is_some_and(|t| (t - anchor).abs() <= window))
                    .map(|(_, line)| *line)
                    .collect::<Vec<_>>();
                let windowed = kept.len() < stamped.len();
                (kept, windowed)
            }
            None => (stamped.iter().map(|(_, line)| *line).collect(), false),
        };

        let masked: Vec<String> = selected.into_iter().map(mask_secrets).collect();
        let (lines, truncated) = keep_tail(masked, self.max_bytes);
        LogExtract {
            lines,
            truncated,
            windowed,
        }
    }
}

/// Pair each line with its timestamp; unstamped lines inherit the previous one.
fn stamp_lines(text: &str) -> Vec<(Option<NaiveDateTime>, &str)> {
    let mut current = None;
    text.lines()
        .map(|line| {
            if let Some(ts) = parse_timestamp(line) {
                current = Some(ts);
            }
            (current, line)
        })
        .collect()
}

fn parse_timestamp(line: &str) -> Option<NaiveDateTime> {
    let caps = TIMESTAMP_RE.as_ref()?.captures(line)?;
    let raw = format!("{} {}", caps.get(1)?.as_str(), caps.get(2)?.as_str());
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S").ok()
}

/// Keep the newest lines whose newline-joined size fits in `max_bytes`.
/// A single oversized last line is cut from its front.
fn keep_tail(lines: Vec<String>, max_bytes: usize) -> (Vec<String>, bool) {
    let total = lines.len();
    let mut budget = max_bytes;
    let mut kept: Vec<String> = Vec::new();
    let mut cut_line = false;
    for mut line in lines.into_iter().rev() {
        let needed = line.len() + usize::from(!kept.is_empty());
        if needed <= budget {
            budget -= needed;
            kept.push(line);
            continue;
        }
        if kept.is_empty() && budget > 0 {
            let mut cut = line.len() - budget;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            line.drain(..cut);
            kept.push(line);
            cut_line = true;
        }
        break;
    }
    let truncated = cut_line || kept.len() < total;
    kept.reverse();
    (kept, truncated)
}
