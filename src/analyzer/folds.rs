use chrono::DateTime;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// The distinguished fold holding every line outside an explicit group.
pub const OUT_OF_FOLD: &str = "out_of_fold";

static TRAVIS_FOLD_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"travis_fold:start:([\w.]*)").unwrap());
static TRAVIS_FOLD_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"travis_fold:end:([\w.]*)").unwrap());
static TRAVIS_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"travis_time:.*?,duration=(\d*)").unwrap());
static GHA_GROUP_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"##\[group\](.*)").unwrap());
static GHA_GROUP_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"##\[endgroup\]").unwrap());
static GHA_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{7}Z ").unwrap());

/// A named slice of a build log with an optional duration in seconds.
#[derive(Debug, Clone, Default)]
pub struct Fold {
    pub content: Vec<String>,
    pub duration: Option<f64>,
}

/// Ordered map of fold name to fold, preserving first-appearance order.
/// `out_of_fold` is always present.
pub type Folds = IndexMap<String, Fold>;

/// Reads a log into lines, stripping a leading UTF-8 BOM and, when the first
/// line carries the 29-character GitHub timestamp prefix, splitting the
/// prefix off every line into a parallel array for duration math.
pub fn read_log_into_lines(text: &str) -> (Vec<String>, Vec<String>) {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let lines: Vec<&str> = text.lines().collect();
    if let Some(first) = lines.first() {
        if GHA_TIMESTAMP.is_match(first) {
            let mut time_lines = Vec::with_capacity(lines.len());
            let mut stripped = Vec::with_capacity(lines.len());
            for line in &lines {
                // The prefix is fixed-width; short lines (rare truncation)
                // contribute what they have.
                let cut = line.char_indices().nth(26).map(|(i, _)| i).unwrap_or(line.len());
                time_lines.push(line[..cut.min(line.len())].to_string());
                let body = line.char_indices().nth(29).map(|(i, _)| i).unwrap_or(line.len());
                stripped.push(line[body.min(line.len())..].to_string());
            }
            return (stripped, time_lines);
        }
    }

    (lines.iter().map(|l| l.to_string()).collect(), Vec::new())
}

/// Split a Travis log into folds.
///
/// `travis_fold:start:<name>` opens a fold, `travis_fold:end:<name>` closes
/// back to `out_of_fold`, and `travis_time:` lines attach a rounded-seconds
/// duration to the current fold.
pub fn split_travis(lines: &[String]) -> Folds {
    let mut folds: Folds = IndexMap::new();
    folds.insert(OUT_OF_FOLD.to_string(), Fold::default());
    let mut current_fold = OUT_OF_FOLD.to_string();

    for line in lines {
        if let Some(caps) = TRAVIS_FOLD_START.captures(line) {
            current_fold = caps[1].to_string();
            continue;
        }
        if TRAVIS_FOLD_END.is_match(line) {
            current_fold = OUT_OF_FOLD.to_string();
            continue;
        }

        let fold = folds.entry(current_fold.clone()).or_default();

        if let Some(caps) = TRAVIS_TIME.captures(line) {
            if let Ok(nanos) = caps[1].parse::<f64>() {
                fold.duration = Some((nanos / 1e9).round());
            }
            continue;
        }
        fold.content.push(line.clone());
    }
    folds
}

/// Split a GitHub Actions log into folds.
///
/// `##[group]<title>` opens, `##[endgroup]` closes. When a parallel
/// timestamp array is present (same length as `lines`), each fold's duration
/// is the delta between its start timestamp and the next fold's start.
pub fn split_gha(lines: &[String], time_lines: &[String]) -> Folds {
    let mut folds: Folds = IndexMap::new();
    folds.insert(OUT_OF_FOLD.to_string(), Fold::default());
    let mut current_fold = OUT_OF_FOLD.to_string();

    let have_times = !time_lines.is_empty() && time_lines.len() == lines.len();
    let mut start_time: Option<f64> = None;
    let mut previous_group: Option<String> = None;

    for (line_number, line) in lines.iter().enumerate() {
        if let Some(caps) = GHA_GROUP_START.captures(line) {
            current_fold = caps[1].to_string();
            folds.entry(current_fold.clone()).or_default();

            if have_times {
                if let Some(end) = parse_timestamp(&time_lines[line_number]) {
                    if let (Some(start), Some(prev)) = (start_time, previous_group.as_ref()) {
                        if let Some(fold) = folds.get_mut(prev) {
                            fold.duration = Some(round2(end - start));
                        }
                    }
                    start_time = Some(end);
                    previous_group = Some(current_fold.clone());
                }
            }
            continue;
        }
        if GHA_GROUP_END.is_match(line) {
            current_fold = OUT_OF_FOLD.to_string();
            continue;
        }
        folds
            .entry(current_fold.clone())
            .or_default()
            .content
            .push(line.clone());
    }

    // The last group runs until the final line.
    if have_times {
        if let (Some(start), Some(prev)) = (start_time, previous_group.as_ref()) {
            if let Some(last) = time_lines.last().and_then(|t| parse_timestamp(t)) {
                if let Some(fold) = folds.get_mut(prev) {
                    if fold.duration.is_none() {
                        fold.duration = Some(round2(last - start));
                    }
                }
            }
        }
    }

    folds
}

/// True when the log carries GitHub's per-line timestamp prefix, which is
/// how the dispatcher tells the two dialects apart.
pub fn is_gha_log(text: &str) -> bool {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.lines().next().is_some_and(|l| GHA_TIMESTAMP.is_match(l))
}

fn parse_timestamp(prefix: &str) -> Option<f64> {
    // Prefix is `2022-05-09T15:18:04.1058603` (trailing Z and space removed
    // by the 26-char cut). Re-append the zone for parsing.
    let with_zone = format!("{}Z", prefix.trim());
    DateTime::parse_from_rfc3339(&with_zone)
        .ok()
        .map(|dt| dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_travis_fold_boundaries() {
        let log = lines(
            "before\n\
             travis_fold:start:system_info\n\
             Build language: java\n\
             travis_fold:end:system_info\n\
             after",
        );
        let folds = split_travis(&log);
        assert_eq!(folds[OUT_OF_FOLD].content, vec!["before", "after"]);
        assert_eq!(folds["system_info"].content, vec!["Build language: java"]);
    }

    #[test]
    fn test_travis_duration_rounds_nanoseconds() {
        let log = lines(
            "travis_fold:start:install\n\
             travis_time:end:0aa,start=1,finish=2,duration=2499999999\n\
             done\n\
             travis_fold:end:install",
        );
        let folds = split_travis(&log);
        assert_eq!(folds["install"].duration, Some(2.0));
        assert_eq!(folds["install"].content, vec!["done"]);
    }

    #[test]
    fn test_travis_every_line_belongs_to_exactly_one_fold() {
        let log = lines(
            "a\ntravis_fold:start:x\nb\ntravis_fold:end:x\nc\n\
             travis_fold:start:y\nd\ntravis_fold:end:y",
        );
        let folds = split_travis(&log);
        let total: usize = folds.values().map(|f| f.content.len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_gha_group_split() {
        let log = lines(
            "Requested labels: ubuntu-18.04\n\
             ##[group]Run actions/setup-java@v2\n\
             java setup output\n\
             ##[endgroup]\n\
             trailing",
        );
        let folds = split_gha(&log, &[]);
        assert_eq!(
            folds[OUT_OF_FOLD].content,
            vec!["Requested labels: ubuntu-18.04", "trailing"]
        );
        assert_eq!(
            folds["Run actions/setup-java@v2"].content,
            vec!["java setup output"]
        );
    }

    #[test]
    fn test_gha_durations_from_timestamps() {
        let raw = "2022-05-09T15:18:04.1058603Z ##[group]Set up job\n\
                   2022-05-09T15:18:05.1058603Z setup line\n\
                   2022-05-09T15:18:10.1058603Z ##[group]Run ./gradlew build\n\
                   2022-05-09T15:18:14.1058603Z build line";
        let (lines, time_lines) = read_log_into_lines(raw);
        assert_eq!(lines.len(), 4);
        assert_eq!(time_lines.len(), 4);
        assert_eq!(lines[0], "##[group]Set up job");

        let folds = split_gha(&lines, &time_lines);
        assert_eq!(folds["Set up job"].duration, Some(6.0));
        // Last fold: delta to last line timestamp.
        assert_eq!(folds["Run ./gradlew build"].duration, Some(4.0));
    }

    #[test]
    fn test_bom_is_stripped() {
        let raw = "\u{feff}2022-05-09T15:18:04.1058603Z first line";
        let (lines, time_lines) = read_log_into_lines(raw);
        assert_eq!(lines, vec!["first line"]);
        assert_eq!(time_lines.len(), 1);
        assert!(is_gha_log(raw));
    }

    #[test]
    fn test_plain_log_has_no_time_lines() {
        let (lines, time_lines) = read_log_into_lines("plain travis output\nsecond");
        assert_eq!(lines.len(), 2);
        assert!(time_lines.is_empty());
        assert!(!is_gha_log("plain travis output"));
    }
}
