//! JavaScript build log analysis covering mocha (plain and karma-style
//! SUMMARY blocks) and jest.

use once_cell::sync::Lazy;
use regex::Regex;

use super::folds::{Folds, OUT_OF_FOLD};
use super::report::{strip_ansi, AnalysisReport};

pub const ANALYZER: &str = "javascript";

static MOCHA_FAILING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) failing$").unwrap());
static MOCHA_PASSING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) passing \((\d+)(\w+)\)$").unwrap());
static MOCHA_PENDING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) pending$").unwrap());
static SUMMARY_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^SUMMARY:$").unwrap());
static SUMMARY_PASS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) tests? completed$").unwrap());
static SUMMARY_SKIPPED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) tests? skipped$").unwrap());
static SUMMARY_FAILED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) tests? failed$").unwrap());
static SUMMARY_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Finished in (\d*\.?\d*) secs").unwrap());
static SUMMARY_FAILED_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^FAILED TESTS:$").unwrap());
static MOCHA_TEST_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\s+)(\d+)\) (.*)(:)?").unwrap());
static MOCHA_NAME_CONTINUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\s+)(.*)(:)?").unwrap());
static MOCHA_SUMMARY_TEST_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\s+)\u{2716}\s(.*)").unwrap());
static JEST_TESTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests:\s+(\d+ failed, )?(\d+ skipped, )?(\d+ passed, )?(\d+ total)").unwrap()
});
static JEST_FAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"FAIL\s+(.*)").unwrap());
static JEST_PASS: Lazy<Regex> = Lazy::new(|| Regex::new(r"PASS\s+(.*)").unwrap());
static JEST_SUMMARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"Summary of all failing tests").unwrap());
static JEST_FAILING_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\u{25CF}\s(.*)").unwrap());
static JEST_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Time:(\s+)(\d*\.?\d*)s(ecs)?$").unwrap());
static INT_IN_STR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

fn convert_time_to_sec(time: i64, units: &str) -> f64 {
    match units {
        "ms" => time as f64 / 1000.0,
        "m" => time as f64 * 60.0,
        _ => time as f64,
    }
}

fn int_from_match(text: &str) -> i64 {
    INT_IN_STR
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn setup_tests(report: &mut AnalysisReport) {
    if !report.tests_initialized() {
        report.init_tests();
        report.tests_run = true;
        report.did_tests_fail = Some(false);
    }
}

pub fn analyze(folds: &Folds, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();
    extract_test_failures(folds, report);
    if report.did_tests_fail.is_none() {
        report.did_tests_fail = Some(report.default_did_tests_fail());
    }
}

/// Mocha failing-test names span multiple indented lines; names accrete
/// until a `:` ends the current one.
fn analyze_test_line(
    line: &str,
    mut current_name: String,
    mut start: bool,
    report: &mut AnalysisReport,
) -> (bool, String) {
    if let Some(caps) = MOCHA_TEST_NAME.captures(line) {
        start = true;
        current_name.push_str(&caps[3]);
    } else if start && MOCHA_NAME_CONTINUATION.is_match(line) {
        if let Some(caps) = MOCHA_NAME_CONTINUATION.captures(line) {
            current_name.push(' ');
            current_name.push_str(&caps[2]);
        }
    } else if let Some(caps) = MOCHA_SUMMARY_TEST_NAME.captures(line) {
        report.tests_failed.push(caps[2].to_string());
    }

    if line.contains(':') && !current_name.is_empty() {
        start = false;
        report.tests_failed.push(current_name);
        current_name = String::new();
    }

    (start, current_name)
}

fn extract_test_failures(folds: &Folds, report: &mut AnalysisReport) {
    let mut jest_test_failures_started = false;
    let mut mocha_test_failures_started = false;
    let mut start_name = false;
    let mut current_name = String::new();
    let mut has_summary = false;
    let mut summary_time = 0.0;

    for raw in &folds[OUT_OF_FOLD].content {
        let line = strip_ansi(raw);

        if let Some(caps) = MOCHA_FAILING.captures(&line) {
            report.did_tests_fail = Some(true);
            let failing: i64 = caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) += failing;
            *report.num_tests_run.get_or_insert(0) += failing;
            mocha_test_failures_started = true;
            continue;
        } else if let Some(caps) = MOCHA_PASSING.captures(&line) {
            setup_tests(report);
            report.add_framework("mocha");
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            let time: i64 = caps[2].parse().unwrap_or(0);
            *report.test_duration.get_or_insert(0.0) += convert_time_to_sec(time, &caps[3]);
        } else if let Some(caps) = MOCHA_PENDING.captures(&line) {
            *report.num_tests_skipped.get_or_insert(0) += caps[1].parse().unwrap_or(0);
        }

        if SUMMARY_HEADER.is_match(&line) {
            has_summary = true;
            setup_tests(report);
            *report.test_duration.get_or_insert(0.0) += summary_time;
            summary_time = 0.0;
            report.add_framework("mocha");
        }

        if let Some(caps) = SUMMARY_PASS.captures(&line) {
            if has_summary {
                *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            }
        } else if let Some(caps) = SUMMARY_SKIPPED.captures(&line) {
            if has_summary {
                *report.num_tests_skipped.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            }
        } else if let Some(caps) = SUMMARY_FAILED.captures(&line) {
            if has_summary {
                report.did_tests_fail = Some(true);
                let failed: i64 = caps[1].parse().unwrap_or(0);
                *report.num_tests_failed.get_or_insert(0) += failed;
                *report.num_tests_run.get_or_insert(0) += failed;
            }
        } else if let Some(caps) = SUMMARY_TIME.captures(&line) {
            summary_time += caps[1].parse::<f64>().unwrap_or(0.0);
        } else if SUMMARY_FAILED_HEADER.is_match(&line) && has_summary {
            mocha_test_failures_started = true;
        }

        if mocha_test_failures_started
            && (report.tests_failed.len() as i64) < report.num_tests_failed.unwrap_or(0)
        {
            let (s, n) = analyze_test_line(&line, current_name, start_name, report);
            start_name = s;
            current_name = n;
        }

        // ---- jest ----

        if let Some(caps) = JEST_TESTS.captures(&line) {
            if let Some(total) = caps.get(4) {
                report.add_framework("jest");
                if int_from_match(total.as_str()) == 0 {
                    report.tests_failed.clear();
                    continue;
                }
            }
            setup_tests(report);
            if let Some(failed) = caps.get(1) {
                report.did_tests_fail = Some(true);
                let jest_failed = int_from_match(failed.as_str());
                *report.num_tests_failed.get_or_insert(0) += jest_failed;
                *report.num_tests_run.get_or_insert(0) += jest_failed;
            }
            if let Some(skipped) = caps.get(2) {
                *report.num_tests_skipped.get_or_insert(0) += int_from_match(skipped.as_str());
            }
            if let Some(passed) = caps.get(3) {
                *report.num_tests_run.get_or_insert(0) += int_from_match(passed.as_str());
            }
        }

        if let Some(caps) = JEST_TIME.captures(&line) {
            if report.tests_run {
                *report.test_duration.get_or_insert(0.0) += caps[2].parse::<f64>().unwrap_or(0.0);
            }
        }

        if JEST_SUMMARY.is_match(&line) || JEST_PASS.is_match(&line) {
            jest_test_failures_started = false;
        }
        if JEST_FAIL.is_match(&line) {
            jest_test_failures_started = true;
        }
        if jest_test_failures_started {
            if let Some(caps) = JEST_FAILING_NAME.captures(&line) {
                let name = caps[1].to_string();
                if !report.tests_failed.contains(&name) {
                    report.tests_failed.push(name);
                }
            }
        }
    }

    report.uninit_ok_tests();
}
