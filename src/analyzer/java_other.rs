//! Analysis for Play and otherwise-unclassified Java builds.

use once_cell::sync::Lazy;
use regex::Regex;

use super::base::get_job_lines;
use super::folds::Folds;
use super::report::{strip_ansi, AnalysisReport};

pub const ANALYZER: &str = "java-other";

static RUN_RESULTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(Passed|Failed): Total (\d+), Failed (\d+), Errors (\d+), Passed (\d+)(, Skipped (\d+))?")
        .unwrap()
});
static NUM_FAILED_TESTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tests run: (\d+), Failures: (\d+)").unwrap());
static NUM_PASSED_TESTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"OK \((\d+) tests\)").unwrap());
static FAILED_TEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\] Test (.+) failed:").unwrap());
static FAILED_TESTS_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"Failed tests:").unwrap());
static INDENTED_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t(.*)").unwrap());
static PLAY_TOTAL_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total time: (\d+) s, completed .*").unwrap());
static BUILD_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Build time: (\d+):(\d+):(\d+)").unwrap());

pub fn analyze(folds: &Folds, build_system: &str, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();
    report.build_system = Some(build_system.to_string());
    report.did_tests_fail = Some(false);

    // Everything is potentially test related here; there is no reliable
    // section marker.
    let test_lines: Vec<String> = get_job_lines(folds).map(|l| strip_ansi(l)).collect();
    analyze_tests(&test_lines, report);

    if report.default_did_tests_fail() {
        report.did_tests_fail = Some(true);
    }
}

fn analyze_tests(test_lines: &[String], report: &mut AnalysisReport) {
    let mut failed_tests_started = false;
    let mut tests_failed_lines: Vec<String> = Vec::new();

    for line in test_lines {
        if let Some(caps) = RUN_RESULTS.captures(line) {
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            *report.num_tests_run.get_or_insert(0) += caps[2].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) +=
                caps[3].parse::<i64>().unwrap_or(0) + caps[4].parse::<i64>().unwrap_or(0);
            if caps.get(6).is_some() {
                *report.num_tests_skipped.get_or_insert(0) += caps[7].parse().unwrap_or(0);
            }
            continue;
        } else if let Some(caps) = NUM_FAILED_TESTS.captures(line) {
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) += caps[2].parse().unwrap_or(0);
            continue;
        } else if let Some(caps) = NUM_PASSED_TESTS.captures(line) {
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            continue;
        } else if let Some(caps) = FAILED_TEST.captures(line) {
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            report.tests_failed.push(caps[1].to_string());
        }

        if !failed_tests_started && FAILED_TESTS_HEADER.is_match(line) {
            report.did_tests_fail = Some(true);
            failed_tests_started = true;
            continue;
        }
        if failed_tests_started {
            if let Some(caps) = INDENTED_NAME.captures(line) {
                tests_failed_lines.push(caps[1].to_string());
            } else {
                failed_tests_started = false;
            }
        }

        if let Some(caps) = PLAY_TOTAL_TIME.captures(line) {
            failed_tests_started = false;
            report.test_duration = Some(caps[1].parse().unwrap_or(0.0));
        } else if let Some(caps) = BUILD_TIME.captures(line) {
            failed_tests_started = false;
            let hrs: f64 = caps[1].parse().unwrap_or(0.0);
            let mins: f64 = caps[2].parse().unwrap_or(0.0);
            let secs: f64 = caps[3].parse().unwrap_or(0.0);
            report.test_duration = Some(hrs * 3600.0 + mins * 60.0 + secs);
        }
    }

    if !tests_failed_lines.is_empty() && report.tests_failed.is_empty() {
        for line in &tests_failed_lines {
            report.tests_failed.push(format!("({})", line));
        }
    }
    report.uninit_ok_tests();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::folds::split_gha;

    fn analyze_log(text: &str) -> AnalysisReport {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let folds = split_gha(&lines, &[]);
        let mut report = AnalysisReport::new("1", "plain");
        analyze(&folds, "play", &mut report);
        report
    }

    #[test]
    fn test_play_summary() {
        let log = "Failed: Total 23, Failed 2, Errors 0, Passed 21\n\
                   Failed tests:\n\
                   \tcontrollers.ApplicationSpec\n\
                   Total time: 120 s, completed Jan 1, 2020";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(23));
        assert_eq!(report.num_tests_failed, Some(2));
        assert_eq!(report.num_tests_ok, Some(21));
        assert_eq!(report.tests_failed, vec!["(controllers.ApplicationSpec)"]);
        assert_eq!(report.test_duration, Some(120.0));
        assert_eq!(report.did_tests_fail, Some(true));
        assert_eq!(report.build_system.as_deref(), Some("play"));
    }

    #[test]
    fn test_build_time_hms() {
        let log = "OK (12 tests)\nBuild time: 00:02:05";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(12));
        assert_eq!(report.test_duration, Some(125.0));
        assert_eq!(report.did_tests_fail, Some(false));
    }
}
