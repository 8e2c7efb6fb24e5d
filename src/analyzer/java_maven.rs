//! Maven build log analysis.

use once_cell::sync::Lazy;
use regex::Regex;

use super::folds::{Folds, OUT_OF_FOLD};
use super::report::{strip_ansi, AnalysisReport};

pub const ANALYZER: &str = "java-maven";

static REACTOR_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[INFO\] Reactor Summary(:| for)").unwrap());
static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*\]").unwrap());
static TESTS_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r" T E S T S").unwrap());
static REACTOR_TEST_MODULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[INFO\] .*test.*? (\w+) \[ (.+)\]").unwrap());
static TOTAL_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Total time: (.+)").unwrap());
static MAVEN_SECONDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"((\d+)(\.\d*)?) s").unwrap());
static MAVEN_MINUTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+):(\d+) min").unwrap());
static TEST_METHOD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w+(\[.+\])?\([\w.$\[\]]+\))").unwrap());
static FAILED_TESTS_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Failed tests:)|(Tests in error:)").unwrap());
static SUMMARY_WITH_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tests run: .*? Time elapsed: (.* s(ec)?)").unwrap());
static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests run: (\d*), Failures: (\d*), Errors: (\d*)(, Skipped: (\d*))?").unwrap()
});
static TESTNG_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Total tests run: (\d+), Failures: (\d+), Skips: (\d+)").unwrap());
static CUCUMBER_SCENARIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"cucumber (.*) # Scenario:").unwrap());
static FAILURE_IN_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<< FAILURE! - in ([\w.]+)").unwrap());
static FAILURE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(<<< FAILURE!|<<< ERROR!)\s*$").unwrap());
static METHOD_TIME_ELAPSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\[ERROR\] )?(\w+)  Time elapsed:").unwrap());
static CLASS_TIME_ELAPSED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\[ERROR\] )?([\w.]+)  Time elapsed:").unwrap());

pub fn analyze(folds: &Folds, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();
    report.build_system = Some("Maven".to_string());

    let (test_lines, reactor_lines, tests_failed_lines) = extract_tests(folds, report);
    analyze_tests(&test_lines, report);
    get_offending_tests(&tests_failed_lines, report);
    analyze_reactor(&reactor_lines, report);
    extract_err_msg(report);
    if report.tests_failed.is_empty() {
        extract_failed_tests_from_tests_lines(&test_lines, report);
    }
    report.did_tests_fail = Some(report.default_did_tests_fail());
}

/// Walk out_of_fold once, splitting it into the surefire test section, the
/// reactor summary, and the block of lines after a `Failed tests:` header.
fn extract_tests(
    folds: &Folds,
    report: &mut AnalysisReport,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut test_lines = Vec::new();
    let mut reactor_lines = Vec::new();
    let mut tests_failed_lines = Vec::new();

    let mut test_section_started = false;
    let mut reactor_started = false;
    let mut failed_tests_started = false;
    // The `T E S T S` banner is flanked by separator lines; track where we
    // are inside that frame.
    let mut line_marker = 0;

    for raw in &folds[OUT_OF_FOLD].content {
        let line = strip_ansi(raw);

        if line.starts_with("[ERROR]") {
            report.err_lines.push(line.chars().skip(8).collect());
        }
        if line.contains("usr/local/bin/run.sh:") && line.contains("Killed") {
            report.err_msg.push(line.clone());
        }

        if FAILED_TESTS_HEADER.is_match(&line) {
            failed_tests_started = true;
        }
        if failed_tests_started {
            tests_failed_lines.push(line.clone());
            if line.trim().is_empty() {
                failed_tests_started = false;
            }
        }

        if line.contains("-------------------------------------------------------") && line_marker == 0
        {
            line_marker = 1;
        } else if REACTOR_SUMMARY.is_match(&line) {
            reactor_started = true;
            test_section_started = false;
        } else if reactor_started && !BRACKETED.is_match(&line) {
            reactor_started = false;
        } else if TESTS_HEADER.is_match(&line) && line_marker == 1 {
            line_marker = 2;
        } else if line_marker == 1 {
            line_marker = 0;
        } else if line.contains("-------------------------------------------------------")
            && line_marker == 2
        {
            line_marker = 3;
            test_section_started = true;
        } else if line.contains("-------------------------------------------------------")
            && line_marker == 3
        {
            line_marker = 0;
            test_section_started = false;
        } else {
            line_marker = 0;
        }

        if test_section_started {
            test_lines.push(line);
        } else if reactor_started {
            reactor_lines.push(line);
        }
    }

    (test_lines, reactor_lines, tests_failed_lines)
}

fn analyze_tests(test_lines: &[String], report: &mut AnalysisReport) {
    let mut running_test = false;
    let mut curr_test = String::new();

    for line in test_lines {
        if let Some(caps) = SUMMARY_WITH_TIME.captures(line) {
            report.init_tests();
            report.tests_run = true;
            report.add_framework("JUnit");
            *report.test_duration.get_or_insert(0.0) += convert_maven_time_to_seconds(&caps[1]);
            continue;
        }

        // Summary lines without a time suffix are the per-build totals; the
        // per-class `, Time elapsed:` lines were consumed above so they are
        // not double counted.
        if let Some(caps) = SUMMARY.captures(line) {
            running_test = false;
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            let run: i64 = caps[1].parse().unwrap_or(0);
            let failures: i64 = caps[2].parse().unwrap_or(0);
            let errors: i64 = caps[3].parse().unwrap_or(0);
            *report.num_tests_run.get_or_insert(0) += run;
            *report.num_tests_failed.get_or_insert(0) += failures + errors;
            if caps.get(4).is_some() {
                let skipped: i64 = caps[5].parse().unwrap_or(0);
                *report.num_tests_skipped.get_or_insert(0) += skipped;
            }
            continue;
        }

        if let Some(caps) = TESTNG_SUMMARY.captures(line) {
            report.init_tests();
            report.add_framework("testng");
            report.tests_run = true;
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) += caps[2].parse().unwrap_or(0);
            *report.num_tests_skipped.get_or_insert(0) += caps[3].parse().unwrap_or(0);
            continue;
        }

        if let Some(rest) = line.strip_prefix("Running ") {
            running_test = true;
            curr_test = rest.to_string();
        }
        if running_test && line.contains("(See full trace by running task with --trace)") {
            report.tests_failed.push(curr_test.clone());
        }

        if line.contains("exec rake cucumber") {
            report.add_framework("cucumber");
        }
        if let Some(caps) = CUCUMBER_SCENARIO.captures(line) {
            report.tests_failed.push(caps[1].to_string());
            continue;
        }
    }
    report.uninit_ok_tests();
}

fn get_offending_tests(tests_failed_lines: &[String], report: &mut AnalysisReport) {
    let mut has_indent = false;
    for line in tests_failed_lines {
        if line.starts_with("  ") {
            has_indent = true;
        }
        if has_indent && !line.starts_with("  ") {
            continue;
        }
        // Skip the totals line so 'run:'/'Failures:' are not matched as
        // test names.
        if line.contains("Tests run:") {
            continue;
        }
        if line.contains("Failed tests:") || line.contains("Tests in error:") {
            if let Some(tests) = line.split(':').nth(1) {
                let tests = tests.trim();
                if tests.len() > 1 {
                    if let Some(name) = extract_test_method_name(tests) {
                        report.tests_failed.push(name);
                    }
                }
            }
        } else if let Some(name) = extract_test_method_name(line) {
            report.tests_failed.push(name);
        }
    }
}

fn analyze_reactor(reactor_lines: &[String], report: &mut AnalysisReport) {
    // Subprojects whose name contains 'test' contribute their reactor time;
    // only the last build's Total time is used.
    let mut reactor_time = 0.0;
    for line in reactor_lines {
        if let Some(caps) = REACTOR_TEST_MODULE.captures(line) {
            reactor_time += convert_maven_time_to_seconds(&caps[2]);
        }
        if let Some(caps) = TOTAL_TIME.captures(line) {
            report.pure_build_duration = Some(convert_maven_time_to_seconds(&caps[1]));
        }
    }
    if report.test_duration.is_none() || reactor_time > report.test_duration.unwrap_or(0.0) {
        report.test_duration = Some(reactor_time);
    }
}

pub fn convert_maven_time_to_seconds(string: &str) -> f64 {
    if let Some(caps) = MAVEN_SECONDS.captures(string) {
        if let Ok(v) = caps[1].parse::<f64>() {
            return (v * 100.0).round() / 100.0;
        }
    }
    if let Some(caps) = MAVEN_MINUTES.captures(string) {
        let mins: f64 = caps[1].parse().unwrap_or(0.0);
        let secs: f64 = caps[2].parse().unwrap_or(0.0);
        return mins * 60.0 + secs;
    }
    0.0
}

/// Extracts a `method(package.Class)` signature from a failure line, e.g.
/// `testRadioButton(org.gwtbootstrap3.client.ui.RadioButtonGwt)`.
fn extract_test_method_name(string: &str) -> Option<String> {
    TEST_METHOD_NAME
        .captures(string)
        .map(|caps| caps[1].to_string())
}

/// `err_lines` holds everything that started with `[ERROR]`; keep the lines
/// before the full-stack-trace banner, dropping blanks and `-> [Help 1]`
/// hints.
fn extract_err_msg(report: &mut AnalysisReport) {
    for line in &report.err_lines {
        if line.len() > 49 && line.contains("To see the full stack trace of the errors") {
            break;
        }
        report.err_msg.push(line.clone());
    }
    report
        .err_msg
        .retain(|line| line.len() >= 2 && line != "-> [Help 1]");
}

/// Fallback failing-test extraction from the surefire `<<< FAILURE!` /
/// `<<< ERROR!` markers, covering the three observed line shapes.
fn extract_failed_tests_from_tests_lines(test_lines: &[String], report: &mut AnalysisReport) {
    let mut cur_test_class = String::new();
    for line in test_lines {
        if let Some(caps) = FAILURE_IN_CLASS.captures(line) {
            cur_test_class = caps[1].to_string();
        } else if FAILURE_MARKER.is_match(line) {
            let mut failed_test = extract_test_method_name(line);
            if failed_test.is_none() {
                // [ERROR] testMethod  Time elapsed: 0.011 sec  <<< FAILURE!
                if let Some(caps) = METHOD_TIME_ELAPSED.captures(line) {
                    failed_test = Some(format!("{}({})", &caps[2], cur_test_class));
                }
            }
            if failed_test.is_none() && !cur_test_class.is_empty() {
                // [ERROR] path.to.TestClass.testMethod  Time elapsed: ...
                let prefixed = Regex::new(&format!(
                    r"^(\[ERROR\] )?{}\.(\w+)  Time elapsed:",
                    regex::escape(&cur_test_class)
                ));
                if let Ok(re) = prefixed {
                    if let Some(caps) = re.captures(line) {
                        failed_test = Some(format!("{}({})", &caps[2], cur_test_class));
                    }
                }
            }
            if failed_test.is_none() {
                // Only the class name is present in the log.
                if let Some(caps) = CLASS_TIME_ELAPSED.captures(line) {
                    failed_test = Some(format!("({})", &caps[2]));
                }
            }
            if let Some(failed_test) = failed_test {
                report.tests_failed.push(failed_test);
            }
        }
    }
}
