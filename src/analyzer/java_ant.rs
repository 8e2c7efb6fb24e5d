//! Ant build log analysis. Also the reasonable default for Java logs that
//! report through `[junit]`-style task prefixes.

use once_cell::sync::Lazy;
use regex::Regex;

use super::folds::{Folds, OUT_OF_FOLD};
use super::report::AnalysisReport;

pub const ANALYZER: &str = "java-ant";

static TASK_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(junit|junitlauncher|testng|test.*)\] ").unwrap());
static JUNIT5_REPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\w+\] Failures \(\d+\):|\[\w+\] Test run finished").unwrap());
static TOTAL_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Total time: (.+)").unwrap());
static ANT_SECONDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"((\d+)(\.\d*)?) s").unwrap());
static ANT_MINUTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+):(\d+) min").unwrap());
static ANT_MILLIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) ms").unwrap());
static TESTCASE_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Testcase: (\w+)\(([\w.]+)\):\s(Caused an ERROR|FAILED)").unwrap());
static TRAILING_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\t(FAILED$|Caused an ERROR$)").unwrap());
static TESTCASE_TOOK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Testcase: (\w+(\[.+\])?) took \d").unwrap());
static TESTSUITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Testsuite: ([\w.]+)$").unwrap());
static FAILURES_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"Failures \([0-9]+\):").unwrap());
static METHOD_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"MethodSource \[className = '([\w.]+)', methodName = '(\w+)', methodParameterTypes = '.*'\]",
    )
    .unwrap()
});
static CLASS_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ClassSource \[className = '([\w.]+)'.*\]").unwrap());
static LAUNCHER_FOUND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s+(\d+) tests found\s+\]").unwrap());
static LAUNCHER_SKIPPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s+(\d+) tests skipped\s+\]").unwrap());
static LAUNCHER_ABORTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s+(\d+) tests aborted\s+\]").unwrap());
static LAUNCHER_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s+(\d+) tests failed\s+\]").unwrap());
static LAUNCHER_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s+\d+").unwrap());
static JUNIT4_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests run: (\d*), Failures: (\d*), Errors: (\d*), (Skipped: (\d*), )?Time elapsed: (.*)")
        .unwrap()
});
static JUNIT5_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests run: (\d*), Failures: (\d*), Aborted: (\d*), Skipped: (\d*), Time elapsed: (.*)")
        .unwrap()
});
static RUN_FINISHED: Lazy<Regex> = Lazy::new(|| Regex::new(r"Test run finished after (.*)").unwrap());
static TESTNG_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Total tests run: (\d+), Failures: (\d+), Skips: (\d+)").unwrap());

pub fn analyze(folds: &Folds, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();
    report.build_system = Some("Ant".to_string());

    let test_lines = extract_tests(folds, report);
    analyze_tests(&test_lines, report);
    report.did_tests_fail = Some(report.default_did_tests_fail());
}

fn extract_tests(folds: &Folds, report: &mut AnalysisReport) -> Vec<String> {
    let mut test_lines = Vec::new();
    let mut test_section_started = false;

    for line in &folds[OUT_OF_FOLD].content {
        if TASK_PREFIX.is_match(line) || JUNIT5_REPORT.is_match(line) {
            test_section_started = true;
        }

        // Only the last build's time survives, same as Maven and Gradle.
        if let Some(caps) = TOTAL_TIME.captures(line) {
            report.pure_build_duration = Some(convert_ant_time_to_seconds(&caps[1]));
        }

        if test_section_started {
            test_lines.push(line.clone());
        }
    }
    test_lines
}

fn analyze_tests(test_lines: &[String], report: &mut AnalysisReport) {
    let mut current_testsuite = String::new();
    let mut last_testcase = String::new();
    let mut started_failure = false;
    let mut junit5_console_launcher_started = false;

    for (line_idx, line) in test_lines.iter().enumerate() {
        // Testcase: testMethod(path.to.TestClass):	FAILED
        if let Some(caps) = TESTCASE_FAILED.captures(line) {
            if caps[2] == *current_testsuite {
                report
                    .tests_failed
                    .push(format!("{}.{}", current_testsuite, &caps[1]));
            }
            continue;
        }

        // A bare FAILED/ERROR marker refers to the testcase logged just
        // above; without one, only the suite name is known.
        if TRAILING_FAILED.is_match(line) {
            if !last_testcase.is_empty() {
                report
                    .tests_failed
                    .push(format!("{}.{}", current_testsuite, last_testcase));
                continue;
            } else if !current_testsuite.is_empty() {
                report.tests_failed.push(format!("({})", current_testsuite));
                continue;
            }
        }

        if let Some(caps) = TESTCASE_TOOK.captures(line) {
            last_testcase = caps[1].to_string();
            continue;
        }
        last_testcase.clear();

        if let Some(caps) = TESTSUITE.captures(line) {
            current_testsuite = caps[1].to_string();
            continue;
        }

        // Junitreport / JUnit 5
        if FAILURES_HEADER.is_match(line) {
            started_failure = true;
            continue;
        }
        if started_failure {
            if let Some(caps) = METHOD_SOURCE.captures(line) {
                report.tests_failed.push(format!("{}.{}", &caps[1], &caps[2]));
                continue;
            }
            if let Some(caps) = CLASS_SOURCE.captures(line) {
                // Reached only when the method name is not in the log.
                report.tests_failed.push(format!("({})", &caps[1]));
                continue;
            }
        }

        if junit5_console_launcher_started {
            if let Some(caps) = LAUNCHER_FOUND.captures(line) {
                *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
                continue;
            }
            if let Some(caps) = LAUNCHER_SKIPPED.captures(line) {
                *report.num_tests_skipped.get_or_insert(0) += caps[1].parse().unwrap_or(0);
                continue;
            }
            if let Some(caps) = LAUNCHER_ABORTED.captures(line) {
                *report.num_tests_skipped.get_or_insert(0) += caps[1].parse().unwrap_or(0);
                continue;
            }
            if let Some(caps) = LAUNCHER_FAILED.captures(line) {
                *report.num_tests_failed.get_or_insert(0) += caps[1].parse().unwrap_or(0);
                continue;
            }
            if !LAUNCHER_ROW.is_match(line) {
                junit5_console_launcher_started = false;
            }
        }

        // JUnit 4. Some logs print the summary twice on consecutive lines;
        // count it once.
        if let Some(caps) = JUNIT4_SUMMARY.captures(line) {
            if line_idx == 0 || test_lines[line_idx - 1] != *line {
                report.init_tests();
                report.add_framework("JUnit");
                let num_run: i64 = caps[1].parse().unwrap_or(0);
                let num_failure: i64 = caps[2].parse().unwrap_or(0);
                let num_error: i64 = caps[3].parse().unwrap_or(0);
                if !(num_run == 0 && num_error == 1) {
                    // A failed @BeforeClass reports `Tests run: 0, ...,
                    // Errors: 1` without running anything.
                    report.tests_run = true;
                    *report.num_tests_run.get_or_insert(0) += num_run;
                    *report.num_tests_failed.get_or_insert(0) += num_failure + num_error;
                }
                if caps.get(4).is_some() {
                    *report.num_tests_skipped.get_or_insert(0) += caps[5].parse().unwrap_or(0);
                }
                *report.test_duration.get_or_insert(0.0) += convert_ant_time_to_seconds(&caps[6]);
                continue;
            }
        }

        // JUnit 5
        if let Some(caps) = JUNIT5_SUMMARY.captures(line) {
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) += caps[2].parse().unwrap_or(0);
            *report.num_tests_skipped.get_or_insert(0) +=
                caps[3].parse::<i64>().unwrap_or(0) + caps[4].parse::<i64>().unwrap_or(0);
            *report.test_duration.get_or_insert(0.0) += convert_ant_time_to_seconds(&caps[5]);
            continue;
        }

        // JUnit 5 console launcher
        if let Some(caps) = RUN_FINISHED.captures(line) {
            junit5_console_launcher_started = true;
            report.init_tests();
            report.add_framework("JUnit");
            report.tests_run = true;
            *report.test_duration.get_or_insert(0.0) += convert_ant_time_to_seconds(&caps[1]);
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
    }

    report.uninit_ok_tests();
}

pub fn convert_ant_time_to_seconds(string: &str) -> f64 {
    if let Some(caps) = ANT_SECONDS.captures(string) {
        if let Ok(v) = caps[1].parse::<f64>() {
            return (v * 100.0).round() / 100.0;
        }
    }
    if let Some(caps) = ANT_MINUTES.captures(string) {
        let mins: f64 = caps[1].parse().unwrap_or(0.0);
        let secs: f64 = caps[2].parse().unwrap_or(0.0);
        return mins * 60.0 + secs;
    }
    if let Some(caps) = ANT_MILLIS.captures(string) {
        if let Ok(v) = caps[1].parse::<f64>() {
            return (v * 0.001 * 100.0).round() / 100.0;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::folds::split_gha;

    fn analyze_log(text: &str) -> AnalysisReport {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let folds = split_gha(&lines, &[]);
        let mut report = AnalysisReport::new("1", "plain");
        analyze(&folds, &mut report);
        report
    }

    #[test]
    fn test_testsuite_testcase_framing() {
        let log = "[junit] Testsuite: abstraction.FiliereParDefaultTest\n\
                   [junit] Testcase: testNext took 0.005 sec\n\
                   \tFAILED\n\
                   [junit] Tests run: 1, Failures: 1, Errors: 0, Time elapsed: 0.1 sec";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["abstraction.FiliereParDefaultTest.testNext"]
        );
        assert_eq!(report.num_tests_run, Some(1));
        assert_eq!(report.num_tests_failed, Some(1));
        assert_eq!(report.num_tests_ok, Some(0));
        assert_eq!(report.frameworks, vec!["JUnit"]);
        assert_eq!(report.did_tests_fail, Some(true));
    }

    #[test]
    fn test_testcase_paren_shape() {
        let log = "[junit] Testsuite: wyc.testing.AllInvalidTest\n\
                   Testcase: testInvalid(wyc.testing.AllInvalidTest):\tFAILED\n\
                   [junit] Tests run: 2, Failures: 1, Errors: 0, Time elapsed: 1.5 sec";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["wyc.testing.AllInvalidTest.testInvalid"]
        );
    }

    #[test]
    fn test_duplicate_summary_counted_once() {
        let log = "[junit] Testsuite: a.B\n\
                   Tests run: 3, Failures: 0, Errors: 0, Time elapsed: 0.2 sec\n\
                   Tests run: 3, Failures: 0, Errors: 0, Time elapsed: 0.2 sec";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(3));
    }

    #[test]
    fn test_before_class_error_not_counted_as_run() {
        let log = "[junit] Testsuite: a.B\n\
                   Tests run: 0, Failures: 0, Errors: 1, Time elapsed: 0 sec";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(0));
        assert_eq!(report.num_tests_failed, Some(0));
        assert!(!report.tests_run);
    }

    #[test]
    fn test_junit5_console_launcher_block() {
        let log = "[junitlauncher] Test run finished after 1240 ms\n\
                   [          5 tests found           ]\n\
                   [          1 tests skipped         ]\n\
                   [          2 tests failed          ]\n\
                   done";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(5));
        assert_eq!(report.num_tests_skipped, Some(1));
        assert_eq!(report.num_tests_failed, Some(2));
        assert_eq!(report.test_duration, Some(1.24));
    }

    #[test]
    fn test_methodsource_failures() {
        let log = "[junitlauncher] Failures (1):\n\
                   MethodSource [className = 'org.x.MyTest', methodName = 'testIt', methodParameterTypes = '']\n\
                   done";
        let report = analyze_log(log);
        assert_eq!(report.tests_failed, vec!["org.x.MyTest.testIt"]);
    }

    #[test]
    fn test_ant_time_formats() {
        assert_eq!(convert_ant_time_to_seconds("0.005 s"), 0.01);
        assert_eq!(convert_ant_time_to_seconds("2:05 min"), 125.0);
        assert_eq!(convert_ant_time_to_seconds("1240 ms"), 1.24);
        assert_eq!(convert_ant_time_to_seconds("?"), 0.0);
    }
}
