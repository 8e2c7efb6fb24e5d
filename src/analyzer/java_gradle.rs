//! Gradle build log analysis.

use once_cell::sync::Lazy;
use regex::Regex;

use super::base::get_job_lines;
use super::folds::Folds;
use super::report::{strip_ansi, AnalysisReport};

pub const ANALYZER: &str = "java-gradle";

static TASK_HEADER_OLD: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^:[^/\\:<>"?*|]"#).unwrap());
static TASK_HEADER_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:").unwrap());
static TASK_HEADER_NEW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^> Task").unwrap());
static BUILD_RESULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^BUILD (SUCCESSFUL|FAILED) in ").unwrap());

// JUnit 4: `co.paralleluniverse.fibers.FiberTest > testSerialization[0] FAILED`
static JUNIT4_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<class>[\w.]+) > (?P<method>[\w ]+(?P<params>\[.*\])?) FAILED$").unwrap()
});
// JUnit 5, Gradle >= 8: `TestClass1 > shouldThrow() FAILED` and nested-class
// chains `UserEndpointTest > GetUserDetail > shouldFail() FAILED`
static JUNIT5_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<class>[\w.]+(?: > [\w.]+)*) > (?P<method>[\w ]+\([\w, ]*\))(?: > (?P<paramindex>\[\d+\]) (?P<params>.*))? FAILED$",
    )
    .unwrap()
});
// JUnit 5, Gradle <= 7: fq class+method repeated after the display chain.
static JUNIT5_OLD_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\w+ > \w+\([\w, ]+\) > (?P<classandmethod>[\w. ]+(?P<params>\(.*\)\[\d+\])?) FAILED$")
        .unwrap()
});
// Newer TestNG: `Suite Foo > Test Bar > org.x.TestClass1 > shouldFail FAILED`
static TESTNG_NEW_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[\w\s]+ > [\w\s]+ > (?P<class>\w+\.[\w.]+) > (?P<method>[\w ]+(?P<params>\[\d+\]\(.*\))?) FAILED$",
    )
    .unwrap()
});
// Older TestNG: `TestNG > Regression2 > test.groupinvocation.GroupSuiteTest.Regression2 FAILED`
static TESTNG_OLD_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w\s]+ > [\w\s]+ > (?P<classandmethod>[\w ]+\.[\w. ]+(?P<params>\[\d+\]\(.*\))?) FAILED$")
        .unwrap()
});
// Bare `path.to.TestClass.testMethod FAILED`. Risky, so it requires a
// full-line match with at least one period and no spaces.
static BARE_FAILED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+\.[\w.]+) FAILED$").unwrap());

static TESTS_COMPLETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d*) tests completed(, (\d*) failed)?(, (\d*) skipped)?").unwrap());
static TESTNG_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Total tests run: (\d+), Failures: (\d+), Skips: (\d+)").unwrap());
static TOTAL_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"Total time: (.*)").unwrap());
static BUILD_RESULT_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"BUILD (FAILED|SUCCESSFUL) in (.*)").unwrap());
static GRADLE_MINS_SECS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((\d+) mins)? (\d+)(\.\d+) secs").unwrap());
static GRADLE_M_S: Lazy<Regex> = Lazy::new(|| Regex::new(r"((\d+)m )?(\d+)s").unwrap());

pub fn analyze(folds: &Folds, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();
    report.build_system = Some("Gradle".to_string());
    report.did_tests_fail = Some(false);

    let test_lines = extract_tests(folds);
    analyze_tests(&test_lines, report);

    let did_fail = report.default_did_tests_fail();
    if did_fail {
        report.did_tests_fail = Some(true);
    }
}

/// There is no explicit test banner; the section opens at the first task
/// header and closes at the `BUILD …` result line.
fn extract_tests(folds: &Folds) -> Vec<String> {
    let mut test_lines = Vec::new();
    let mut test_section_started = false;
    let mut line_marker = 0;

    for raw in get_job_lines(folds) {
        let line = strip_ansi(raw);
        if TASK_HEADER_OLD.is_match(&line) {
            line_marker = 1;
            test_section_started = true;
        } else if TASK_HEADER_BARE.is_match(&line) && line_marker == 1 {
            line_marker = 0;
            test_section_started = false;
        } else if TASK_HEADER_NEW.is_match(&line) {
            line_marker = 1;
            test_section_started = true;
        } else if BUILD_RESULT.is_match(&line) && line_marker == 1 {
            test_lines.push(line);
            line_marker = 0;
            test_section_started = false;
            continue;
        }

        if test_section_started {
            test_lines.push(line);
        }
    }
    test_lines
}

fn match_failed_test(line: &str, report: &mut AnalysisReport) -> bool {
    if let Some(caps) = JUNIT4_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        report
            .tests_failed
            .push(format!("{}.{}", &caps["class"], &caps["method"]));
        report.did_tests_fail = Some(true);
        return true;
    }
    if let Some(caps) = JUNIT5_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        let param_index = caps.name("paramindex").map(|m| m.as_str()).unwrap_or("");
        // "OuterClass$InnerClass" is the standard way to denote nested
        // classes in Java.
        let test_class = caps["class"].replace(" > ", "$");
        report
            .tests_failed
            .push(format!("{}.{}{}", test_class, &caps["method"], param_index));
        report.did_tests_fail = Some(true);
        return true;
    }
    if let Some(caps) = JUNIT5_OLD_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        report.tests_failed.push(caps["classandmethod"].to_string());
        report.did_tests_fail = Some(true);
        return true;
    }
    if let Some(caps) = TESTNG_NEW_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        report
            .tests_failed
            .push(format!("{}.{}", &caps["class"], &caps["method"]));
        report.did_tests_fail = Some(true);
        return true;
    }
    if let Some(caps) = TESTNG_OLD_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        report.tests_failed.push(caps["classandmethod"].to_string());
        report.did_tests_fail = Some(true);
        return true;
    }
    if let Some(caps) = BARE_FAILED.captures(line) {
        report.tests_run = true;
        report.init_tests();
        report.tests_failed.push(caps[1].to_string());
        report.did_tests_fail = Some(true);
        return true;
    }
    false
}

fn analyze_tests(test_lines: &[String], report: &mut AnalysisReport) {
    for line in test_lines {
        match_failed_test(line, report);

        if let Some(caps) = TESTS_COMPLETED.captures(line) {
            report.tests_run = true;
            report.init_tests();
            report.add_framework("JUnit");
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) +=
                caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            *report.num_tests_skipped.get_or_insert(0) +=
                caps.get(5).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            continue;
        }
        if let Some(caps) = TESTNG_SUMMARY.captures(line) {
            report.tests_run = true;
            report.init_tests();
            report.add_framework("testng");
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            *report.num_tests_failed.get_or_insert(0) += caps[2].parse().unwrap_or(0);
            *report.num_tests_skipped.get_or_insert(0) += caps[3].parse().unwrap_or(0);
            continue;
        }

        // Only the last build's time survives, same as Maven and Ant.
        if let Some(caps) = TOTAL_TIME.captures(line) {
            report.pure_build_duration = Some(convert_gradle_time_to_seconds(&caps[1]));
        }
        if let Some(caps) = BUILD_RESULT_TIME.captures(line) {
            report.pure_build_duration = Some(convert_gradle_time_to_seconds(&caps[2]));
        }
    }
    report.uninit_ok_tests();
}

pub fn convert_gradle_time_to_seconds(string: &str) -> f64 {
    if let Some(caps) = GRADLE_MINS_SECS.captures(string) {
        let secs: f64 = caps[3].parse().unwrap_or(0.0);
        return match caps.get(2) {
            Some(mins) => mins.as_str().parse::<f64>().unwrap_or(0.0) * 60.0 + secs,
            None => secs,
        };
    }
    if let Some(caps) = GRADLE_M_S.captures(string) {
        let secs: f64 = caps[3].parse().unwrap_or(0.0);
        return match caps.get(2) {
            Some(mins) => mins.as_str().parse::<f64>().unwrap_or(0.0) * 60.0 + secs,
            None => secs,
        };
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
    fn test_tests_completed_summary() {
        let log = "> Task :test\n\
                   DownloadTest > testDownload FAILED\n\
                   182 tests completed, 5 failed, 1 skipped\n\
                   BUILD FAILED in 2m 11s";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(182));
        assert_eq!(report.num_tests_failed, Some(5));
        assert_eq!(report.num_tests_skipped, Some(1));
        assert_eq!(report.num_tests_ok, Some(177));
        assert_eq!(report.pure_build_duration, Some(131.0));
        assert_eq!(report.did_tests_fail, Some(true));
    }

    #[test]
    fn test_junit4_failed_shape() {
        let log = "> Task :test\n\
                   co.paralleluniverse.fibers.FiberTest > testSerializationWithThreadLocals[0] FAILED\n\
                   BUILD FAILED in 10s";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["co.paralleluniverse.fibers.FiberTest.testSerializationWithThreadLocals[0]"]
        );
    }

    #[test]
    fn test_junit5_nested_class_shape() {
        let log = "> Task :test\n\
                   UserEndpointTest > GetUserDetail > shouldResponseErrorIfUserNotFound() FAILED\n\
                   BUILD FAILED in 10s";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["UserEndpointTest$GetUserDetail.shouldResponseErrorIfUserNotFound()"]
        );
    }

    #[test]
    fn test_testng_chain_shape() {
        let log = "> Task :test\n\
                   TestNG > Regression2 > test.groupinvocation.GroupSuiteTest.Regression2 FAILED\n\
                   Total tests run: 10, Failures: 1, Skips: 0\n\
                   BUILD FAILED in 10s";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["test.groupinvocation.GroupSuiteTest.Regression2"]
        );
        assert_eq!(report.num_tests_run, Some(10));
        assert_eq!(report.frameworks, vec!["testng"]);
    }

    #[test]
    fn test_no_failures_means_did_tests_fail_false() {
        let log = "> Task :test\n\
                   182 tests completed\n\
                   BUILD SUCCESSFUL in 45s";
        let report = analyze_log(log);
        assert_eq!(report.did_tests_fail, Some(false));
        assert_eq!(report.num_tests_failed, Some(0));
        assert_eq!(report.pure_build_duration, Some(45.0));
    }

    #[test]
    fn test_gradle_time_formats() {
        assert_eq!(convert_gradle_time_to_seconds("2 mins 11.5 secs"), 131.0);
        assert_eq!(convert_gradle_time_to_seconds(" 11.5 secs"), 11.0);
        assert_eq!(convert_gradle_time_to_seconds("2m 11s"), 131.0);
        assert_eq!(convert_gradle_time_to_seconds("45s"), 45.0);
        // Unrecognized formats stay at zero; the grammar is deliberately
        // narrow.
        assert_eq!(convert_gradle_time_to_seconds("1 hr 2 min"), 0.0);
    }
}
