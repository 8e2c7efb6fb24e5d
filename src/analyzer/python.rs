//! Python build log analysis. Supports unittest, unittest2, pytest, and
//! nose; unittest2 and nose report as unittest since their outputs are
//! identical.

use once_cell::sync::Lazy;
use regex::Regex;

use super::base::get_job_lines;
use super::folds::Folds;
use super::report::{strip_ansi, AnalysisReport};

pub const ANALYZER: &str = "python";

static SESSION_STARTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"test session starts").unwrap());
static FAILURES_BANNER: Lazy<Regex> = Lazy::new(|| Regex::new(r"==+ (FAILURES|ERRORS) ==+").unwrap());
static XFAILURES_BANNER: Lazy<Regex> = Lazy::new(|| Regex::new(r"==+ XFAILURES ==+").unwrap());
static RAN_TESTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Ran (\d+) tests? in (.+s)").unwrap());
static RAN_TESTS_LOOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Ran .* tests? in ").unwrap());
static SECONDS_SUMMARY_LOOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"==+ (.+) in (.+) seconds ==+").unwrap());
static PYTEST_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=+ (.+) in ([0-9.]+)(?:s[ )(0-9:]*| seconds) =+").unwrap());
static QUIET_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:\d+ [a-z]+)(?:, \d+ [a-z]+)*) in ([0-9.]+)(?:s( \([0-9:]+\))?| seconds)$")
        .unwrap()
});
static OK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^OK( \((.+)\))?\s*$").unwrap());
static FAILED_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^FAILED( \((.+)\))?\s*$").unwrap());
static ERROR_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(ERROR): (Failure:) ([^( ]+)").unwrap());
static FAIL_WITH_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((FAIL)|(ERROR)): (\S+(\(.+\))? \(\S+\))").unwrap());
static FAIL_DOTTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(FAIL|ERROR):( Doctest:)? ([\w.]+(\(.+\))?)$").unwrap());
static SHORT_SUMMARY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=====+ short test summary info =====+").unwrap());
static SHORT_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(FAILED|ERROR) ([\w/.]+)\.py::([\w:]+)(\[.+\])?").unwrap());
static SHORT_FAILED_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(FAILED|ERROR) ([\w/.]+)\.py").unwrap());
static VERBOSE_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w/]+)\.py((::\w+)+)(\[.+\])? FAILED(\s+\[\s*\d+%\])?$").unwrap());
static VERBOSE_DOCTEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w/]+)\.py::([\w.]+)(\[.+\])? FAILED(\s+\[\s*\d+%\])?$").unwrap());
static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([\w/]+)\.py ([FEXxs.]+)").unwrap());
static PERCENT_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[ \d+%\] (FAILED|ERROR) ([\w/.]+)\.py::([\w:]+)(\[.+\])?").unwrap());
static BARE_PROGRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([FEXxs.]*F[FEXxs.]*)").unwrap());
static FAILURE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_+ ([\w.]+(\[.+\])?) _+$").unwrap());
static DOCTEST_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_+ \[doctest\] ([\w.]+(\[.+\])?) _+$").unwrap());
static ERROR_COLLECTING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_+ ERROR (\w+ )?([\w/.-]+?)(\.py)? _+$").unwrap());

#[derive(Default)]
struct PythonState {
    has_summary: bool,
    force_tests_passed: bool,
    force_tests_failed: bool,
    initialized: bool,
}

impl PythonState {
    fn setup(&mut self, report: &mut AnalysisReport) {
        if !self.initialized {
            report.init_tests();
            report.tests_run = true;
            self.force_tests_passed = false;
            self.force_tests_failed = false;

            // Pytest's "expected failures": xfailed tests failed as
            // expected, xpassed passed unexpectedly. Neither affects the
            // suite outcome, so both are excluded from num_tests_ok later.
            report.num_tests_xfailed = 0;
            report.num_tests_xpassed = 0;
            self.initialized = true;
        }
    }
}

pub fn analyze(folds: &Folds, report: &mut AnalysisReport) {
    report.analyzer = ANALYZER.to_string();

    let test_lines: Vec<String> = get_job_lines(folds).map(|l| strip_ansi(l)).collect();

    let mut state = PythonState::default();
    // Pre-pass: a summary anywhere in the log legitimizes bare OK/FAILED
    // result lines even when they precede the summary pattern match below.
    for line in &test_lines {
        if RAN_TESTS_LOOSE.is_match(line) || SECONDS_SUMMARY_LOOSE.is_match(line) {
            state.has_summary = true;
            break;
        }
    }

    analyze_tests(&test_lines, &mut state, report);

    report.uninit_ok_tests();
    if report.num_tests_ok.is_some() {
        let deduction = report.num_tests_xfailed + report.num_tests_xpassed;
        *report.num_tests_ok.as_mut().unwrap() -= deduction;
    }

    report.did_tests_fail = Some(bool_tests_failed(&state, report));
}

fn bool_tests_failed(state: &PythonState, report: &AnalysisReport) -> bool {
    if state.force_tests_failed {
        return true;
    }
    if report.default_did_tests_fail() {
        return true;
    }
    false
}

/// Parse pytest's `20 failed, 9721 passed, 23 skipped` status list.
fn analyze_pytest_status_info_list(s: &str, report: &mut AnalysisReport) {
    for part in s.split(", ") {
        let mut it = part.split(' ');
        let (Some(val), Some(key)) = (it.next(), it.next()) else {
            // Happens when pytest outputs a "no tests ran" message.
            return;
        };
        let Ok(val) = val.parse::<i64>() else {
            return;
        };
        let key = key.to_lowercase();
        if key == "passed" {
            *report.num_tests_run.get_or_insert(0) += val;
        } else if key == "failed" || key.starts_with("error") {
            *report.num_tests_failed.get_or_insert(0) += val;
            *report.num_tests_run.get_or_insert(0) += val;
        } else if key == "xfailed" {
            report.num_tests_xfailed += val;
            *report.num_tests_run.get_or_insert(0) += val;
        } else if key == "xpassed" {
            report.num_tests_xpassed += val;
            *report.num_tests_run.get_or_insert(0) += val;
        } else if key == "skipped" {
            *report.num_tests_skipped.get_or_insert(0) += val;
        }
    }
}

/// Parse unittest's `skip=2, errors=1, failures=3` status list.
fn analyze_status_info_list(s: &str, report: &mut AnalysisReport) {
    for part in s.split(", ") {
        let mut it = part.split('=');
        let (Some(key), Some(val)) = (it.next(), it.next()) else {
            continue;
        };
        let Ok(val) = val.parse::<i64>() else {
            continue;
        };
        match key.to_lowercase().as_str() {
            "skip" | "skipped" => *report.num_tests_skipped.get_or_insert(0) += val,
            "errors" | "failures" | "error" | "failure" => {
                *report.num_tests_failed.get_or_insert(0) += val
            }
            _ => {}
        }
    }
}

fn analyze_tests(test_lines: &[String], state: &mut PythonState, report: &mut AnalysisReport) {
    let mut short_summary_seen = false;
    // Verbose failure headers only count once the FAILURES banner was seen.
    let mut ignore_pytest_failures = true;
    let mut pytest_test_files: Vec<String> = Vec::new();
    let mut summary_tests_failed: Vec<String> = Vec::new();
    let mut last_pytest_file = String::new();

    for line in test_lines {
        if SESSION_STARTS.is_match(line) {
            state.setup(report);
            report.add_framework("pytest");
            continue;
        }

        if FAILURES_BANNER.is_match(line) && report.tests_failed.is_empty() {
            ignore_pytest_failures = false;
            continue;
        }
        if XFAILURES_BANNER.is_match(line) {
            // Xfailures use the same traceback format, but they are expected
            // to fail and must not be counted.
            ignore_pytest_failures = true;
            continue;
        }

        if let Some(caps) = RAN_TESTS.captures(line) {
            // 'Ran 3 tests in 0.000s'
            state.setup(report);
            report.add_framework("unittest");
            *report.num_tests_run.get_or_insert(0) += caps[1].parse().unwrap_or(0);
            let secs = &caps[2][..caps[2].len() - 1];
            *report.test_duration.get_or_insert(0.0) += secs.parse::<f64>().unwrap_or(0.0);
            state.has_summary = true;
            continue;
        }

        if let Some(caps) = PYTEST_SUMMARY.captures(line) {
            // '=== 442 passed, 2 xpassed in 50.65 seconds ===' or the
            // pytest 6 form with an (h:mm:ss) suffix.
            state.setup(report);
            report.add_framework("pytest");
            analyze_pytest_status_info_list(&caps[1], report);
            *report.test_duration.get_or_insert(0.0) += caps[2].parse::<f64>().unwrap_or(0.0);
            state.has_summary = true;
            short_summary_seen = false;
            if report.tests_failed.len() <= summary_tests_failed.len() {
                // The short summary is authoritative when it caught more.
                report.tests_failed = summary_tests_failed.clone();
            }
            continue;
        }

        if let Some(caps) = QUIET_SUMMARY.captures(line) {
            // '1 failed, 164 passed, 13 skipped, 2781 deselected in 99.88s'
            state.setup(report);
            report.add_framework("pytest");
            analyze_pytest_status_info_list(&caps[1], report);
            *report.test_duration.get_or_insert(0.0) += caps[2].parse::<f64>().unwrap_or(0.0);
            state.has_summary = true;
            short_summary_seen = false;
            if report.tests_failed.len() <= summary_tests_failed.len() {
                report.tests_failed = summary_tests_failed.clone();
            }
            continue;
        }

        if let Some(caps) = OK_LINE.captures(line) {
            if state.has_summary {
                // 'OK' alone is risky; requiring a summary mitigates it.
                state.setup(report);
                state.force_tests_passed = true;
                if let Some(info) = caps.get(2) {
                    analyze_status_info_list(info.as_str(), report);
                }
                continue;
            }
        }
        if let Some(caps) = FAILED_LINE.captures(line) {
            if state.has_summary {
                state.setup(report);
                state.force_tests_passed = false;
                state.force_tests_failed = true;
                if let Some(info) = caps.get(2) {
                    analyze_status_info_list(info.as_str(), report);
                }
                continue;
            }
        }

        // unittest / unittest2 / nose failing tests
        if let Some(caps) = ERROR_FAILURE.captures(line) {
            {
                // ERROR: Failure: ImportError (No module named 'six')
                state.setup(report);
                report.tests_failed.push(caps[3].to_string());
                continue;
            }
        }
        if let Some(caps) = FAIL_WITH_CLASS.captures(line) {
            {
                // FAIL: test_em (__main__.TestMarkdownPy)
                state.setup(report);
                report.tests_failed.push(caps[4].to_string());
                continue;
            }
        }
        if let Some(caps) = FAIL_DOTTED.captures(line) {
            {
                state.setup(report);
                report.tests_failed.push(caps[3].to_string());
                continue;
            }
        }

        if SHORT_SUMMARY_HEADER.is_match(line) {
            short_summary_seen = true;
            summary_tests_failed.clear();
            continue;
        }

        if short_summary_seen {
            if let Some(caps) = SHORT_FAILED.captures(line) {
                // FAILED gammapy/irf/psf/tests/test_parametric.py::test_psf_king_containment_radius
                // becomes gammapy.irf.psf.tests.test_parametric::test_psf_king_containment_radius
                let test_file = caps[2].replace('/', ".");
                let test_method = caps[3].replace('.', "::");
                let mut failed_test = format!("{test_file}::{test_method}");
                if let Some(params) = caps.get(4) {
                    failed_test.push_str(params.as_str());
                }
                summary_tests_failed.push(failed_test);
                continue;
            }
            if let Some(caps) = SHORT_FAILED_FILE.captures(line) {
                // Class-level error with no method name.
                let test_file = caps[2].replace('/', ".");
                summary_tests_failed.push(format!("({test_file})"));
            }
        }

        // Verbose pytest: tests/test_client.py::SSHClientTest::test_host_key FAILED [ 65%]
        if let Some(caps) = VERBOSE_FAILED.captures(line) {
            {
                state.setup(report);
                let test_file = caps[1].replace('/', ".");
                let mut failed_test = format!("{}{}", test_file, &caps[2]);
                if let Some(params) = caps.get(4) {
                    failed_test.push_str(params.as_str());
                }
                report.tests_failed.push(failed_test);
                continue;
            }
        }

        // Verbose doctest: joblib/shelf.py::joblib.shelf.shelve_mmap FAILED
        if let Some(caps) = VERBOSE_DOCTEST.captures(line) {
            {
                state.setup(report);
                let test_file = caps[1].replace('/', ".");
                let test_method = caps[2][test_file.len().min(caps[2].len())..].replace('.', "::");
                let mut failed_test = format!("{test_file}{test_method}");
                if let Some(params) = caps.get(3) {
                    failed_test.push_str(params.as_str());
                }
                report.tests_failed.push(failed_test);
                continue;
            }
        }

        // Progress line: tests/h/oauth/jwt_grant_token_test.py ...F....FF
        if let Some(caps) = PROGRESS_LINE.captures(line) {
            {
                last_pytest_file = caps[1].replace('/', ".");
                let fails = caps[2].matches('F').count();
                for _ in 0..fails {
                    pytest_test_files.push(last_pytest_file.clone());
                }
                continue;
            }
        }

        if let Some(caps) = PERCENT_FAILED.captures(line) {
            {
                // [ 88%] FAILED tests/integration/test_mongodb.py::TestMongoCache::test_ttl
                let test_file = caps[2].replace('/', ".");
                let test_method = caps[3].replace('.', "::");
                let mut failed_test = format!("{test_file}::{test_method}");
                if let Some(params) = caps.get(4) {
                    failed_test.push_str(params.as_str());
                }
                report.tests_failed.push(failed_test);
                continue;
            }
        }

        // Continuation progress line with no file name.
        if let Some(caps) = BARE_PROGRESS.captures(line) {
            if !last_pytest_file.is_empty() {
                let fails = caps[1].matches('F').count();
                for _ in 0..fails {
                    pytest_test_files.push(last_pytest_file.clone());
                }
                continue;
            }
        }

        // ________________ ReadKeyTest.test_page_down ________________
        if let Some(caps) = DOCTEST_HEADER.captures(line) {
            if !ignore_pytest_failures && !caps[1].starts_with("summary") {
                state.setup(report);
                if let Some(test_file) = pytest_test_files.first().cloned() {
                    let name = &caps[1];
                    let test_method = name[test_file.len().min(name.len())..].replace('.', "::");
                    report.tests_failed.push(format!("{test_file}{test_method}"));
                    pytest_test_files.remove(0);
                } else {
                    report.tests_failed.push(caps[1].to_string());
                }
                continue;
            }
        } else if let Some(caps) = ERROR_COLLECTING.captures(line) {
            {
                // _____ ERROR collecting test/unittests/tts/test_tts.py _____
                state.setup(report);
                let test_file = caps[2].replace('/', ".");
                report.tests_failed.push(format!("({test_file})"));
                continue;
            }
        } else if let Some(caps) = FAILURE_HEADER.captures(line) {
            if !ignore_pytest_failures && !caps[1].starts_with("summary") {
                state.setup(report);
                if let Some(test_file) = pytest_test_files.first().cloned() {
                    let test_method = caps[1].replace('.', "::");
                    report.tests_failed.push(format!("{test_file}::{test_method}"));
                    pytest_test_files.remove(0);
                } else {
                    report.tests_failed.push(caps[1].to_string());
                }
                continue;
            }
        }
    }
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
    fn test_unittest_summary_with_failures() {
        let log = "FAIL: test_em (__main__.TestMarkdownPy)\n\
                   ----------------------------------------------------------------------\n\
                   Ran 3 tests in 0.000s\n\
                   \n\
                   FAILED (failures=1)";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(3));
        assert_eq!(report.num_tests_failed, Some(1));
        assert_eq!(report.num_tests_ok, Some(2));
        assert_eq!(report.frameworks, vec!["unittest"]);
        assert_eq!(report.tests_failed, vec!["test_em (__main__.TestMarkdownPy)"]);
        assert_eq!(report.did_tests_fail, Some(true));
    }

    #[test]
    fn test_unittest_ok_with_skips() {
        let log = "Ran 10 tests in 1.500s\n\nOK (skipped=2)";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(10));
        assert_eq!(report.num_tests_skipped, Some(2));
        assert_eq!(report.did_tests_fail, Some(false));
    }

    #[test]
    fn test_pytest_short_summary_is_authoritative() {
        let log = "============================= test session starts ==============================\n\
                   =========================== short test summary info ============================\n\
                   FAILED gammapy/irf/psf/tests/test_parametric.py::test_psf_king_containment_radius\n\
                   ==== 1 failed, 1956 passed in 541.28s (0:09:01) ====";
        let report = analyze_log(log);
        assert_eq!(report.frameworks, vec!["pytest"]);
        assert_eq!(report.num_tests_failed, Some(1));
        assert_eq!(report.num_tests_run, Some(1957));
        assert_eq!(
            report.tests_failed,
            vec!["gammapy.irf.psf.tests.test_parametric::test_psf_king_containment_radius"]
        );
    }

    #[test]
    fn test_pytest_quiet_summary() {
        let log = "============================= test session starts ==============================\n\
                   1 failed, 164 passed, 13 skipped, 2781 deselected in 99.88s (0:01:39)";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_failed, Some(1));
        assert_eq!(report.num_tests_run, Some(165));
        assert_eq!(report.num_tests_skipped, Some(13));
        assert_eq!(report.test_duration, Some(99.88));
    }

    #[test]
    fn test_pytest_xfail_xpass_excluded_from_ok() {
        let log = "============================= test session starts ==============================\n\
                   ==================== 442 passed, 2 xpassed in 50.65 seconds ====================";
        let report = analyze_log(log);
        assert_eq!(report.num_tests_run, Some(444));
        // 444 run - 0 failed - 2 xpassed = 442 genuinely ok.
        assert_eq!(report.num_tests_ok, Some(442));
    }

    #[test]
    fn test_verbose_failure_headers_keyed_by_progress_lines() {
        let log = "============================= test session starts ==============================\n\
                   tests/h/oauth/jwt_grant_token_test.py ...F......\n\
                   ================================== FAILURES ===================================\n\
                   _____________________ TestJWTGrantToken.test_expiry _____________________\n\
                   ==== 1 failed, 9 passed in 2.28s ====";
        let report = analyze_log(log);
        assert_eq!(
            report.tests_failed,
            vec!["tests.h.oauth.jwt_grant_token_test::TestJWTGrantToken::test_expiry"]
        );
    }

    #[test]
    fn test_xfailures_banner_suppresses_headers() {
        let log = "============================= test session starts ==============================\n\
                   =============================== XFAILURES ===============================\n\
                   _____________________ TestThing.test_known_bad _____________________\n\
                   ==== 3 passed, 1 xfailed in 1.0s ====";
        let report = analyze_log(log);
        assert!(report.tests_failed.is_empty());
        assert_eq!(report.num_tests_run, Some(4));
        assert_eq!(report.did_tests_fail, Some(false));
    }

    #[test]
    fn test_error_collecting_file() {
        let log = "============================= test session starts ==============================\n\
                   _______________ ERROR collecting test/unittests/tts/test_tts.py ________________\n\
                   ==== 1 error in 0.5s ====";
        let report = analyze_log(log);
        assert_eq!(report.tests_failed, vec!["(test.unittests.tts.test_tts)"]);
    }

    #[test]
    fn test_nose_import_error() {
        let log = "ERROR: Failure: ImportError (No module named 'six')\n\
                   Ran 1 test in 0.001s\n\
                   FAILED (errors=1)";
        let report = analyze_log(log);
        assert!(report
            .tests_failed
            .contains(&"ImportError".to_string()));
        assert_eq!(report.did_tests_fail, Some(true));
    }
}
