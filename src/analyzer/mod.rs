//! The CI build-log analyzer: fold tokenization, language detection, a
//! specialized parser per (language, build system), and result comparison.

pub mod base;
pub mod comparer;
pub mod dispatch;
pub mod folds;
pub mod java_ant;
pub mod java_gradle;
pub mod java_maven;
pub mod java_other;
pub mod javascript;
pub mod language;
pub mod python;
pub mod report;

use std::path::Path;

use crate::database::DatabaseClient;
use crate::error::Result;
use comparer::MismatchedAttribute;
use dispatch::Dispatcher;
use report::ReportMap;

/// High-level entry point combining the dispatcher and the comparer.
pub struct Analyzer {
    dispatcher: Dispatcher,
}

impl Analyzer {
    pub fn new(github_tokens: &[String]) -> Self {
        Self {
            dispatcher: Dispatcher::new(github_tokens),
        }
    }

    /// Attach the metadata database used as the last-resort build-system
    /// source when not mining.
    pub fn with_database(github_tokens: &[String], database: DatabaseClient) -> Self {
        Self {
            dispatcher: Dispatcher::new(github_tokens).with_database(database),
        }
    }

    pub async fn analyze_single_log(
        &self,
        log_path: &Path,
        job_id: &str,
        build_system: Option<&str>,
        trigger_sha: Option<&str>,
        repo: Option<&str>,
    ) -> Result<ReportMap> {
        self.dispatcher
            .analyze(log_path, job_id, build_system, trigger_sha, repo, false)
            .await
    }

    /// Analyze both logs and compare the results attribute by attribute.
    #[allow(clippy::too_many_arguments)]
    pub async fn compare_single_log(
        &self,
        reproduced: &Path,
        orig: &Path,
        job_id: &str,
        build_system: Option<&str>,
        trigger_sha: Option<&str>,
        repo: Option<&str>,
    ) -> Result<(bool, Vec<MismatchedAttribute>)> {
        let reproduced_result = self
            .analyze_single_log(reproduced, job_id, build_system, trigger_sha, repo)
            .await?;
        let original_result = self
            .analyze_single_log(orig, job_id, build_system, trigger_sha, repo)
            .await?;
        Ok(comparer::compare_attributes(
            &reproduced_result,
            &original_result,
            false,
        ))
    }

    /// Re-analyze a log known to come from a Java job, bypassing language
    /// detection.
    pub async fn force_re_analyze_java_log(
        &self,
        orig: &Path,
        job_id: &str,
        build_system: Option<&str>,
        trigger_sha: Option<&str>,
        repo: Option<&str>,
    ) -> Result<ReportMap> {
        self.dispatcher
            .analyze(orig, job_id, build_system, trigger_sha, repo, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_log(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    const SEP: &str = "-------------------------------------------------------";

    #[tokio::test]
    async fn test_maven_junit_failure_end_to_end() {
        let log = format!(
            "travis_fold:start:system_info\n\
             Build language: java\n\
             Codename:\ttrusty\n\
             travis_fold:end:system_info\n\
             $ mvn clean install -B\n\
             {SEP}\n T E S T S\n{SEP}\n\
             Running com.alibaba.fastjson2.JSONReaderStrTest\n\
             Failed tests:   test_UUID(com.alibaba.fastjson2.JSONReaderStrTest)\n\
             \n\
             Tests run: 2731, Failures: 1, Errors: 0, Skipped: 0\n\
             {SEP}\n\
             Done. Your build exited with 1.\n"
        );
        let file = write_log(&log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "2295120025", Some("maven"), None, None)
            .await
            .unwrap();

        assert_eq!(result["tr_log_status"], json!("broken"));
        assert_eq!(result["tr_log_analyzer"], json!("java-maven"));
        assert_eq!(result["tr_log_frameworks"], json!("JUnit"));
        assert_eq!(result["tr_log_num_tests_run"], json!(2731));
        assert_eq!(result["tr_log_num_tests_ok"], json!(2730));
        assert_eq!(result["tr_log_num_tests_failed"], json!(1));
        assert_eq!(result["tr_log_num_tests_skipped"], json!(0));
        assert_eq!(
            result["tr_log_tests_failed"],
            json!("test_UUID(com.alibaba.fastjson2.JSONReaderStrTest)")
        );
        assert_eq!(result["tr_os"], json!("trusty"));
        assert_eq!(result["tr_build_system"], json!("Maven"));
    }

    #[tokio::test]
    async fn test_gradle_summary_end_to_end() {
        let log = "2022-04-01T10:00:00.0000000Z Requested labels: ubuntu-20.04\n\
                   2022-04-01T10:00:01.0000000Z ##[group]Run ./gradlew check\n\
                   2022-04-01T10:00:02.0000000Z ./gradlew check\n\
                   2022-04-01T10:00:03.0000000Z ##[endgroup]\n\
                   2022-04-01T10:00:04.0000000Z > Task :test\n\
                   2022-04-01T10:00:05.0000000Z 182 tests completed, 5 failed, 1 skipped\n\
                   2022-04-01T10:00:06.0000000Z BUILD FAILED in 2m 11s\n\
                   2022-04-01T10:00:07.0000000Z ##[error]Process completed with exit code 1.\n";
        let file = write_log(log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "2063953546", Some("gradle"), None, None)
            .await
            .unwrap();

        assert_eq!(result["tr_log_status"], json!("broken"));
        assert_eq!(result["tr_log_analyzer"], json!("java-gradle"));
        assert_eq!(result["tr_log_num_tests_run"], json!(182));
        assert_eq!(result["tr_log_num_tests_ok"], json!(177));
        assert_eq!(result["tr_log_num_tests_failed"], json!(5));
        assert_eq!(result["tr_log_num_tests_skipped"], json!(1));
    }

    #[tokio::test]
    async fn test_ant_testcase_end_to_end() {
        let log = "2022-06-01T10:00:00.0000000Z ##[group]Run ant test\n\
                   2022-06-01T10:00:01.0000000Z ant test\n\
                   2022-06-01T10:00:02.0000000Z ##[endgroup]\n\
                   2022-06-01T10:00:02.1000000Z [javac] Compiling 12 source files\n\
                   2022-06-01T10:00:02.2000000Z [javac] warning: java uses unchecked operations\n\
                   2022-06-01T10:00:02.3000000Z [javac] note: see java documentation\n\
                   2022-06-01T10:00:02.4000000Z [javac] building java classes\n\
                   2022-06-01T10:00:02.5000000Z [javac] java target 11\n\
                   2022-06-01T10:00:02.6000000Z [javac] java source 11\n\
                   2022-06-01T10:00:02.7000000Z [javac] java modules off\n\
                   2022-06-01T10:00:02.8000000Z [javac] java warnings on\n\
                   2022-06-01T10:00:02.9000000Z [javac] java deprecation off\n\
                   2022-06-01T10:00:02.9500000Z [javac] java release 11\n\
                   2022-06-01T10:00:03.0000000Z [junit] Testsuite: abstraction.FiliereParDefaultTest\n\
                   2022-06-01T10:00:04.0000000Z [junit] Testcase: testNext took 0.005 sec\n\
                   2022-06-01T10:00:05.0000000Z \tFAILED\n\
                   2022-06-01T10:00:06.0000000Z [junit] Tests run: 1, Failures: 1, Errors: 0, Time elapsed: 0.1 sec\n\
                   2022-06-01T10:00:07.0000000Z ##[error]Process completed with exit code 1.\n";
        let file = write_log(log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "2420748513", Some("ant"), None, None)
            .await
            .unwrap();

        assert_eq!(result["tr_log_analyzer"], json!("java-ant"));
        assert_eq!(result["tr_log_num_tests_run"], json!(1));
        assert_eq!(result["tr_log_num_tests_ok"], json!(0));
        assert_eq!(result["tr_log_num_tests_failed"], json!(1));
        assert_eq!(result["tr_log_frameworks"], json!("JUnit"));
        assert_eq!(
            result["tr_log_tests_failed"],
            json!("abstraction.FiliereParDefaultTest.testNext")
        );
    }

    #[tokio::test]
    async fn test_pytest_short_summary_end_to_end() {
        let log = "2022-05-09T15:18:04.1058603Z Requested labels: ubuntu-18.04\n\
                   2022-05-09T15:18:05.1058603Z ##[group]Run pytest -v\n\
                   2022-05-09T15:18:06.1058603Z pytest -v\n\
                   2022-05-09T15:18:07.1058603Z ##[endgroup]\n\
                   2022-05-09T15:18:08.1058603Z ============================= test session starts ==============================\n\
                   2022-05-09T15:18:09.1058603Z =========================== short test summary info ============================\n\
                   2022-05-09T15:18:10.1058603Z FAILED gammapy/irf/psf/tests/test_parametric.py::test_psf_king_containment_radius\n\
                   2022-05-09T15:18:11.1058603Z ==== 1 failed, 1956 passed in 541.28s (0:09:01) ====\n\
                   2022-05-09T15:18:12.1058603Z ##[error]Process completed with exit code 1.\n";
        let file = write_log(log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "2283578153", None, None, None)
            .await
            .unwrap();

        assert_eq!(result["tr_log_analyzer"], json!("python"));
        assert_eq!(result["tr_log_frameworks"], json!("pytest"));
        assert_eq!(result["tr_log_num_tests_run"], json!(1957));
        assert_eq!(result["tr_log_num_tests_failed"], json!(1));
        assert_eq!(
            result["tr_log_tests_failed"],
            json!("gammapy.irf.psf.tests.test_parametric::test_psf_king_containment_radius")
        );
    }

    #[tokio::test]
    async fn test_mocha_end_to_end() {
        let log = "2022-07-01T10:00:00.0000000Z Requested labels: ubuntu-18.04\n\
                   2022-07-01T10:00:01.0000000Z ##[group]Run npm test\n\
                   2022-07-01T10:00:02.0000000Z npm test\n\
                   2022-07-01T10:00:03.0000000Z ##[endgroup]\n\
                   2022-07-01T10:00:04.0000000Z   634 passing (2m)\n\
                   2022-07-01T10:00:05.0000000Z   1 failing\n\
                   2022-07-01T10:00:06.0000000Z \n\
                   2022-07-01T10:00:07.0000000Z   1) shared.ops.scoreTask scores\n\
                   2022-07-01T10:00:08.0000000Z        does not modify stats when task need approval:\n\
                   2022-07-01T10:00:09.0000000Z ##[error]Process completed with exit code 1.\n";
        let file = write_log(log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "2536167204", None, None, None)
            .await
            .unwrap();

        assert_eq!(result["tr_log_analyzer"], json!("javascript"));
        assert_eq!(result["tr_log_frameworks"], json!("mocha"));
        assert_eq!(result["tr_log_num_tests_run"], json!(635));
        assert_eq!(result["tr_log_num_tests_ok"], json!(634));
        assert_eq!(result["tr_log_num_tests_failed"], json!(1));
        let failed = result["tr_log_tests_failed"].as_str().unwrap();
        assert!(
            failed.starts_with("shared.ops.scoreTask scores does not modify stats when task need approval")
        );
    }

    #[tokio::test]
    async fn test_unsupported_language_yields_non_analyzed() {
        let log = "travis_fold:start:system_info\n\
                   Build language: ruby\n\
                   travis_fold:end:system_info\n\
                   Done. Your build exited with 0.\n";
        let file = write_log(log);
        let analyzer = Analyzer::new(&[]);
        let result = analyzer
            .analyze_single_log(file.path(), "99", None, None, None)
            .await
            .unwrap();
        assert_eq!(result["not_in_supported_language"], json!(true));
        assert_eq!(result["tr_log_lan"], json!("ruby"));
    }

    #[tokio::test]
    async fn test_compare_reproduced_against_original() {
        let orig = "travis_fold:start:system_info\n\
                    Build language: python\n\
                    travis_fold:end:system_info\n\
                    Ran 3 tests in 0.000s\n\
                    \n\
                    FAILED (failures=1)\n\
                    FAIL: test_em (__main__.TestMarkdownPy)\n\
                    Done. Your build exited with 1.\n";
        let matching = orig;
        let orig_file = write_log(orig);
        let reproduced_file = write_log(matching);
        let analyzer = Analyzer::new(&[]);
        let (matched, mismatches) = analyzer
            .compare_single_log(reproduced_file.path(), orig_file.path(), "7", None, None, None)
            .await
            .unwrap();
        assert!(matched, "mismatches: {:?}", mismatches);
    }
}
