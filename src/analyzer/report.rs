use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// The overall result of a build as inferred from its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Ok,
    Broken,
    Cancelled,
    Stopped,
    Terminated,
    Unknown,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Ok => "ok",
            BuildStatus::Broken => "broken",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::Stopped => "stopped",
            BuildStatus::Terminated => "terminated",
            BuildStatus::Unknown => "unknown",
        }
    }

    pub fn from_exit_code(code: i64) -> Self {
        if code == 0 {
            BuildStatus::Ok
        } else {
            BuildStatus::Broken
        }
    }
}

/// Per-job accumulator filled opportunistically during log analysis.
///
/// Fields are optional because most logs only yield a subset; the output
/// emitter performs the one-shot normalization (missing numeric run/failed
/// counts default to 0, everything else to the string `NA`, lists join with
/// `#`).
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub job_id: String,
    pub build_id: Option<String>,
    pub primary_language: Option<String>,
    pub status: Option<BuildStatus>,
    pub setup_time_before_build: Option<f64>,
    pub analyzer: String,
    pub build_system: Option<String>,
    pub frameworks: Vec<String>,
    pub tests_run: bool,
    pub did_tests_fail: Option<bool>,
    pub num_tests_run: Option<i64>,
    pub num_tests_failed: Option<i64>,
    pub num_tests_ok: Option<i64>,
    pub num_tests_skipped: Option<i64>,
    pub tests_failed: Vec<String>,
    pub test_duration: Option<f64>,
    pub pure_build_duration: Option<f64>,
    pub err_msg: Vec<String>,
    pub err_lines: Vec<String>,
    pub connection_lines: Vec<String>,
    pub could_not_resolve_dep: Option<String>,
    pub build_image: Option<String>,
    pub worker_instance: Option<String>,
    pub using_worker: Option<String>,
    pub os: Option<String>,
    pub cookbook: Option<String>,
    pub invalid_log: Option<String>,

    // Expected-failure bookkeeping (pytest). Subtracted from num_tests_ok
    // during finalization and never emitted.
    pub num_tests_xfailed: i64,
    pub num_tests_xpassed: i64,

    initialized_tests: bool,
}

impl AnalysisReport {
    pub fn new(job_id: &str, analyzer: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            analyzer: analyzer.to_string(),
            ..Default::default()
        }
    }

    /// Pre-init the four counters and the duration so aggregated test
    /// sessions can sum up. Idempotent; pair every use with
    /// [`AnalysisReport::uninit_ok_tests`] before emitting.
    pub fn init_tests(&mut self) {
        if !self.initialized_tests {
            self.test_duration = Some(0.0);
            self.num_tests_run = Some(0);
            self.num_tests_failed = Some(0);
            self.num_tests_ok = Some(0);
            self.num_tests_skipped = Some(0);
            self.initialized_tests = true;
        }
    }

    pub fn tests_initialized(&self) -> bool {
        self.initialized_tests
    }

    /// Convert the aggregated counters to non-aggregated reporting:
    /// `ok += run - failed`.
    pub fn uninit_ok_tests(&mut self) {
        if let (Some(run), Some(failed)) = (self.num_tests_run, self.num_tests_failed) {
            if let Some(ok) = self.num_tests_ok.as_mut() {
                *ok += run - failed;
            }
        }
    }

    /// Record a detected test framework; duplicates are ignored.
    pub fn add_framework(&mut self, framework: &str) {
        if !self.frameworks.iter().any(|f| f == framework) {
            self.frameworks.push(framework.to_string());
        }
    }

    /// The shared rule for `tr_log_bool_tests_failed`: any captured failing
    /// test name or a positive failure count.
    pub fn default_did_tests_fail(&self) -> bool {
        !self.tests_failed.is_empty() || self.num_tests_failed.is_some_and(|n| n > 0)
    }

    /// Last-second invariant enforcement before output: a build duration
    /// shorter than the test duration is bogus and gets dropped.
    pub fn sanitize(&mut self) {
        if let (Some(build), Some(test)) = (self.pure_build_duration, self.test_duration) {
            if build < test {
                self.pure_build_duration = None;
            }
        }
    }

    /// Produce the flat result mapping with the exact output keys.
    pub fn output(&self) -> ReportMap {
        let mut out = IndexMap::new();
        out.insert("tr_build_id".into(), opt_str(&self.build_id));
        out.insert("tr_job_id".into(), json!(self.job_id));
        out.insert("tr_log_lan".into(), opt_str(&self.primary_language));
        out.insert(
            "tr_log_status".into(),
            self.status
                .map(|s| json!(s.as_str()))
                .unwrap_or_else(|| json!("NA")),
        );
        out.insert("tr_log_setup_time".into(), opt_num(self.setup_time_before_build));
        out.insert("tr_log_analyzer".into(), json!(self.analyzer));
        out.insert("tr_log_frameworks".into(), json!(self.frameworks.join("#")));
        out.insert("tr_log_bool_tests_ran".into(), json!(self.tests_run));
        out.insert(
            "tr_log_bool_tests_failed".into(),
            self.did_tests_fail
                .map(|b| json!(b))
                .unwrap_or_else(|| json!("NA")),
        );
        out.insert("tr_log_num_tests_ok".into(), opt_int_na(self.num_tests_ok));
        out.insert(
            "tr_log_num_tests_failed".into(),
            json!(self.num_tests_failed.unwrap_or(0)),
        );
        out.insert(
            "tr_log_num_tests_run".into(),
            json!(self.num_tests_run.unwrap_or(0)),
        );
        out.insert(
            "tr_log_num_tests_skipped".into(),
            opt_int_na(self.num_tests_skipped),
        );
        out.insert("tr_log_tests_failed".into(), json!(self.tests_failed.join("#")));
        out.insert("tr_log_testduration".into(), opt_num(self.test_duration));
        out.insert("tr_log_buildduration".into(), opt_num(self.pure_build_duration));
        out.insert("tr_err_msg".into(), json!(self.err_msg.join("#")));
        out.insert("tr_build_image".into(), opt_str(&self.build_image));
        out.insert("tr_worker_instance".into(), opt_str(&self.worker_instance));
        out.insert("tr_using_worker".into(), opt_str(&self.using_worker));
        out.insert("tr_os".into(), opt_str(&self.os));
        out.insert(
            "tr_connection_lines".into(),
            json!(self.connection_lines.join("#")),
        );
        out.insert(
            "tr_could_not_resolve_dep".into(),
            opt_str(&self.could_not_resolve_dep),
        );
        out.insert("tr_cookbook".into(), opt_str(&self.cookbook));
        out.insert("tr_invalid_log".into(), opt_str(&self.invalid_log));
        out.insert("tr_build_system".into(), opt_str(&self.build_system));
        out
    }
}

/// The flat analysis result keyed by the `tr_*` attribute names, in their
/// canonical order.
pub type ReportMap = IndexMap<String, Value>;

fn opt_str(v: &Option<String>) -> Value {
    match v {
        Some(s) => json!(s),
        None => json!("NA"),
    }
}

fn opt_num(v: Option<f64>) -> Value {
    match v {
        Some(n) => json!(n),
        None => json!("NA"),
    }
}

fn opt_int_na(v: Option<i64>) -> Value {
    match v {
        Some(n) => json!(n),
        None => json!("NA"),
    }
}

static PLAIN_SECONDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(.+)s").unwrap());

/// Parse durations like `12.34s`; the output is in seconds even when the
/// input took longer than a minute.
pub fn convert_plain_time_to_seconds(s: &str) -> f64 {
    if let Some(caps) = PLAIN_SECONDS.captures(s) {
        if let Ok(v) = caps[1].trim().parse::<f64>() {
            return (v * 100.0).round() / 100.0;
        }
    }
    0.0
}

/// Strip ANSI escape sequences, which otherwise break the line regexes.
pub fn strip_ansi(line: &str) -> String {
    static ANSI_ESCAPE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\x1B[@-_][0-?]*[ -/]*[@-~]").unwrap());
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tests_is_idempotent() {
        let mut report = AnalysisReport::new("1", "java-maven");
        report.init_tests();
        report.num_tests_run = Some(10);
        report.init_tests();
        assert_eq!(report.num_tests_run, Some(10));
    }

    #[test]
    fn test_uninit_ok_tests() {
        let mut report = AnalysisReport::new("1", "java-maven");
        report.init_tests();
        report.num_tests_run = Some(10);
        report.num_tests_failed = Some(3);
        report.uninit_ok_tests();
        assert_eq!(report.num_tests_ok, Some(7));
    }

    #[test]
    fn test_add_framework_dedupes() {
        let mut report = AnalysisReport::new("1", "java-maven");
        report.add_framework("JUnit");
        report.add_framework("JUnit");
        report.add_framework("testng");
        assert_eq!(report.frameworks, vec!["JUnit", "testng"]);
    }

    #[test]
    fn test_sanitize_drops_short_build_duration() {
        let mut report = AnalysisReport::new("1", "java-maven");
        report.test_duration = Some(30.0);
        report.pure_build_duration = Some(10.0);
        report.sanitize();
        assert_eq!(report.pure_build_duration, None);

        report.test_duration = Some(30.0);
        report.pure_build_duration = Some(45.0);
        report.sanitize();
        assert_eq!(report.pure_build_duration, Some(45.0));
    }

    #[test]
    fn test_output_defaults() {
        let report = AnalysisReport::new("12345", "plain");
        let out = report.output();
        assert_eq!(out["tr_job_id"], json!("12345"));
        assert_eq!(out["tr_log_num_tests_run"], json!(0));
        assert_eq!(out["tr_log_num_tests_failed"], json!(0));
        assert_eq!(out["tr_log_num_tests_ok"], json!("NA"));
        assert_eq!(out["tr_log_num_tests_skipped"], json!("NA"));
        assert_eq!(out["tr_log_status"], json!("NA"));
        assert_eq!(out["tr_log_bool_tests_ran"], json!(false));
        assert_eq!(out["tr_log_tests_failed"], json!(""));
        assert_eq!(out.len(), 26);
    }

    #[test]
    fn test_output_joins_lists_with_hash() {
        let mut report = AnalysisReport::new("1", "python");
        report.tests_failed = vec!["t.a::x".into(), "t.b::y".into()];
        let out = report.output();
        assert_eq!(out["tr_log_tests_failed"], json!("t.a::x#t.b::y"));
        // Round trip: splitting restores the list.
        let joined = out["tr_log_tests_failed"].as_str().unwrap();
        let split: Vec<&str> = joined.split('#').collect();
        assert_eq!(split, vec!["t.a::x", "t.b::y"]);
    }

    #[test]
    fn test_counter_invariant_holds_after_uninit() {
        let mut report = AnalysisReport::new("1", "java-gradle");
        report.init_tests();
        report.num_tests_run = Some(182);
        report.num_tests_failed = Some(5);
        report.num_tests_skipped = Some(1);
        report.uninit_ok_tests();
        let ok = report.num_tests_ok.unwrap();
        let failed = report.num_tests_failed.unwrap();
        let skipped = report.num_tests_skipped.unwrap();
        assert!(ok + failed + skipped <= report.num_tests_run.unwrap() + skipped);
        assert_eq!(ok, 177);
    }

    #[test]
    fn test_convert_plain_time() {
        assert_eq!(convert_plain_time_to_seconds("0.005s"), 0.01);
        assert_eq!(convert_plain_time_to_seconds("123.4s"), 123.4);
        assert_eq!(convert_plain_time_to_seconds("garbage"), 0.0);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31m[ERROR]\x1b[0m boom"), "[ERROR] boom");
    }
}
