//! Attribute-by-attribute comparison of a reproduced analysis against the
//! original one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::report::ReportMap;

/// Durations and environment facts never reproduce exactly and are excluded
/// from matching.
const IGNORED_ATTRIBUTES: &[&str] = &[
    "tr_log_testduration",
    "tr_log_buildduration",
    "tr_log_setup_time",
    "tr_err_msg",
    "tr_build_image",
    "tr_worker_instance",
    "tr_connection_lines",
    "tr_using_worker",
    "tr_could_not_resolve_dep",
    "tr_os",
    "tr_cookbook",
];

const DURATION_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MismatchedAttribute {
    pub attr: String,
    pub reproduced: Value,
    pub orig: Value,
}

/// Compare every attribute of `original` against `reproduced`.
///
/// The failing-test lists compare as multisets; numeric values match within
/// a small epsilon. Returns the overall verdict and the mismatched
/// attributes with both sides' values.
pub fn compare_attributes(
    reproduced: &ReportMap,
    original: &ReportMap,
    ignore_status: bool,
) -> (bool, Vec<MismatchedAttribute>) {
    let mut matched = true;
    let mut mismatched_attributes = Vec::new();

    for (attr, orig_value) in original {
        if attr == "tr_log_tests_failed" {
            let reproduced_tests = split_tests(reproduced.get(attr));
            let original_tests = split_tests(Some(orig_value));

            if reproduced_tests != original_tests {
                matched = false;
                let only_reproduced: Vec<&String> = reproduced_tests
                    .iter()
                    .filter(|t| !original_tests.contains(*t))
                    .collect();
                let only_orig: Vec<&String> = original_tests
                    .iter()
                    .filter(|t| !reproduced_tests.contains(*t))
                    .collect();
                mismatched_attributes.push(MismatchedAttribute {
                    attr: attr.clone(),
                    reproduced: serde_json::json!(only_reproduced),
                    orig: serde_json::json!(only_orig),
                });
            }
            continue;
        }

        if IGNORED_ATTRIBUTES.contains(&attr.as_str()) {
            continue;
        }
        if ignore_status && attr == "tr_log_status" {
            continue;
        }

        let reproduced_value = reproduced.get(attr).unwrap_or(&Value::Null);
        if !values_match(reproduced_value, orig_value) {
            matched = false;
            mismatched_attributes.push(MismatchedAttribute {
                attr: attr.clone(),
                reproduced: reproduced_value.clone(),
                orig: orig_value.clone(),
            });
        }
    }

    (matched, mismatched_attributes)
}

/// Split a `#`-joined failing-test list into a sorted multiset.
fn split_tests(value: Option<&Value>) -> Vec<String> {
    let joined = value.and_then(Value::as_str).unwrap_or("");
    if joined.is_empty() {
        return Vec::new();
    }
    let mut tests: Vec<String> = joined.split('#').map(str::to_string).collect();
    tests.sort();
    tests
}

fn values_match(reproduced: &Value, orig: &Value) -> bool {
    if let (Some(a), Some(b)) = (reproduced.as_f64(), orig.as_f64()) {
        return (a - b).abs() <= DURATION_EPSILON;
    }
    reproduced == orig
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::report::AnalysisReport;
    use serde_json::json;

    fn report_with(failed: &[&str], num_failed: i64) -> ReportMap {
        let mut report = AnalysisReport::new("1", "java-maven");
        report.init_tests();
        report.num_tests_run = Some(10);
        report.num_tests_failed = Some(num_failed);
        report.tests_failed = failed.iter().map(|s| s.to_string()).collect();
        report.uninit_ok_tests();
        report.output()
    }

    #[test]
    fn test_identical_reports_match() {
        let a = report_with(&["t1(C)"], 1);
        let b = report_with(&["t1(C)"], 1);
        let (matched, mismatches) = compare_attributes(&a, &b, false);
        assert!(matched);
        assert!(mismatches.is_empty());
    }

    #[test]
    fn test_failing_test_order_is_irrelevant() {
        let a = report_with(&["t1(C)", "t2(C)"], 2);
        let b = report_with(&["t2(C)", "t1(C)"], 2);
        let (matched, _) = compare_attributes(&a, &b, false);
        assert!(matched);
    }

    #[test]
    fn test_failing_test_multiset_differs() {
        let a = report_with(&["t1(C)"], 1);
        let b = report_with(&["t3(C)"], 1);
        let (matched, mismatches) = compare_attributes(&a, &b, false);
        assert!(!matched);
        let mismatch = &mismatches[0];
        assert_eq!(mismatch.attr, "tr_log_tests_failed");
        assert_eq!(mismatch.reproduced, json!(["t1(C)"]));
        assert_eq!(mismatch.orig, json!(["t3(C)"]));
    }

    #[test]
    fn test_ignored_attributes_do_not_mismatch() {
        let a = report_with(&[], 0);
        let mut b = report_with(&[], 0);
        b.insert("tr_log_testduration".into(), json!(99.0));
        b.insert("tr_os".into(), json!("jammy"));
        let (matched, _) = compare_attributes(&a, &b, false);
        assert!(matched);
    }

    #[test]
    fn test_count_mismatch_is_reported() {
        let a = report_with(&[], 0);
        let b = report_with(&[], 2);
        let (matched, mismatches) = compare_attributes(&a, &b, false);
        assert!(!matched);
        assert!(mismatches
            .iter()
            .any(|m| m.attr == "tr_log_num_tests_failed"));
    }

    #[test]
    fn test_ignore_status_flag() {
        let mut a = report_with(&[], 0);
        let b = report_with(&[], 0);
        a.insert("tr_log_status".into(), json!("broken"));
        let (matched, _) = compare_attributes(&a, &b, true);
        assert!(matched);
        let (matched, _) = compare_attributes(&a, &b, false);
        assert!(!matched);
    }

    #[test]
    fn test_numeric_epsilon() {
        let mut a = report_with(&[], 0);
        let mut b = report_with(&[], 0);
        a.insert("tr_log_num_tests_run".into(), json!(10.0));
        b.insert("tr_log_num_tests_run".into(), json!(10.005));
        let (matched, _) = compare_attributes(&a, &b, false);
        assert!(matched);
    }
}
