//! Extractors shared by every specialized analyzer: build status, setup
//! time, operating system, connection problems, and the Travis-only worker
//! and cookbook facts. Each comes in a Travis and a GitHub Actions variant
//! where the log dialects differ.

use once_cell::sync::Lazy;
use regex::Regex;

use super::folds::{Folds, OUT_OF_FOLD};
use super::report::{AnalysisReport, BuildStatus};

const LOG_NOT_FOUND_LINE: &str =
    "<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message><Key>";

const CONNECTION_TERMS: &[&str] = &[
    "getRepositorySession()",
    "Can't get http",
    "404 Not Found",
    "Failed to fetch",
    "MockWebServer",
    "ssl.SSL",
    "Received request:",
    "Unauthorized.",
    "Failed to connect",
    "Connection refused",
    "SocketTimeOut",
    "failed to upload",
    "the requested URL returned error",
    "unknown host",
];

const GHA_CONNECTION_TERMS_EXTRA: &[&str] = &["Server Error:"];

const GHA_DEP_TERMS: &[&str] = &[
    "could not resolve dependencies",                       // Java
    "> could not find",                                     // Java
    "could not resolve plugin",                             // Java
    "one of its dependencies could not be resolved",        // Java
    "could not resolve dependency",                         // Javascript
    "non-resolvable import",                                // Python
    "installing build dependencies ... error",              // Python
    "could not find a version that satisfies the requirement", // Python
];

/// Iterate every fold's content in first-appearance order, which tracks the
/// order of the underlying log closely enough for section parsers.
pub fn get_job_lines(folds: &Folds) -> impl Iterator<Item = &String> {
    folds.values().flat_map(|f| f.content.iter())
}

// ---------------------------------------------------------------------------
// Travis variants
// ---------------------------------------------------------------------------

pub fn check_is_invalid_log(folds: &Folds, report: &mut AnalysisReport) {
    let content = &folds[OUT_OF_FOLD].content;
    if content.len() > 1 && content[1].contains(LOG_NOT_FOUND_LINE) {
        report.invalid_log = Some(content[1].trim().to_string());
    }
}

pub fn get_using_worker(folds: &Folds, report: &mut AnalysisReport) {
    if let Some(line) = folds[OUT_OF_FOLD].content.first() {
        if line.contains("Using worker: ") {
            report.using_worker = Some(line[14..].trim().to_string());
        }
    }
}

pub fn get_worker_instance(folds: &Folds, report: &mut AnalysisReport) {
    let Some(fold) = folds.get("worker_info") else {
        return;
    };
    for line in &fold.content {
        if line.contains("instance: ") {
            if let Some(instance) = line.trim().split(": ").nth(1) {
                report.worker_instance = Some(instance.to_string());
            }
            return;
        }
    }
}

pub fn get_build_image_provision_datetime(folds: &Folds, report: &mut AnalysisReport) {
    let Some(fold) = folds.get("system_info") else {
        return;
    };
    let mut found_provision = false;
    for line in &fold.content {
        if line.contains("Build image provisioning date and time") {
            found_provision = true;
            continue;
        }
        if found_provision {
            report.build_image = Some(line.trim().to_string());
            return;
        }
    }
}

pub fn get_cookbook_version(folds: &Folds, report: &mut AnalysisReport) {
    let Some(fold) = folds.get("system_info") else {
        return;
    };
    let mut found_version = false;
    for line in &fold.content {
        if line.contains("Cookbooks Version") {
            found_version = true;
            continue;
        }
        if found_version {
            report.cookbook = Some(line.trim().to_string());
            return;
        }
    }
}

pub fn get_os_travis(folds: &Folds, report: &mut AnalysisReport) {
    let Some(fold) = folds.get("system_info") else {
        return;
    };
    for line in &fold.content {
        if line.contains("Codename:") {
            report.os = Some(line[9..].trim().to_string());
            return;
        }
    }
}

static DONE_BUILD_EXITED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Done\. Your build exited with (\d*)").unwrap());
static DONE_SCRIPT_EXITED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Done\. Build script exited with (\d*)").unwrap());
static COMMAND_EXITED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^The command (.*) exited with (\d*)\.").unwrap());

pub fn analyze_status_travis(folds: &Folds, report: &mut AnalysisReport) {
    report.status = Some(BuildStatus::Unknown);

    let out_of_fold = &folds[OUT_OF_FOLD].content;
    if out_of_fold.is_empty() {
        log::error!("The log file is empty.");
        return;
    }

    let start = out_of_fold.len().saturating_sub(10);
    for line in &out_of_fold[start..] {
        for re in [&*DONE_BUILD_EXITED, &*DONE_SCRIPT_EXITED] {
            if let Some(caps) = re.captures(line) {
                if let Ok(code) = caps[1].parse::<i64>() {
                    report.status = Some(BuildStatus::from_exit_code(code));
                    return;
                }
            }
        }
    }

    for fold in folds.values() {
        for line in &fold.content {
            if line.contains("Done: Job Cancelled") {
                report.status = Some(BuildStatus::Cancelled);
                return;
            }
            if line.contains("Your build has been stopped") {
                report.status = Some(BuildStatus::Stopped);
                return;
            }
            if line.contains("The build has been terminated") {
                report.status = Some(BuildStatus::Terminated);
                return;
            }
        }
    }

    // Logs without an exit-status line sometimes end with a bare "The
    // command ... exited with N." line. Only the last non-empty line counts.
    for line in out_of_fold.iter().rev() {
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = COMMAND_EXITED.captures(line) {
            if let Ok(code) = caps[2].parse::<i64>() {
                report.status = Some(BuildStatus::from_exit_code(code));
            }
        }
        return;
    }
}

static TRAVIS_SETUP_FOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(system_info|git.checkout|services|before.install)").unwrap());

pub fn analyze_setup_time_travis(folds: &Folds, report: &mut AnalysisReport) {
    for (name, fold) in folds {
        if TRAVIS_SETUP_FOLD.is_match(name) {
            if let Some(duration) = fold.duration {
                *report.setup_time_before_build.get_or_insert(0.0) += duration;
            }
        }
    }
}

pub fn get_connection_lines_travis(folds: &Folds, report: &mut AnalysisReport) {
    for fold in folds.values() {
        for line in &fold.content {
            let lower = line.to_lowercase();
            if lower.contains("could not resolve dependencies") {
                report.could_not_resolve_dep = Some(line.trim().to_string());
            }
            for term in CONNECTION_TERMS {
                if lower.contains(&term.to_lowercase()) {
                    report.connection_lines.push(line.trim().to_string());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GitHub Actions variants
// ---------------------------------------------------------------------------

pub fn get_os_gha(folds: &Folds, report: &mut AnalysisReport) {
    let Some(fold) = folds.get("Operating System") else {
        return;
    };
    // The group body is three lines: distro name, release, "LTS".
    if fold.content.len() < 2 {
        return;
    }
    let release = &fold.content[1];
    let version_to_codename = [
        ("14.04", "trusty"),
        ("16.04", "xenial"),
        ("18.04", "bionic"),
        ("20.04", "focal"),
        ("22.04", "jammy"),
    ];
    let prefix: String = release.chars().take(5).collect();
    for (version, codename) in version_to_codename {
        if prefix == version {
            report.os = Some(codename.to_string());
            return;
        }
    }
}

static GHA_EXIT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^##\[error\]Process completed with exit code (\d*)\.").unwrap());
static GHA_FAILED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^##\[error\].*failed").unwrap());

pub fn analyze_status_gha(folds: &Folds, report: &mut AnalysisReport) {
    report.status = Some(BuildStatus::Unknown);

    if folds.values().all(|f| f.content.is_empty()) {
        log::error!("The log file is empty.");
        return;
    }

    for fold in folds.values() {
        for line in &fold.content {
            if line.contains("##[error]The operation was canceled.") {
                report.status = Some(BuildStatus::Cancelled);
                return;
            }
        }
    }

    // GitHub Actions only prints exit codes on error; the last error line in
    // out_of_fold decides, otherwise the build is ok.
    for line in folds[OUT_OF_FOLD].content.iter().rev() {
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = GHA_EXIT_CODE.captures(line) {
            if let Ok(code) = caps[1].parse::<i64>() {
                report.status = Some(BuildStatus::from_exit_code(code));
                return;
            }
        }
        if GHA_FAILED.is_match(line) {
            report.status = Some(BuildStatus::Broken);
            return;
        }
    }

    report.status = Some(BuildStatus::Ok);
}

static GHA_RUN_FOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Run ").unwrap());
static GHA_SETUP_ACTION_FOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Run [\w|-]+/[\w|-]+@v?\d+").unwrap());

/// Estimated setup time: sum of fold durations until the first user command.
/// Only Gradle has build actions; Maven and Ant builds enter their commands
/// directly, so any non-setup `Run` fold ends the setup region.
pub fn analyze_setup_time_gha(folds: &Folds, report: &mut AnalysisReport) {
    let mut setup_time = 0.0;
    for (name, fold) in folds {
        if GHA_RUN_FOLD.is_match(name) {
            let is_action = GHA_SETUP_ACTION_FOLD.is_match(name);
            let is_gradle_action =
                name.contains("gradle-build-action") || name.contains("gradle-command-action");
            if !is_action || is_gradle_action {
                break;
            }
        }
        if let Some(duration) = fold.duration {
            setup_time += duration;
        }
    }
    if setup_time > 0.0 && report.setup_time_before_build.is_none() {
        report.setup_time_before_build = Some((setup_time * 100.0).round() / 100.0);
    }
}

pub fn get_connection_lines_gha(folds: &Folds, report: &mut AnalysisReport) {
    for fold in folds.values() {
        for line in &fold.content {
            let lower = line.to_lowercase();
            for term in GHA_DEP_TERMS {
                if lower.contains(term) {
                    report.could_not_resolve_dep = Some(line.trim().to_string());
                }
            }
            for term in CONNECTION_TERMS.iter().chain(GHA_CONNECTION_TERMS_EXTRA) {
                if lower.contains(&term.to_lowercase()) {
                    report.connection_lines.push(line.trim().to_string());
                }
            }
        }
    }
}

/// Run the full set of Travis shared extractors in template order.
pub fn travis_common_analyze(folds: &Folds, report: &mut AnalysisReport) {
    check_is_invalid_log(folds, report);
    get_using_worker(folds, report);
    get_worker_instance(folds, report);
    get_build_image_provision_datetime(folds, report);
    get_os_travis(folds, report);
    get_cookbook_version(folds, report);
    analyze_status_travis(folds, report);
    analyze_setup_time_travis(folds, report);
    get_connection_lines_travis(folds, report);
}

/// Run the full set of GitHub Actions shared extractors in template order.
pub fn gha_common_analyze(folds: &Folds, report: &mut AnalysisReport) {
    get_os_gha(folds, report);
    analyze_setup_time_gha(folds, report);
    analyze_status_gha(folds, report);
    get_connection_lines_gha(folds, report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::folds::{split_gha, split_travis};

    fn travis_folds(text: &str) -> Folds {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        split_travis(&lines)
    }

    fn gha_folds(text: &str) -> Folds {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        split_gha(&lines, &[])
    }

    mod travis_status {
        use super::*;

        #[test]
        fn test_exit_zero_is_ok() {
            let folds = travis_folds("build output\nDone. Your build exited with 0.");
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_travis(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Ok));
        }

        #[test]
        fn test_exit_nonzero_is_broken() {
            let folds = travis_folds("build output\nDone. Build script exited with 1");
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_travis(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Broken));
        }

        #[test]
        fn test_only_last_ten_lines_considered() {
            let mut log = String::from("Done. Your build exited with 0.\n");
            for _ in 0..12 {
                log.push_str("filler\n");
            }
            let folds = travis_folds(&log);
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_travis(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Unknown));
        }

        #[test]
        fn test_cancelled_stopped_terminated() {
            for (marker, status) in [
                ("Done: Job Cancelled", BuildStatus::Cancelled),
                ("Your build has been stopped", BuildStatus::Stopped),
                ("The build has been terminated", BuildStatus::Terminated),
            ] {
                let folds = travis_folds(&format!("line\n{}\nline", marker));
                let mut report = AnalysisReport::new("1", "plain");
                analyze_status_travis(&folds, &mut report);
                assert_eq!(report.status, Some(status));
            }
        }

        #[test]
        fn test_trailing_command_exit_fallback() {
            let folds = travis_folds("output\nThe command \"mvn test\" exited with 2.");
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_travis(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Broken));
        }
    }

    mod gha_status {
        use super::*;

        #[test]
        fn test_no_error_is_ok() {
            let folds = gha_folds("##[group]Run ./gradlew build\nBUILD SUCCESSFUL\n##[endgroup]\ndone");
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_gha(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Ok));
        }

        #[test]
        fn test_exit_code_error() {
            let folds = gha_folds("output\n##[error]Process completed with exit code 1.");
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_gha(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Broken));
        }

        #[test]
        fn test_cancellation_wins() {
            let folds = gha_folds(
                "##[error]The operation was canceled.\n##[error]Process completed with exit code 1.",
            );
            let mut report = AnalysisReport::new("1", "plain");
            analyze_status_gha(&folds, &mut report);
            assert_eq!(report.status, Some(BuildStatus::Cancelled));
        }
    }

    mod setup_time {
        use super::*;
        use crate::analyzer::folds::Fold;

        #[test]
        fn test_travis_allowlist_sums_durations() {
            let mut folds = travis_folds("line");
            folds.insert(
                "system_info".into(),
                Fold {
                    content: vec![],
                    duration: Some(3.0),
                },
            );
            folds.insert(
                "git.checkout".into(),
                Fold {
                    content: vec![],
                    duration: Some(2.0),
                },
            );
            folds.insert(
                "custom_user_fold".into(),
                Fold {
                    content: vec![],
                    duration: Some(100.0),
                },
            );
            let mut report = AnalysisReport::new("1", "plain");
            analyze_setup_time_travis(&folds, &mut report);
            assert_eq!(report.setup_time_before_build, Some(5.0));
        }

        #[test]
        fn test_gha_stops_at_first_command() {
            let mut folds = Folds::new();
            folds.insert("out_of_fold".into(), Fold::default());
            folds.insert(
                "Run actions/setup-java@v2".into(),
                Fold {
                    content: vec![],
                    duration: Some(10.0),
                },
            );
            folds.insert(
                "Run ./gradlew build".into(),
                Fold {
                    content: vec![],
                    duration: Some(60.0),
                },
            );
            let mut report = AnalysisReport::new("1", "plain");
            analyze_setup_time_gha(&folds, &mut report);
            assert_eq!(report.setup_time_before_build, Some(10.0));
        }

        #[test]
        fn test_gha_gradle_action_counts_as_command() {
            let mut folds = Folds::new();
            folds.insert("out_of_fold".into(), Fold::default());
            folds.insert(
                "Run actions/checkout@v2".into(),
                Fold {
                    content: vec![],
                    duration: Some(4.0),
                },
            );
            folds.insert(
                "Run gradle/gradle-build-action@v2".into(),
                Fold {
                    content: vec![],
                    duration: Some(120.0),
                },
            );
            let mut report = AnalysisReport::new("1", "plain");
            analyze_setup_time_gha(&folds, &mut report);
            assert_eq!(report.setup_time_before_build, Some(4.0));
        }
    }

    mod extraction {
        use super::*;

        #[test]
        fn test_travis_os_codename() {
            let folds = travis_folds(
                "travis_fold:start:system_info\nCodename:\ttrusty\ntravis_fold:end:system_info",
            );
            let mut report = AnalysisReport::new("1", "plain");
            get_os_travis(&folds, &mut report);
            assert_eq!(report.os.as_deref(), Some("trusty"));
        }

        #[test]
        fn test_gha_os_codename() {
            let folds = gha_folds("##[group]Operating System\nUbuntu\n18.04.6\nLTS\n##[endgroup]");
            let mut report = AnalysisReport::new("1", "plain");
            get_os_gha(&folds, &mut report);
            assert_eq!(report.os.as_deref(), Some("bionic"));
        }

        #[test]
        fn test_connection_lines_and_dep_line() {
            let folds = gha_folds(
                "ok line\n\
                 [ERROR] Failed to execute goal: Could not resolve dependencies for project x\n\
                 curl: (7) Failed to connect to host",
            );
            let mut report = AnalysisReport::new("1", "plain");
            get_connection_lines_gha(&folds, &mut report);
            assert!(report
                .could_not_resolve_dep
                .as_deref()
                .unwrap()
                .contains("Could not resolve dependencies"));
            assert_eq!(report.connection_lines.len(), 1);
        }

        #[test]
        fn test_worker_and_cookbook() {
            let folds = travis_folds(
                "Using worker: worker-linux-docker-1.travisci.net:travis-linux-7\n\
                 travis_fold:start:system_info\n\
                 Cookbooks Version\n\
                 a9c1b2e\n\
                 Build image provisioning date and time\n\
                 Tue Dec  1 15:57:35 UTC 2015\n\
                 travis_fold:end:system_info\n\
                 travis_fold:start:worker_info\n\
                 instance: wjb-1\n\
                 travis_fold:end:worker_info",
            );
            let mut report = AnalysisReport::new("1", "plain");
            get_using_worker(&folds, &mut report);
            get_cookbook_version(&folds, &mut report);
            get_build_image_provision_datetime(&folds, &mut report);
            get_worker_instance(&folds, &mut report);
            assert_eq!(
                report.using_worker.as_deref(),
                Some("worker-linux-docker-1.travisci.net:travis-linux-7")
            );
            assert_eq!(report.cookbook.as_deref(), Some("a9c1b2e"));
            assert_eq!(
                report.build_image.as_deref(),
                Some("Tue Dec  1 15:57:35 UTC 2015")
            );
            assert_eq!(report.worker_instance.as_deref(), Some("wjb-1"));
        }

        #[test]
        fn test_invalid_log_marker() {
            let folds = travis_folds(&format!("first\n{}xyz", super::super::LOG_NOT_FOUND_LINE));
            let mut report = AnalysisReport::new("1", "plain");
            check_is_invalid_log(&folds, &mut report);
            assert!(report.invalid_log.is_some());
        }
    }
}
