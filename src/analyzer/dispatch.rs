//! Chooses and runs the specialized analyzer for a log, resolving the build
//! system for Java-family builds through a ladder of evidence sources.

use std::path::Path;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use super::base::{gha_common_analyze, travis_common_analyze};
use super::folds::{is_gha_log, read_log_into_lines, split_gha, split_travis, Folds};
use super::language;
use super::report::{AnalysisReport, ReportMap};
use super::{java_ant, java_gradle, java_maven, java_other, javascript, python};
use crate::database::DatabaseClient;
use crate::error::{ReproduceError, Result};
use crate::github::GitHubClient;

const JAVA_FAMILY: &[&str] = &["java", "scala", "groovy", "clojure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiFlavor {
    Travis,
    GitHubActions,
}

// GHA build commands appear verbatim in `Run ...` groups.
static GHA_MAVEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"mvn.*(install|compile|test)").unwrap());
static GHA_MAVEN_CMD: Lazy<Regex> = Lazy::new(|| Regex::new(r#"The command "mvn "#).unwrap());
static GHA_GRADLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"gradle(w)?.*(assemble|check|test)").unwrap());
static GHA_GRADLE_HELP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\* Get more help at https://help\.gradle\.org").unwrap());
static GHA_ANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"ant (build-all|test)").unwrap());
static GHA_ANT_CMD: Lazy<Regex> = Lazy::new(|| Regex::new(r#"The command "ant "#).unwrap());
static PLAY_ACTIVATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"activator-\$\{ACTIVATOR_VERSION\}").unwrap());
static PLAY_EXPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"export ACTIVATOR_VERSION=").unwrap());

// Travis echoes commands with a `$ ` prefix, sometimes wrapped in a reset
// escape.
static TRAVIS_MAVEN_1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\[0K\$ )?mvn.*install.*").unwrap());
static TRAVIS_MAVEN_2: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\[0K\$ )?mvn.*compile test").unwrap());
static TRAVIS_GRADLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\[0K\$ )?.*(\./)?gradle(w)?.*assemble").unwrap());
static TRAVIS_ANT_1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\[0K\$ )?ant build-all.*").unwrap());
static TRAVIS_ANT_2: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\[0K\$ )?ant test.*").unwrap());

/// Detect the build system from the commands echoed into the log.
pub fn build_system_from_build_command(lines: &[String], ci: CiFlavor) -> String {
    for line in lines {
        let (maven, gradle, ant, play) = match ci {
            CiFlavor::GitHubActions => (
                GHA_MAVEN.is_match(line) || GHA_MAVEN_CMD.is_match(line),
                GHA_GRADLE.is_match(line) || GHA_GRADLE_HELP.is_match(line),
                GHA_ANT.is_match(line) || GHA_ANT_CMD.is_match(line),
                PLAY_ACTIVATOR.is_match(line) || PLAY_EXPORT.is_match(line),
            ),
            CiFlavor::Travis => (
                TRAVIS_MAVEN_1.is_match(line)
                    || TRAVIS_MAVEN_2.is_match(line)
                    || GHA_MAVEN_CMD.is_match(line),
                TRAVIS_GRADLE.is_match(line),
                TRAVIS_ANT_1.is_match(line)
                    || TRAVIS_ANT_2.is_match(line)
                    || GHA_ANT_CMD.is_match(line),
                PLAY_ACTIVATOR.is_match(line) || PLAY_EXPORT.is_match(line),
            ),
        };
        if maven {
            return "maven".to_string();
        } else if gradle {
            return "gradle".to_string();
        } else if ant {
            return "ant".to_string();
        } else if play {
            return "play".to_string();
        }
    }
    "NA".to_string()
}

pub struct Dispatcher {
    github: GitHubClient,
    database: Option<DatabaseClient>,
}

impl Dispatcher {
    pub fn new(github_tokens: &[String]) -> Self {
        Self {
            github: GitHubClient::new(github_tokens),
            database: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseClient) -> Self {
        self.database = Some(database);
        self
    }

    /// Look in the root tree of the trigger commit for the well-known build
    /// files. More than one (or none) is ambiguous and yields `NA`.
    async fn build_system_from_github_api(&self, repo: &str, build_commit_sha: &str) -> String {
        let url = format!("https://api.github.com/repos/{repo}/git/commits/{build_commit_sha}");
        let Ok((status, json)) = self.github.get(&url).await else {
            return "NA".to_string();
        };
        if !status.is_success() {
            info!("commit: {} not available on github. Skipping", build_commit_sha);
            return "NA".to_string();
        }
        let Some(tree_url) = json
            .get("tree")
            .and_then(|t| t.get("url"))
            .and_then(|u| u.as_str())
        else {
            info!("Git tree not found, commit {}. Skipping", build_commit_sha);
            return "NA".to_string();
        };
        let Ok((status, json)) = self.github.get(tree_url).await else {
            return "NA".to_string();
        };
        if !status.is_success() {
            info!("Unable to fetch tree: {}. Skipping", status);
            return "NA".to_string();
        }
        let Some(tree) = json.get("tree").and_then(|t| t.as_array()) else {
            return "NA".to_string();
        };

        // Assume the build file is always in the root; recursing would be
        // very expensive.
        let mut build_system = "NA".to_string();
        let mut files_found = 0;
        for build_file in tree {
            if build_file.get("type").and_then(|t| t.as_str()) != Some("blob") {
                continue;
            }
            match build_file.get("path").and_then(|p| p.as_str()) {
                Some("pom.xml") => {
                    build_system = "maven".to_string();
                    files_found += 1;
                }
                Some("build.gradle") | Some("build.gradle.kts") => {
                    build_system = "gradle".to_string();
                    files_found += 1;
                }
                Some("build.xml") => {
                    build_system = "ant".to_string();
                    files_found += 1;
                }
                _ => {}
            }
        }

        if files_found != 1 {
            build_system = "NA".to_string();
        }
        build_system
    }

    /// Travis job configs sometimes name the build system in their env
    /// matrix; used when neither the tree nor the log commands decide.
    async fn build_system_from_travis_info(&self, job_id: &str) -> Option<String> {
        let url = format!("https://api.travis-ci.org/jobs/{job_id}");
        let (status, json) = self.github.get(&url).await.ok()?;
        if !status.is_success() {
            return None;
        }
        let env = json.get("config")?.get("env")?.as_str()?.to_lowercase();
        let hits: Vec<&str> = ["maven", "gradle", "ant"]
            .into_iter()
            .filter(|s| env.contains(*s))
            .collect();
        match hits.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        }
    }

    /// Find the trigger SHA for a workflow job via the jobs API.
    async fn get_trigger_sha(&self, run_id: &str, repo: &str) -> Option<String> {
        let url = format!("https://api.github.com/repos/{repo}/actions/jobs/{run_id}");
        let (status, json) = self.github.get(&url).await.ok()?;
        if !status.is_success() {
            info!("Run: {} not available on github. Skipping", run_id);
            return None;
        }
        json.get("head_sha")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }

    async fn get_build_system(
        &self,
        lines: &[String],
        job_id: &str,
        trigger_sha: Option<&str>,
        repo: Option<&str>,
        ci: CiFlavor,
    ) -> String {
        let mut trigger_sha = trigger_sha.map(str::to_string);
        if trigger_sha.is_none() && repo.is_some() && ci == CiFlavor::GitHubActions {
            trigger_sha = self.get_trigger_sha(job_id, repo.unwrap()).await;
        }

        let mut build_system = "NA".to_string();
        if let (Some(sha), Some(repo)) = (trigger_sha.as_deref(), repo) {
            build_system = self.build_system_from_github_api(repo, sha).await;
        }

        if build_system == "NA" {
            build_system = build_system_from_build_command(lines, ci);
        }

        if build_system == "NA" && ci == CiFlavor::Travis {
            if let Some(from_env) = self.build_system_from_travis_info(job_id).await {
                build_system = from_env;
            }
        }

        if build_system == "NA" {
            if let Some(database) = &self.database {
                if let Some(from_db) = database.build_system_for_job(job_id).await {
                    build_system = from_db;
                }
            }
        }

        build_system
    }

    /// Analyze one log file into the flat result mapping.
    ///
    /// `force` runs the Java path regardless of the detected language, for
    /// jobs known to be Java whose logs hide it.
    #[allow(clippy::too_many_arguments)]
    pub async fn analyze(
        &self,
        log_path: &Path,
        job_id: &str,
        build_system: Option<&str>,
        trigger_sha: Option<&str>,
        repo: Option<&str>,
        force: bool,
    ) -> Result<ReportMap> {
        let text = std::fs::read_to_string(log_path).map_err(|e| {
            ReproduceError::InvalidInput(format!(
                "Could not read log {}: {e}",
                log_path.display()
            ))
        })?;

        let ci = if is_gha_log(&text) {
            CiFlavor::GitHubActions
        } else {
            CiFlavor::Travis
        };
        let (lines, time_lines) = read_log_into_lines(&text);
        let folds = match ci {
            CiFlavor::Travis => split_travis(&lines),
            CiFlavor::GitHubActions => split_gha(&lines, &time_lines),
        };

        let primary_language = match ci {
            CiFlavor::Travis => language::detect_travis(&folds),
            CiFlavor::GitHubActions => {
                language::detect_gha(&folds, repo, Some(&self.github)).await
            }
        };

        let language_for_dispatch = if force {
            warn!("Forcing Java analyzer");
            "java".to_string()
        } else {
            primary_language.clone()
        };

        let mut report = AnalysisReport::new(job_id, "plain");
        report.primary_language = Some(primary_language.clone());

        let lang = language_for_dispatch.as_str();
        if JAVA_FAMILY.contains(&lang) {
            let confirmed = match build_system {
                Some(system) => system.to_lowercase(),
                None => {
                    if build_system.is_none() && repo.is_none() && trigger_sha.is_none() {
                        log::error!("Need build system or repo to analyze java log");
                        return Ok(non_analyzed(job_id, &primary_language));
                    }
                    self.get_build_system(&lines, job_id, trigger_sha, repo, ci).await
                }
            };
            self.run_common(&folds, ci, &mut report);
            match confirmed.as_str() {
                "maven" => {
                    debug!("Using maven Analyzer");
                    java_maven::analyze(&folds, &mut report);
                }
                "gradle" => {
                    debug!("Using gradle Analyzer");
                    java_gradle::analyze(&folds, &mut report);
                }
                "ant" => {
                    debug!("Using ant Analyzer");
                    java_ant::analyze(&folds, &mut report);
                }
                "play" => {
                    debug!("Using other Analyzer");
                    java_other::analyze(&folds, "play", &mut report);
                }
                _ => {
                    debug!("Using other Analyzer");
                    java_other::analyze(&folds, "NA", &mut report);
                }
            }
        } else if lang == "node_js" {
            self.run_common(&folds, ci, &mut report);
            javascript::analyze(&folds, &mut report);
        } else if lang == "python" {
            self.run_common(&folds, ci, &mut report);
            python::analyze(&folds, &mut report);
        } else {
            // Ruby and everything else are not supported yet.
            return Ok(non_analyzed(job_id, &primary_language));
        }

        report.sanitize();
        Ok(report.output())
    }

    fn run_common(&self, folds: &Folds, ci: CiFlavor, report: &mut AnalysisReport) {
        match ci {
            CiFlavor::Travis => travis_common_analyze(folds, report),
            CiFlavor::GitHubActions => gha_common_analyze(folds, report),
        }
    }
}

/// The result emitted for logs in unsupported languages: enough for the
/// caller to know why analysis was skipped.
fn non_analyzed(job_id: &str, primary_language: &str) -> ReportMap {
    let mut out = ReportMap::new();
    out.insert("tr_job_id".into(), json!(job_id));
    out.insert("tr_log_lan".into(), json!(primary_language));
    out.insert("not_in_supported_language".into(), json!(true));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_build_system_from_gha_commands() {
        assert_eq!(
            build_system_from_build_command(&lines("mvn -B install"), CiFlavor::GitHubActions),
            "maven"
        );
        assert_eq!(
            build_system_from_build_command(&lines("./gradlew check"), CiFlavor::GitHubActions),
            "gradle"
        );
        assert_eq!(
            build_system_from_build_command(&lines("ant test -v"), CiFlavor::GitHubActions),
            "ant"
        );
        assert_eq!(
            build_system_from_build_command(
                &lines("export ACTIVATOR_VERSION=1.3.7"),
                CiFlavor::GitHubActions
            ),
            "play"
        );
        assert_eq!(
            build_system_from_build_command(&lines("echo hello"), CiFlavor::GitHubActions),
            "NA"
        );
    }

    #[test]
    fn test_build_system_from_travis_commands() {
        assert_eq!(
            build_system_from_build_command(&lines("$ mvn clean install -B"), CiFlavor::Travis),
            "maven"
        );
        assert_eq!(
            build_system_from_build_command(&lines("$ ./gradlew assemble"), CiFlavor::Travis),
            "gradle"
        );
        assert_eq!(
            build_system_from_build_command(
                &lines(r#"The command "ant test" exited with 1."#),
                CiFlavor::Travis
            ),
            "ant"
        );
    }
}
