use std::collections::BTreeSet;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use super::folds::Folds;
use crate::github::GitHubClient;

static BUILD_LANGUAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Build language: (.*)").unwrap());
static SETUP_ACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"Run actions/setup-(\w+)").unwrap());
static PYTHON_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"(python|nosetest|pip|pytest)").unwrap());
static JAVA_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"mvnw?|gradlew?").unwrap());
static NODE_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(nvm|npm) (run|test|install|build)").unwrap());
static JAVA_TOOL_BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Welcome to Gradle|Apache Maven) \d\.\d\.\d").unwrap());

/// Determine the primary language of a Travis build.
///
/// The `system_info` fold states it outright; without that fold, count
/// language keywords across the whole log and make an educated guess.
pub fn detect_travis(folds: &Folds) -> String {
    let mut primary_language = "unknown".to_string();

    if let Some(system_info) = folds.get("system_info") {
        for line in &system_info.content {
            if let Some(caps) = BUILD_LANGUAGE.captures(line) {
                primary_language = caps[1].to_string();
            }
        }
    } else {
        let mut java = 0;
        let mut ruby = 0;
        for fold in folds.values() {
            for line in &fold.content {
                if line.contains("java") {
                    java += 1;
                }
                if line.contains("ruby") {
                    ruby += 1;
                }
            }
        }
        if java >= 3 {
            primary_language = "java".to_string();
        } else if ruby >= 3 {
            primary_language = "ruby".to_string();
        }
    }

    // Some Travis configs stuff shell arrays into the language field.
    if let Some(idx) = primary_language.find('\\') {
        primary_language.truncate(idx);
    }
    primary_language.to_lowercase()
}

/// Determine the primary language of a GitHub Actions build.
///
/// Evidence order: setup-action fold names, run-command fold names, the
/// repository's dominant language from the API, and finally a keyword count
/// over the log body.
pub async fn detect_gha(
    folds: &Folds,
    repo: Option<&str>,
    github: Option<&GitHubClient>,
) -> String {
    let mut potential_languages: BTreeSet<String> = BTreeSet::new();

    for key in folds.keys() {
        if let Some(caps) = SETUP_ACTION.captures(key) {
            let language = caps[1].to_lowercase();
            if ["java", "python", "ruby", "node"].contains(&language.as_str()) {
                potential_languages.insert(if language == "node" {
                    "node_js".to_string()
                } else {
                    language
                });
            }
        }
        if PYTHON_COMMAND.is_match(key) {
            potential_languages.insert("python".to_string());
        }
        if JAVA_COMMAND.is_match(key) {
            potential_languages.insert("java".to_string());
        }
        if NODE_COMMAND.is_match(key) {
            potential_languages.insert("node_js".to_string());
        }
    }
    if potential_languages.len() == 1 {
        return potential_languages.into_iter().next().unwrap();
    }

    if let (Some(repo), Some(github)) = (repo, github) {
        if let Some(language) = repo_primary_language(github, repo).await {
            return language;
        }
    }

    // Last resort: go through all the lines and make an educated guess.
    let mut java = 0;
    let mut ruby = 0;
    for fold in folds.values() {
        for line in &fold.content {
            if JAVA_TOOL_BANNER.is_match(line) {
                return "java".to_string();
            }
            let lower = line.to_lowercase();
            if lower.contains("java") {
                java += 1;
            }
            if lower.contains("ruby") {
                ruby += 1;
            }
        }
    }
    if java >= 10 {
        "java".to_string()
    } else if ruby >= 10 {
        "ruby".to_string()
    } else {
        "unknown".to_string()
    }
}

/// The repository oracle sometimes reports an inaccurate dominant language
/// (e.g. HTML for a Java project), so only the four supported languages are
/// accepted.
async fn repo_primary_language(github: &GitHubClient, repo: &str) -> Option<String> {
    let url = format!("https://api.github.com/repos/{repo}");
    let (status, json) = github.get(&url).await.ok()?;
    if !status.is_success() {
        debug!("Repo {} not available on GitHub. Skipping.", repo);
        return None;
    }
    let language = json.get("language")?.as_str()?.to_lowercase();
    match language.as_str() {
        "javascript" => Some("node_js".to_string()),
        "java" | "python" | "ruby" => Some(language),
        _ => None,
    }
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

    #[test]
    fn test_travis_system_info_wins() {
        let folds = travis_folds(
            "travis_fold:start:system_info\nBuild language: Java\ntravis_fold:end:system_info",
        );
        assert_eq!(detect_travis(&folds), "java");
    }

    #[test]
    fn test_travis_keyword_fallback() {
        let folds = travis_folds("java here\nmore java\nyet more java stuff");
        assert_eq!(detect_travis(&folds), "java");
    }

    #[test]
    fn test_travis_unknown_when_no_evidence() {
        let folds = travis_folds("nothing interesting\nat all");
        assert_eq!(detect_travis(&folds), "unknown");
    }

    #[tokio::test]
    async fn test_gha_setup_action() {
        let folds = gha_folds("##[group]Run actions/setup-node@v2\nok\n##[endgroup]");
        assert_eq!(detect_gha(&folds, None, None).await, "node_js");
    }

    #[tokio::test]
    async fn test_gha_run_command_heuristics() {
        let folds = gha_folds("##[group]Run pytest -v\nok\n##[endgroup]");
        assert_eq!(detect_gha(&folds, None, None).await, "python");

        let folds = gha_folds("##[group]Run ./mvnw install\nok\n##[endgroup]");
        assert_eq!(detect_gha(&folds, None, None).await, "java");
    }

    #[tokio::test]
    async fn test_gha_ambiguous_evidence_falls_through() {
        // Two different languages implied; neither wins, and with no repo
        // the keyword count decides.
        let folds = gha_folds(
            "##[group]Run actions/setup-java@v2\nok\n##[endgroup]\n\
             ##[group]Run npm test\nok\n##[endgroup]",
        );
        assert_eq!(detect_gha(&folds, None, None).await, "unknown");
    }

    #[tokio::test]
    async fn test_gha_tool_banner_short_circuits() {
        let folds = gha_folds("Welcome to Gradle 7.4.2!\nsome output");
        assert_eq!(detect_gha(&folds, None, None).await, "java");
    }
}
