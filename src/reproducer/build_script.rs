//! Build-script generation: converts an expanded job config into `run.sh`,
//! per-step env files, predefined-action stubs, and the event payload.

use std::path::Path;

use indexmap::IndexMap;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{ReproduceError, Result};
use crate::reproducer::model::Job;
use crate::workflow::context::{JobFacts, RootContext};
use crate::workflow::expressions::{substitute_expressions, value_to_string};

/// Actions that manage caches, artifacts, or upload surfaces; they have no
/// effect inside a reproduction container and are elided from the script.
/// `actions/checkout` is included: the provisioner has already placed the
/// tree.
const IGNORE_ACTIONS: &[&str] = &[
    "codecov/codecov-action",
    "actions/checkout",
    "actions/upload-artifact",
    "actions/download-artifact",
    "actions/cache",
    "gradle/wrapper-validation-action",
];

const DEPRECATED_MIRRORS: &[&str] = &[
    "http://repo.maven.apache.org/maven2",
    "http://repo1.maven.org/maven2",
];
const REPLACEMENT_MIRROR: &str = "http://insecure.repo1.maven.org/maven2";

static MVN_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"mvn[^w][\\]?").unwrap());

/// The runtime evaluator shipped into every job bundle's `helpers/`.
const EVAL_EXPRESSION_HELPER: &str = include_str!("resources/eval_expression.py");

/// One rendered step of the build script.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub number: usize,
    /// Commands to write into `bugswarm_cmd.sh`, one invocation each.
    pub commands: Vec<String>,
    /// Space-separated `KEY=VALUE` pairs for the `env` prefix; written to
    /// `step_<n>.env` when non-empty.
    pub envs: String,
}

/// The GitHub-provided environment every step sees.
fn github_action_env(job: &Job, step_number: usize, action_repo: &str) -> IndexMap<String, String> {
    let mut envs = IndexMap::new();
    let mut put = |k: &str, v: String| {
        envs.insert(k.to_string(), v);
    };
    put("CI", "true".into());
    put("GITHUB_ACTION", step_number.to_string());
    put("GITHUB_ACTION_REPOSITORY", action_repo.to_string());
    put("GITHUB_ACTIONS", "true".into());
    put("GITHUB_ACTOR", "bugswarm/bugswarm".into());
    put("GITHUB_API_URL", "https://api.github.com".into());
    put("GITHUB_ENV", "/home/github/workflow/envs.txt".into());
    put("GITHUB_EVENT_NAME", "push".into());
    put("GITHUB_EVENT_PATH", "/home/github/workflow/event.json".into());
    put("GITHUB_GRAPHQL_URL", "https://api.github.com/graphql".into());
    put("GITHUB_JOB", "build".into());
    put("GITHUB_PATH", "/home/github/workflow/paths.txt".into());
    put("GITHUB_REF", "master".into());
    put("GITHUB_REF_NAME", job.branch.clone());
    put("GITHUB_REF_TYPE", "branch".into());
    put("GITHUB_REPOSITORY", job.repo.clone());
    put(
        "GITHUB_REPOSITORY_OWNER",
        job.repo.split('/').next().unwrap_or_default().to_string(),
    );
    put("GITHUB_RETENTION_DAYS", "0".into());
    put("GITHUB_RUN_ATTEMPT", "1".into());
    put("GITHUB_RUN_ID", "1".into());
    put("GITHUB_RUN_NUMBER", "1".into());
    put("GITHUB_SERVER_URL", "https://github.com".into());
    put("GITHUB_SHA", job.sha.clone());
    put("GITHUB_WORKFLOW", "CI".into());
    put("GITHUB_WORKSPACE", "/home/github/build".into());
    put("RUNNER_ARCH", "X64".into());
    put("RUNNER_NAME", "Bugswarm GitHub Actions Runner".into());
    put("RUNNER_OS", "Linux".into());
    put("RUNNER_TEMP", "/tmp".into());
    put("RUNNER_TOOL_CACHE", "/opt/hostedtoolcache".into());
    envs
}

/// Render env pairs as one `env`-prefix string, quoting values with spaces.
fn env_str(pairs: &IndexMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        if value.is_empty() {
            continue;
        }
        let value = value.replace('"', "\\\"");
        if value.contains(' ') {
            out.push_str(&format!("{key}=\"{value}\" "));
        } else {
            out.push_str(&format!("{key}={value} "));
        }
    }
    out
}

/// Drives file generation for one job's bundle directory.
pub struct BuildScriptGenerator<'a> {
    job: &'a Job,
    config: &'a Config,
    context: RootContext,
    dependency_solver: bool,
}

impl<'a> BuildScriptGenerator<'a> {
    pub fn new(job: &'a Job, config: &'a Config, dependency_solver: bool) -> Self {
        let facts = JobFacts {
            repo: job.repo.clone(),
            sha: job.sha.clone(),
            job_id: job.job_id.clone(),
            build_id: job.build_id.clone(),
            branch: job.branch.clone(),
            workflow_job_id: job
                .config
                .get("id-in-workflow")
                .and_then(|v| v.as_str())
                .unwrap_or("build")
                .to_string(),
        };
        let matrix = job
            .config
            .get("strategy")
            .and_then(|s| s.get("matrix"))
            .cloned()
            .unwrap_or(Value::Null);
        let context = RootContext::new(&facts, matrix, 1);
        Self {
            job,
            config,
            context,
            dependency_solver,
        }
    }

    /// Generate the whole bundle: `run.sh`, `steps/step_<n>.env`,
    /// `actions/…` stubs, and `event.json`.
    pub async fn generate(&self) -> Result<()> {
        let location = self
            .config
            .reproduce_tmp_dir(&self.job.job_id, &self.job.sha);
        tokio::fs::create_dir_all(location.join("actions")).await?;
        tokio::fs::create_dir_all(location.join("steps")).await?;
        tokio::fs::create_dir_all(location.join("helpers")).await?;

        // Deferred expressions call this helper at script runtime.
        let helper_path = location.join("helpers").join("eval_expression");
        tokio::fs::write(&helper_path, EVAL_EXPRESSION_HELPER).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&helper_path, std::fs::Permissions::from_mode(0o755))
                .await?;
        }

        let steps_config = self
            .job
            .config
            .get("steps")
            .and_then(|s| s.as_array())
            .ok_or_else(|| {
                ReproduceError::UnsupportedWorkflow(
                    "steps attribute is missing from config".to_string(),
                )
            })?;

        let mut steps = Vec::new();
        for (step_number, step) in steps_config.iter().enumerate() {
            let parsed = if step.get("uses").is_some() {
                self.predefined_action(step_number, step, &location).await?
            } else if step.get("run").is_some() {
                Some(self.custom_action(step_number, step)?)
            } else {
                None
            };
            if let Some(step) = parsed {
                steps.push(step);
            }
        }

        debug!("Generating build script... ({} steps)", steps.len());
        for step in &steps {
            if !step.envs.is_empty() {
                tokio::fs::write(
                    location.join("steps").join(format!("step_{}.env", step.number)),
                    &step.envs,
                )
                .await?;
            }
        }

        let mut script = self.generate_build_script(&steps);
        if self.dependency_solver {
            script = patch_mvn_tls(&script);
            let repo_dir =
                self.config
                    .reproducing_repo_dir(&self.job.job_id, &self.job.sha, &self.job.repo);
            modify_deprecated_links(&repo_dir).await?;
        }
        tokio::fs::write(location.join("run.sh"), script).await?;

        tokio::fs::write(location.join("event.json"), self.event_payload()?).await?;
        Ok(())
    }

    /// The webhook payload predefined actions read from
    /// `/home/github/workflow/event.json`.
    fn event_payload(&self) -> Result<String> {
        let payload = if self.job.is_pr {
            json!({
                "pull_request": {
                    "head": {"sha": self.job.sha},
                    "base": {"sha": self.job.base_sha},
                },
                "repository": {"full_name": self.job.repo},
            })
        } else {
            json!({
                "repository": {"full_name": self.job.repo},
                "head_commit": {"id": self.job.sha},
            })
        };
        Ok(serde_json::to_string(&payload)?)
    }

    /// Parse a `uses:` step into an action-stub invocation.
    async fn predefined_action(
        &self,
        step_number: usize,
        step: &Value,
        location: &Path,
    ) -> Result<Option<Step>> {
        let name = step
            .get("uses")
            .and_then(|u| u.as_str())
            .unwrap_or_default()
            .to_string();
        let (action_repo, tag) = match name.split_once('@') {
            Some((repo, tag)) => (repo.to_string(), tag.to_string()),
            None => (name.clone(), String::new()),
        };

        if action_repo.starts_with("docker") {
            return Err(ReproduceError::UnsupportedWorkflow(format!(
                "unsupported action in step {step_number}: {name}"
            )));
        }
        if IGNORE_ACTIONS.contains(&action_repo.to_lowercase().as_str()) {
            return Ok(None);
        }

        debug!("Setting up build code for predefined action {name} (#{step_number})");

        let action_dir_name = action_repo.replace('/', "-");
        let action_dir = location.join("actions").join(&action_dir_name);
        self.clone_action_repo_if_not_exists(&action_dir, &action_repo, &tag)
            .await?;

        let mut envs = github_action_env(self.job, step_number, &action_repo);
        let is_setup = action_repo.contains("actions/setup-");

        if let Some(with) = step.get("with").and_then(|w| w.as_object()) {
            for (key, value) in with {
                if is_setup && key == "cache" {
                    // Cache restores cannot work inside the container.
                    continue;
                }
                envs.insert(
                    format!("INPUT_{}", key.to_uppercase().replace(' ', "_")),
                    value_to_string(value).replace('\n', "\\n"),
                );
            }
        }
        if let Some(step_env) = step.get("env").and_then(|e| e.as_object()) {
            for (key, value) in step_env {
                envs.insert(key.clone(), value_to_string(value));
            }
        }

        // Resolve the stub entry point and fill input defaults from the
        // action metadata.
        let action_yml_path = ["action.yml", "action.yaml"]
            .iter()
            .map(|f| action_dir.join(f))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                ReproduceError::InvalidPredefinedAction(format!(
                    "{name} has no action.yml metadata"
                ))
            })?;
        let action_file: Value = serde_yaml::from_str(&std::fs::read_to_string(&action_yml_path)?)?;
        let main_js = action_file
            .get("runs")
            .and_then(|r| r.get("main"))
            .and_then(|m| m.as_str())
            .ok_or_else(|| {
                ReproduceError::InvalidPredefinedAction(format!(
                    "{name} does not declare a node entry point"
                ))
            })?;
        let cmd = format!("node /home/github/actions/{action_dir_name}/{main_js}");

        if let Some(inputs) = action_file.get("inputs").and_then(|i| i.as_object()) {
            for (key, value) in inputs {
                let env_key = format!("INPUT_{}", key.to_uppercase().replace(' ', "_"));
                if envs.contains_key(&env_key) {
                    continue;
                }
                if let Some(default) = value.get("default") {
                    let default = value_to_string(default);
                    // Defaults that need expression resolution are left for
                    // the action to compute.
                    if default.contains("${{") {
                        continue;
                    }
                    envs.insert(env_key, default.replace('\n', "\\n"));
                }
            }
        }

        Ok(Some(Step {
            name: format!("Run {name}"),
            number: step_number,
            commands: vec![cmd],
            envs: env_str(&envs),
        }))
    }

    /// Parse a `run:` step into its command lines, substituting `${{ … }}`
    /// regions.
    fn custom_action(&self, step_number: usize, step: &Value) -> Result<Step> {
        let run = step.get("run").and_then(|r| r.as_str()).unwrap_or_default();
        let mut commands = Vec::new();
        for line in run.lines().filter(|l| !l.is_empty()) {
            commands.push(substitute_expressions(line, &self.job.job_id, &self.context)?);
        }

        debug!("Setting up build code for custom commands action #{step_number}");

        let mut envs = github_action_env(self.job, step_number, "");
        if let Some(step_env) = step.get("env").and_then(|e| e.as_object()) {
            for (key, value) in step_env {
                envs.insert(key.clone(), value_to_string(value));
            }
        }

        let display = step
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                run.lines().next().unwrap_or_default().to_string()
            });

        Ok(Step {
            name: format!("Run {display}"),
            number: step_number,
            commands,
            envs: env_str(&envs),
        })
    }

    async fn clone_action_repo_if_not_exists(
        &self,
        action_dir: &Path,
        action_repo: &str,
        tag: &str,
    ) -> Result<()> {
        if action_dir.is_dir() {
            return Ok(());
        }
        debug!("Download action to {}", action_dir.display());
        tokio::fs::create_dir_all(action_dir).await?;
        let url = crate::github::construct_github_repo_url(action_repo);
        let mut args = vec!["clone", "--depth", "1"];
        if !tag.is_empty() {
            args.extend(["--branch", tag]);
        }
        let dir = action_dir.to_string_lossy().into_owned();
        args.push(&url);
        args.push(&dir);
        let output = tokio::process::Command::new("git")
            .args(&args)
            .output()
            .await
            .map_err(|e| ReproduceError::Git(format!("failed to spawn git: {e}")))?;
        if !output.status.success() {
            return Err(ReproduceError::InvalidPredefinedAction(format!(
                "could not clone action {action_repo}@{tag}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Emit `run.sh`: the OS group the analyzer keys on, the workflow state
    /// files, then each step in its own `##[group]` with the envs.txt
    /// delimiter protocol and the `bugswarm_cmd.sh` indirection.
    pub fn generate_build_script(&self, steps: &[Step]) -> String {
        let job_id = &self.job.job_id;
        let mut lines: Vec<String> = vec![
            "#!/usr/bin/env bash".into(),
            String::new(),
            // So we can run this script anywhere.
            format!("cd /home/github/build/{}", self.job.repo),
            String::new(),
            // The analyzer reads the OS from this group.
            "echo \"##[group]Operating System\"".into(),
            "cat /etc/lsb-release | grep -oP '(?<=DISTRIB_ID=).*'".into(),
            "cat /etc/lsb-release | grep -oP '(?<=DISTRIB_RELEASE=).*'".into(),
            "echo \"LTS\"".into(),
            "echo \"##[endgroup]\"".into(),
            String::new(),
            // Predefined actions need this directory.
            "mkdir -p /home/github/workflow/".into(),
            String::new(),
            format!("cp /home/github/{job_id}/event.json /home/github/workflow/event.json"),
            "CURRENT_ENV=''".into(),
        ];

        for step in steps {
            debug!("Generate build script for step {} (#{})", step.name, step.number);
            lines.push(String::new());
            lines.push(format!("echo \"##[group]{}\"", step.name));
            lines.push("echo \"##[endgroup]\"".into());

            // Seed the step's env prefix from its env file.
            lines.push(format!(
                "if [ -f /home/github/{job_id}/steps/step_{}.env ]; then",
                step.number
            ));
            lines.push(format!(
                "  CURRENT_ENV=\"$(cat /home/github/{job_id}/steps/step_{}.env) \"",
                step.number
            ));
            lines.push("else".into());
            lines.push("  CURRENT_ENV=''".into());
            lines.push("fi".into());

            // Fold key/value pairs written by earlier steps into the env
            // prefix, honoring the multi-line delimiter protocol.
            lines.extend(
                [
                    "",
                    "if [ -f /home/github/workflow/envs.txt ]; then",
                    "   KEY=''",
                    "   VALUE=''",
                    "   regex='(.*)<<_GitHubActionsFileCommandDelimeter_'",
                    "   while read line ",
                    "   do",
                    "      if [[ $KEY = '' && $line =~ $regex ]]; then",
                    "         KEY=${BASH_REMATCH[1]}",
                    "      elif [[ $line = '_GitHubActionsFileCommandDelimeter_' ]]; then",
                    "         CURRENT_ENV=\"${CURRENT_ENV}${KEY}=${VALUE} \"",
                    "         KEY=''",
                    "         VALUE=''",
                    "      else",
                    "         if [[ $VALUE = '' ]]; then",
                    "            VALUE=\"${VALUE}${line}\"",
                    "         else",
                    "            VALUE=\"${VALUE}\\n${line}\"",
                    "         fi",
                    "      fi",
                    "   done <<< \"$(cat /home/github/workflow/envs.txt)\"",
                    "",
                    "else",
                    "  echo -n '' > /home/github/workflow/envs.txt",
                    "fi",
                    "",
                    "if [ ! -f /home/github/workflow/paths.txt ]; then",
                    "  echo -n '' > /home/github/workflow/paths.txt",
                    "fi",
                    "",
                    "if [ ! -f /home/github/workflow/event.json ]; then",
                    "  echo -n '{}' > /home/github/workflow/event.json",
                    "fi",
                ]
                .iter()
                .map(|s| s.to_string()),
            );

            for command in &step.commands {
                lines.extend(
                    [
                        // The env-prefix indirection needs its own file;
                        // `env .. command` inline does not survive quoting.
                        "if [[ $CURRENT_ENV != '' ]]; then".to_string(),
                        format!("  echo \"env ${{CURRENT_ENV}}\"{command} > bugswarm_cmd.sh"),
                        "else".to_string(),
                        format!("  echo {command} > bugswarm_cmd.sh"),
                        "fi".to_string(),
                        String::new(),
                        "chmod u+x bugswarm_cmd.sh".to_string(),
                        "./bugswarm_cmd.sh".to_string(),
                        String::new(),
                        "EXIT_CODE=$?".to_string(),
                        "if [[ $EXIT_CODE != 0 ]]; then".to_string(),
                        "\techo \"\" && echo \"##[error]Process completed with exit code $EXIT_CODE.\""
                            .to_string(),
                        "\texit $EXIT_CODE".to_string(),
                        "fi".to_string(),
                    ],
                );
            }
        }

        lines.push(String::new());
        let mut content = lines.join("\n");
        content.push('\n');
        content
    }
}

/// Splice `-Dhttps.protocols=TLSv1.2` into Maven invocations so JDK 7 era
/// builds can still reach HTTPS-only repositories.
pub fn patch_mvn_tls(script: &str) -> String {
    let mut lines = Vec::new();
    for line in script.lines() {
        if MVN_COMMAND.is_match(line) {
            if let Some(idx) = line.find(" -") {
                let escaped_before = idx > 0 && line.as_bytes()[idx - 1] == b'\\';
                let patched = if escaped_before {
                    // Inside one escaped shell word: keep the escaping.
                    format!(
                        "{} -Dhttps.protocols=TLSv1.2\\ -{}",
                        &line[..idx],
                        &line[idx + 2..]
                    )
                } else {
                    // Separate arguments: attach the flag to the mvn word.
                    format!(
                        "{}\\ -Dhttps.protocols=TLSv1.2 -{}",
                        &line[..idx],
                        &line[idx + 2..]
                    )
                };
                lines.push(patched);
                continue;
            }
        }
        lines.push(line.to_string());
    }
    let mut content = lines.join("\n");
    if script.ends_with('\n') {
        content.push('\n');
    }
    content
}

/// Rewrite dead Maven mirrors in POM, XML, and generic files under
/// `search_dir`. A failure partway is terminal for the job; there is no
/// rollback.
pub async fn modify_deprecated_links(search_dir: &Path) -> Result<()> {
    let mut stack = vec![search_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|n| n == ".git") {
                    continue;
                }
                stack.push(path);
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if !DEPRECATED_MIRRORS.iter().any(|url| content.contains(url)) {
                continue;
            }
            let mut updated = content;
            for url in DEPRECATED_MIRRORS {
                updated = updated.replace(url, REPLACEMENT_MIRROR);
            }
            tokio::fs::write(&path, updated).await?;
            log::info!("Modified {} file.", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::reproducer::model::{JobResults, JobRole};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn test_job(config_value: Value) -> Job {
        Job {
            job_id: "12345".into(),
            build_job: "1.1".into(),
            language: "java".into(),
            config: config_value,
            repo: "owner/project".into(),
            branch: "main".into(),
            base_sha: "base".into(),
            sha: "headsha".into(),
            travis_merge_sha: None,
            resettable: true,
            github_archived: true,
            is_pr: false,
            role: JobRole::Failed,
            build_id: "100".into(),
            build_system: Some("maven".into()),
            buildpair_name: "owner/project/-1-100-101".into(),
            jobpair_name: "12345-67890".into(),
            job_name: "owner/project/-1-100-101/12345-67890/12345".into(),
            skip: AtomicBool::new(false),
            reproduced: AtomicBool::new(false),
            matched: AtomicBool::new(false),
            results: Mutex::new(JobResults::default()),
        }
    }

    fn test_config() -> Config {
        Config::new("task", Credentials::default())
    }

    #[test]
    fn test_script_has_os_group_and_state_files() {
        let job = test_job(json!({"runs-on": "ubuntu-20.04", "steps": []}));
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let script = generator.generate_build_script(&[]);
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("echo \"##[group]Operating System\""));
        assert!(script.contains("DISTRIB_RELEASE"));
        assert!(script.contains("cd /home/github/build/owner/project"));
        assert!(script.contains("mkdir -p /home/github/workflow/"));
    }

    #[test]
    fn test_step_renders_group_and_error_handling() {
        let job = test_job(json!({"steps": []}));
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let steps = vec![Step {
            name: "Run mvn test".into(),
            number: 2,
            commands: vec!["'mvn test -B'".into()],
            envs: String::new(),
        }];
        let script = generator.generate_build_script(&steps);
        assert!(script.contains("echo \"##[group]Run mvn test\""));
        assert!(script.contains("echo \"##[endgroup]\""));
        assert!(script.contains("step_2.env"));
        assert!(script.contains("_GitHubActionsFileCommandDelimeter_"));
        assert!(script.contains("> bugswarm_cmd.sh"));
        assert!(script.contains("##[error]Process completed with exit code $EXIT_CODE."));
    }

    #[test]
    fn test_custom_action_substitutes_expressions() {
        let job = test_job(json!({
            "strategy": {"matrix": {"node": 14}},
            "steps": [{"run": "echo version ${{ matrix.node }}"}]
        }));
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let step_value = &job.config["steps"][0];
        let step = generator.custom_action(0, step_value).unwrap();
        assert_eq!(step.name, "Run echo version ${{ matrix.node }}");
        assert_eq!(step.commands, vec!["'echo version 14'"]);
        assert!(step.envs.contains("GITHUB_REPOSITORY=owner/project"));
        assert!(step.envs.contains("GITHUB_SHA=headsha"));
    }

    #[test]
    fn test_custom_action_step_env_overrides() {
        let job = test_job(json!({
            "steps": [{"run": "make", "env": {"FOO": "bar baz"}}]
        }));
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let step = generator.custom_action(0, &job.config["steps"][0]).unwrap();
        assert!(step.envs.contains("FOO=\"bar baz\""));
    }

    #[tokio::test]
    async fn test_predefined_action_builds_stub_invocation() {
        let job = test_job(json!({
            "steps": [{
                "uses": "actions/setup-java@v2",
                "with": {"java-version": "11", "cache": "maven"}
            }]
        }));
        let temp = tempfile::tempdir().unwrap();
        let action_dir = temp.path().join("actions").join("actions-setup-java");
        std::fs::create_dir_all(&action_dir).unwrap();
        std::fs::write(
            action_dir.join("action.yml"),
            "name: Setup Java\ninputs:\n  java-version:\n    required: true\n  distribution:\n    default: zulu\n  token:\n    default: ${{ github.token }}\nruns:\n  main: dist/setup/index.js\n",
        )
        .unwrap();

        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let step = generator
            .predefined_action(0, &job.config["steps"][0], temp.path())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(step.name, "Run actions/setup-java@v2");
        assert_eq!(
            step.commands,
            vec!["node /home/github/actions/actions-setup-java/dist/setup/index.js"]
        );
        assert!(step.envs.contains("INPUT_JAVA-VERSION=11"));
        // The cache input is dropped, defaults are filled, and unresolved
        // expression defaults are skipped.
        assert!(!step.envs.contains("INPUT_CACHE"));
        assert!(step.envs.contains("INPUT_DISTRIBUTION=zulu"));
        assert!(!step.envs.contains("INPUT_TOKEN"));
    }

    #[tokio::test]
    async fn test_ignored_actions_are_elided() {
        let job = test_job(json!({
            "steps": [{"uses": "actions/checkout@v2"}, {"uses": "actions/cache@v3"}]
        }));
        let temp = tempfile::tempdir().unwrap();
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        for idx in 0..2 {
            let step = generator
                .predefined_action(idx, &job.config["steps"][idx], temp.path())
                .await
                .unwrap();
            assert!(step.is_none());
        }
    }

    #[tokio::test]
    async fn test_docker_action_is_unsupported() {
        let job = test_job(json!({
            "steps": [{"uses": "docker://alpine:3.14"}]
        }));
        let temp = tempfile::tempdir().unwrap();
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let result = generator
            .predefined_action(0, &job.config["steps"][0], temp.path())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_patch_mvn_tls() {
        let script = "travis_cmd mvn\\ clean\\ install -B --echo\n";
        let patched = patch_mvn_tls(script);
        assert!(patched.contains("-Dhttps.protocols=TLSv1.2"));
        let unrelated = "echo hello\n";
        assert_eq!(patch_mvn_tls(unrelated), unrelated);
    }

    #[tokio::test]
    async fn test_modify_deprecated_links() {
        let temp = tempfile::tempdir().unwrap();
        let pom = temp.path().join("pom.xml");
        std::fs::write(
            &pom,
            "<repository><url>http://repo.maven.apache.org/maven2</url></repository>",
        )
        .unwrap();
        let other = temp.path().join("script.js");
        std::fs::write(&other, "fetch('http://repo1.maven.org/maven2/x')").unwrap();

        modify_deprecated_links(temp.path()).await.unwrap();

        let pom_content = std::fs::read_to_string(&pom).unwrap();
        assert!(pom_content.contains("http://insecure.repo1.maven.org/maven2"));
        let js_content = std::fs::read_to_string(&other).unwrap();
        assert!(js_content.contains("http://insecure.repo1.maven.org/maven2"));
    }

    #[test]
    fn test_event_payload_shapes() {
        let mut job = test_job(json!({"steps": []}));
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let payload: Value = serde_json::from_str(&generator.event_payload().unwrap()).unwrap();
        assert_eq!(payload["repository"]["full_name"], json!("owner/project"));
        assert_eq!(payload["head_commit"]["id"], json!("headsha"));

        job.is_pr = true;
        let config = test_config();
        let generator = BuildScriptGenerator::new(&job, &config, false);
        let payload: Value = serde_json::from_str(&generator.event_payload().unwrap()).unwrap();
        assert_eq!(payload["pull_request"]["head"]["sha"], json!("headsha"));
    }
}
