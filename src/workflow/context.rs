//! The context tree CI expressions evaluate against. Most values are known
//! at script-generation time; a few (`job.status`, `steps.*`, `env.*`,
//! `inputs.*`) only exist when the generated script runs, and resolve to
//! shell expansions instead.

use indexmap::IndexMap;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").unwrap());
static OUTPUTS_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(.*)_OUTPUTS_(.*)").unwrap());

/// Identity facts a job carries into its context.
#[derive(Debug, Clone, Default)]
pub struct JobFacts {
    pub repo: String,
    pub sha: String,
    pub job_id: String,
    pub build_id: String,
    pub branch: String,
    pub workflow_job_id: String,
}

/// The root of the context tree; resolves dotted paths like `matrix.foo` or
/// `github.workspace` to `(value, is_dynamic)`.
#[derive(Debug, Clone)]
pub struct RootContext {
    github_static: Map<String, Value>,
    github_dynamic: Map<String, Value>,
    runner: Map<String, Value>,
    strategy: Map<String, Value>,
    matrix: Value,
    env: IndexMap<String, String>,
    inputs: IndexMap<String, String>,
}

impl RootContext {
    pub fn new(facts: &JobFacts, matrix: Value, job_total: usize) -> Self {
        let repository = facts.repo.clone();
        let owner = repository
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let github_static = json!({
            "token": "DUMMY",
            "job": facts.workflow_job_id,
            "ref": "",
            "sha": facts.sha,
            "repository": repository,
            "repository_owner": owner,
            "repositoryurl": format!("git://github.com/{}.git", facts.repo),
            "run_id": facts.job_id,
            "run_number": facts.build_id,
            "retention_days": "0",
            "run_attempt": "1",
            "actor": "",
            "triggering_actor": "",
            "workflow": "",
            "head_ref": "",
            "base_ref": "",
            "event_name": "",
            "event": {},
            "server_url": "https://github.com",
            "api_url": "https://api.github.com",
            "graphql_url": "https://api.github.com/graphql",
            "ref_name": facts.branch,
            "ref_protected": "false",
            "ref_type": "branch",
            "secret_source": "",
            "event_path": "/home/github/workflow/event.json",
            "path": "/home/github/workflow/paths.txt",
            "env": "/home/github/workflow/envs.txt",
        });

        let github_dynamic = json!({
            "workspace": "${GITHUB_WORKSPACE}",
            "action": "",
            "action_repository": "",
            "action_status": "",
            "action_path": "",
            "action_ref": "",
        });

        let runner = json!({
            "name": "Bugswarm GitHub Actions Runner",
            "os": "Linux",
            "arch": "X64",
            "temp": "/tmp",
            "tool_cache": "/opt/hostedtoolcache",
        });

        let strategy = json!({
            "fail_fast": "false",
            "job_index": "",
            "job_total": job_total.to_string(),
            "max_parallel": "1",
        });

        Self {
            github_static: as_map(github_static),
            github_dynamic: as_map(github_dynamic),
            runner: as_map(runner),
            strategy: as_map(strategy),
            matrix: lowercase_keys(&matrix),
            env: IndexMap::new(),
            inputs: IndexMap::new(),
        }
    }

    /// Replace the env layer with the merged workflow/job/parent-step/step
    /// environment. Values are expected to be substituted and quoted by the
    /// caller already.
    pub fn update_env(&mut self, env: IndexMap<String, String>) {
        self.env = env;
    }

    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Replace or merge the `INPUT_*` layer used inside composite and
    /// predefined actions.
    pub fn update_inputs(&mut self, inputs: IndexMap<String, String>, merge: bool) {
        if merge {
            self.inputs.extend(inputs);
        } else {
            self.inputs = inputs;
        }
    }

    /// Resolve a dotted path. Missing paths resolve to the empty string,
    /// matching provider behavior, with a warning.
    pub fn get(&self, path: &str) -> (Value, bool) {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head.to_lowercase(), rest),
            None => (path.to_lowercase(), ""),
        };

        match head.as_str() {
            "github" => self.get_github(rest),
            "matrix" => (walk(&self.matrix, rest), false),
            "runner" => (walk_map(&self.runner, rest), false),
            "strategy" => {
                let normalized = rest.to_lowercase().replace('-', "_");
                (walk_map(&self.strategy, &normalized), false)
            }
            "env" => {
                // Environment variables are already quoted shell text.
                let key = rest.to_string();
                match self.env.get(&key) {
                    Some(v) => (json!(v), true),
                    None => {
                        warn!("Path \"{}\" not present in context", path);
                        (json!(""), false)
                    }
                }
            }
            "job" => match rest.to_lowercase().as_str() {
                "status" => (json!("\"${_GITHUB_JOB_STATUS}\""), true),
                _ => {
                    warn!("Path \"{}\" not present in context", path);
                    (json!(""), false)
                }
            },
            "steps" => (self.get_steps(rest), true),
            "inputs" => (self.get_inputs(rest), true),
            "secrets" => {
                // Secrets are not reproduced; resolve to empty.
                warn!("Path \"{}\" resolves to a secret; substituting empty string", path);
                (json!(""), false)
            }
            _ => {
                warn!("Path \"{}\" not present in context", path);
                (json!(""), false)
            }
        }
    }

    fn get_github(&self, rest: &str) -> (Value, bool) {
        let key = rest.to_lowercase();
        if key == "workspace" {
            return (json!("${GITHUB_WORKSPACE}"), true);
        }
        if let Some(value) = self.github_dynamic.get(&key) {
            return (value.clone(), true);
        }
        match self.github_static.get(&key) {
            Some(value) => (value.clone(), false),
            None => {
                warn!("Path \"github.{}\" not present in context", rest);
                (json!(""), false)
            }
        }
    }

    /// `steps.<id>.outcome` and friends become environment variables the
    /// generated script maintains; `steps.<id>.outputs.<key>` goes through
    /// the step-outputs associative array.
    fn get_steps(&self, rest: &str) -> Value {
        let normalized = NON_WORD.replace_all(&rest.to_uppercase(), "_").into_owned();
        if OUTPUTS_PATH.is_match(&normalized) {
            json!(format!("${{STEP_OUTPUTS_ENV_MAP[_CONTEXT_STEPS_{normalized}]}}"))
        } else {
            json!(format!("${{_CONTEXT_STEPS_{normalized}}}"))
        }
    }

    /// Action inputs become `INPUT_<UPPER>` environment variables; names
    /// with dashes need `printenv` since bash cannot expand them directly.
    fn get_inputs(&self, rest: &str) -> Value {
        let key = format!("INPUT_{}", rest.to_uppercase().replace(' ', "_"));
        if let Some(value) = self.inputs.get(&key) {
            return json!(value);
        }
        if key.contains('-') {
            json!(format!("$(printenv {key})"))
        } else {
            json!(format!("${{{key}}}"))
        }
    }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn lowercase_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_keys).collect()),
        other => other.clone(),
    }
}

fn walk(value: &Value, path: &str) -> Value {
    if path.is_empty() {
        return value.clone();
    }
    let mut current = value;
    for key in path.split('.') {
        let key = key.to_lowercase();
        match current.get(&key) {
            Some(next) => current = next,
            None => {
                warn!("Path \"{}\" not present in context", path);
                return json!("");
            }
        }
    }
    current.clone()
}

fn walk_map(map: &Map<String, Value>, path: &str) -> Value {
    walk(&Value::Object(map.clone()), &path.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RootContext {
        let facts = JobFacts {
            repo: "owner/project".into(),
            sha: "abc123".into(),
            job_id: "987".into(),
            build_id: "555".into(),
            branch: "main".into(),
            workflow_job_id: "build".into(),
        };
        RootContext::new(&facts, json!({"os": "ubuntu-20.04", "Node": 14}), 1)
    }

    #[test]
    fn test_matrix_lookup_is_case_insensitive() {
        let ctx = context();
        let (value, dynamic) = ctx.get("matrix.node");
        assert_eq!(value, json!(14));
        assert!(!dynamic);
        let (value, _) = ctx.get("matrix.os");
        assert_eq!(value, json!("ubuntu-20.04"));
    }

    #[test]
    fn test_github_static_and_dynamic() {
        let ctx = context();
        let (value, dynamic) = ctx.get("github.repository");
        assert_eq!(value, json!("owner/project"));
        assert!(!dynamic);

        let (value, dynamic) = ctx.get("github.workspace");
        assert_eq!(value, json!("${GITHUB_WORKSPACE}"));
        assert!(dynamic);
    }

    #[test]
    fn test_job_status_is_dynamic() {
        let ctx = context();
        let (value, dynamic) = ctx.get("job.status");
        assert_eq!(value, json!("\"${_GITHUB_JOB_STATUS}\""));
        assert!(dynamic);
    }

    #[test]
    fn test_steps_paths_become_env_vars() {
        let ctx = context();
        let (value, dynamic) = ctx.get("steps.build-step.outcome");
        assert_eq!(value, json!("${_CONTEXT_STEPS_BUILD_STEP_OUTCOME}"));
        assert!(dynamic);

        let (value, _) = ctx.get("steps.build.outputs.version");
        assert_eq!(
            value,
            json!("${STEP_OUTPUTS_ENV_MAP[_CONTEXT_STEPS_BUILD_OUTPUTS_VERSION]}")
        );
    }

    #[test]
    fn test_inputs_resolution() {
        let mut ctx = context();
        let mut inputs = IndexMap::new();
        inputs.insert("INPUT_JAVA_VERSION".to_string(), "11".to_string());
        ctx.update_inputs(inputs, false);

        let (value, dynamic) = ctx.get("inputs.java_version");
        assert_eq!(value, json!("11"));
        assert!(dynamic);

        let (value, _) = ctx.get("inputs.unset_thing");
        assert_eq!(value, json!("${INPUT_UNSET_THING}"));
    }

    #[test]
    fn test_missing_path_resolves_empty() {
        let ctx = context();
        let (value, dynamic) = ctx.get("nonexistent.path");
        assert_eq!(value, json!(""));
        assert!(!dynamic);
    }

    #[test]
    fn test_env_layer() {
        let mut ctx = context();
        let mut env = IndexMap::new();
        env.insert("FOO".to_string(), "'bar baz'".to_string());
        ctx.update_env(env);
        let (value, dynamic) = ctx.get("env.FOO");
        assert_eq!(value, json!("'bar baz'"));
        assert!(dynamic);
    }
}
