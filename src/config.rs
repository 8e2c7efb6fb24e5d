use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default wall-clock cap for a reproducing container, in seconds.
pub const CONTAINER_TIMEOUT_SECS: u64 = 1800;

/// Default number of reproduce runs per task.
pub const DEFAULT_RUNS: u32 = 5;

/// Free-disk floor, as a fraction of the filesystem. Below this the
/// dispatcher prunes images and wipes the workspace before the next run.
pub const DISK_SPACE_FLOOR: f64 = 0.2;

/// Name of the tar produced for each job's working tree.
pub const TARFILE_NAME: &str = "repo-to-docker.tar";

/// Configuration file structure for the reproducer.
///
/// Credentials and registry settings are loaded from `bugswarm.toml` (or a
/// path given on the command line); everything else is derived from the task
/// name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Credentials {
    /// GitHub API tokens, rotated on rate-limit exhaustion.
    #[serde(default)]
    pub github_tokens: Vec<String>,

    /// Docker registry to push packaged images to (e.g. 'docker.io/bugswarm').
    pub docker_registry: Option<String>,

    /// Metadata database endpoint.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Metadata database pipeline token.
    pub database_token: Option<String>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            github_tokens: Vec::new(),
            docker_registry: None,
            database_url: default_database_url(),
            database_token: None,
        }
    }
}

fn default_database_url() -> String {
    "http://www.api.bugswarm.org/v1".to_string()
}

impl Credentials {
    /// Load credentials from a file, falling back to `./bugswarm.toml` and
    /// then to empty defaults (anonymous API access, no pushes).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }
        let candidate = Path::new("bugswarm.toml");
        if candidate.exists() {
            return Self::load_from_path(candidate);
        }
        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials file: {}", path.display()))
    }
}

/// Per-task directory layout and tunables.
///
/// All reproducer state lives under the current working directory:
/// `workspace/` for per-job working copies, `stored_repos/` for cached
/// clones, `<task>/` for materialized artifacts, and `output/` for the
/// annotated result JSON.
#[derive(Debug, Clone)]
pub struct Config {
    pub task: String,
    pub workspace_dir: PathBuf,
    pub stored_repos_dir: PathBuf,
    pub task_dir: PathBuf,
    pub orig_logs_dir: PathBuf,
    pub output_dir: PathBuf,
    pub result_json_dir: PathBuf,
    pub skip_check_disk: bool,
    pub credentials: Credentials,
}

impl Config {
    pub fn new(task: &str, credentials: Credentials) -> Self {
        let task_dir = PathBuf::from(task);
        Self {
            task: task.to_string(),
            workspace_dir: PathBuf::from("workspace"),
            stored_repos_dir: PathBuf::from("stored_repos"),
            orig_logs_dir: task_dir.join("orig_logs"),
            output_dir: PathBuf::from("output"),
            result_json_dir: PathBuf::from("output").join("result_json"),
            task_dir,
            skip_check_disk: false,
            credentials,
        }
    }

    /// Create every directory the task needs up front so workers never race
    /// on `mkdir`.
    pub fn directories_setup(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.workspace_dir)?;
        std::fs::create_dir_all(&self.stored_repos_dir)?;
        std::fs::create_dir_all(&self.task_dir)?;
        std::fs::create_dir_all(&self.orig_logs_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.result_json_dir)?;
        Ok(())
    }

    // ---- stored_repos/ ----

    pub fn repo_storage_dir(&self, repo: &str) -> PathBuf {
        self.stored_repos_dir.join(repo)
    }

    pub fn repo_storage_tar_path(&self, repo: &str) -> PathBuf {
        self.stored_repos_dir.join(repo).join("repo.tar")
    }

    pub fn repo_zip_path(&self, repo: &str, sha: &str) -> PathBuf {
        self.stored_repos_dir
            .join(repo)
            .join(format!("{sha}.zip"))
    }

    // ---- workspace/<job_id>/<sha>/ ----

    pub fn workspace_job_dir(&self, job_id: &str) -> PathBuf {
        self.workspace_dir.join(job_id)
    }

    pub fn workspace_sha_dir(&self, job_id: &str, sha: &str) -> PathBuf {
        self.workspace_dir.join(job_id).join(sha)
    }

    /// The per-job working copy of the repository.
    pub fn reproducing_repo_dir(&self, job_id: &str, sha: &str, repo: &str) -> PathBuf {
        self.workspace_sha_dir(job_id, sha).join(repo)
    }

    /// Where generated files (run.sh, Dockerfile, tar, logs) land before
    /// being copied into the task directory.
    pub fn reproduce_tmp_dir(&self, job_id: &str, sha: &str) -> PathBuf {
        self.workspace_sha_dir(job_id, sha).join("reproduce_tmp")
    }

    pub fn dockerfile_path(&self, job_id: &str, sha: &str) -> PathBuf {
        self.reproduce_tmp_dir(job_id, sha)
            .join(format!("{job_id}-Dockerfile"))
    }

    // ---- <task>/<buildpair_name>/<jobpair_name>/ ----

    pub fn jobpair_dir(&self, buildpair_name: &str, jobpair_name: &str) -> PathBuf {
        self.task_dir.join(buildpair_name).join(jobpair_name)
    }

    pub fn orig_log_path(&self, job_id: &str) -> PathBuf {
        self.orig_logs_dir.join(format!("{job_id}-orig.log"))
    }

    pub fn log_path_in_task(
        &self,
        buildpair_name: &str,
        jobpair_name: &str,
        job_id: &str,
        run: u32,
    ) -> PathBuf {
        self.jobpair_dir(buildpair_name, jobpair_name)
            .join(format!("{job_id}.{run}.log"))
    }

    pub fn error_reason_file_path(&self) -> PathBuf {
        self.task_dir.join("error_reasons.json")
    }

    pub fn result_json_path(&self) -> PathBuf {
        self.result_json_dir.join(format!("{}.json", self.task))
    }
}
