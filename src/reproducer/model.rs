//! The repo → build-pair → job-pair → job hierarchy materialized from mined
//! input. Jobs and job pairs carry atomic flags workers flip concurrently;
//! everything else is written only between runs by the coordinator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyzer::comparer::MismatchedAttribute;
use crate::analyzer::report::ReportMap;

// ---------------------------------------------------------------------------
// Input JSON schema (§ external interfaces)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InputBuildPair {
    pub repo: String,
    pub pr_num: i64,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub is_error_pass: bool,
    #[serde(default)]
    pub repo_mined_version: Option<String>,
    pub failed_build: InputBuild,
    pub passed_build: InputBuild,
    pub jobpairs: Vec<InputJobPair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputBuild {
    pub build_id: Value,
    pub head_sha: String,
    #[serde(default)]
    pub base_sha: Option<String>,
    #[serde(default)]
    pub travis_merge_sha: Option<String>,
    #[serde(default)]
    pub committed_at: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub github_archived: bool,
    #[serde(default)]
    pub resettable: bool,
    pub jobs: Vec<InputJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputJob {
    pub job_id: Value,
    #[serde(default)]
    pub build_job: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputJobPair {
    pub failed_job: InputJobRef,
    pub passed_job: InputJobRef,
    #[serde(default)]
    pub build_system: Option<String>,
    #[serde(default)]
    pub is_filtered: bool,
    #[serde(default)]
    pub classification: Option<Value>,
    #[serde(default)]
    pub match_history: Option<BTreeMap<u32, MatchRecord>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputJobRef {
    pub job_id: Value,
    #[serde(default)]
    pub match_history: Option<BTreeMap<u32, MatchRecord>>,
}

// ---------------------------------------------------------------------------
// Match bookkeeping
// ---------------------------------------------------------------------------

/// One entry of a match history: a match type for a completed analysis, or
/// `N` when the run errored out before producing a reproduced log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRecord {
    Type(u8),
    NoRun,
}

impl Serialize for MatchRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MatchRecord::Type(t) => serializer.serialize_u8(*t),
            MatchRecord::NoRun => serializer.serialize_str("N"),
        }
    }
}

impl<'de> Deserialize<'de> for MatchRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => Ok(MatchRecord::Type(n.as_u64().unwrap_or(0) as u8)),
            Value::String(s) if s == "N" => Ok(MatchRecord::NoRun),
            other => Err(serde::de::Error::custom(format!(
                "invalid match record: {other}"
            ))),
        }
    }
}

pub type MatchHistory = BTreeMap<u32, MatchRecord>;

// ---------------------------------------------------------------------------
// Materialized model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    Failed,
    Passed,
}

impl JobRole {
    pub fn as_str(self) -> &'static str {
        match self {
            JobRole::Failed => "failed",
            JobRole::Passed => "passed",
        }
    }
}

/// Results a worker publishes for its job; read by the coordinator between
/// runs.
#[derive(Debug, Default)]
pub struct JobResults {
    pub orig_result: Option<ReportMap>,
    pub reproduced_result: Option<ReportMap>,
    pub mismatch_attrs: Vec<MismatchedAttribute>,
    pub pip_patch: bool,
    pub err_reason: Option<String>,
}

#[derive(Debug)]
pub struct Job {
    pub job_id: String,
    pub build_job: String,
    pub language: String,
    pub config: Value,
    pub repo: String,
    pub branch: String,
    pub base_sha: String,
    pub sha: String,
    pub travis_merge_sha: Option<String>,
    pub resettable: bool,
    pub github_archived: bool,
    pub is_pr: bool,
    pub role: JobRole,
    pub build_id: String,
    pub build_system: Option<String>,

    // Names derived once by the pair center.
    pub buildpair_name: String,
    pub jobpair_name: String,
    pub job_name: String,

    pub skip: AtomicBool,
    pub reproduced: AtomicBool,
    pub matched: AtomicBool,

    pub results: Mutex<JobResults>,
}

impl Job {
    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    pub fn is_reproduced(&self) -> bool {
        self.reproduced.load(Ordering::SeqCst)
    }

    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::SeqCst)
    }

    /// The `runs-on` label from the config, when present and a string or a
    /// label list.
    pub fn runs_on(&self) -> Option<String> {
        match self.config.get("runs-on") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .next()
                .map(str::to_string),
            _ => None,
        }
    }

    /// The container image from the config: either a bare string or the
    /// `image` key of a container mapping.
    pub fn container(&self) -> Option<String> {
        match self.config.get("container") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Object(map)) => map
                .get("image")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({})", self.job_name)
    }
}

#[derive(Debug, Default)]
pub struct PairHistories {
    pub match_history: MatchHistory,
    pub failed_job_match_history: MatchHistory,
    pub passed_job_match_history: MatchHistory,
}

#[derive(Debug)]
pub struct JobPair {
    pub repo: String,
    /// Failed first, passed second.
    pub jobs: [Arc<Job>; 2],
    pub jobpair_name: String,
    pub buildpair_name: String,
    pub full_name: String,
    pub is_filtered: bool,
    pub classification: Option<Value>,

    pub match_type: AtomicI32,
    pub reproduced: AtomicBool,
    pub skip: AtomicBool,

    pub histories: Mutex<PairHistories>,
    pub err_reason: Mutex<Option<String>>,
}

impl JobPair {
    pub fn failed_job(&self) -> &Arc<Job> {
        &self.jobs[0]
    }

    pub fn passed_job(&self) -> &Arc<Job> {
        &self.jobs[1]
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    pub fn is_reproduced(&self) -> bool {
        self.reproduced.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for JobPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobPair({})", self.full_name)
    }
}

#[derive(Debug)]
pub struct Build {
    pub build_id: String,
    pub base_sha: String,
    pub head_sha: String,
    pub travis_merge_sha: Option<String>,
    pub resettable: bool,
    pub github_archived: bool,
    pub committed_at: Option<String>,
    pub message: Option<String>,
    pub is_failed: bool,
    pub jobs: Vec<Arc<Job>>,
}

#[derive(Debug)]
pub struct BuildPair {
    pub repo: String,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub pr_num: i64,
    pub merged_at: Option<String>,
    pub is_error_pass: bool,
    /// Failed first, passed second.
    pub builds: [Build; 2],
    pub jobpairs: Vec<Arc<JobPair>>,
    pub buildpair_name: String,

    pub match_type: AtomicI32,
    pub done: AtomicBool,
    pub set_match_type: AtomicBool,
}

#[derive(Debug)]
pub struct Repo {
    pub repo: String,
    pub buildpairs: Vec<BuildPair>,
    pub has_repo: AtomicBool,
    pub clone_error: AtomicBool,
}

impl Repo {
    pub fn set_all_jobs_in_repo_to_skip(&self) {
        for bp in &self.buildpairs {
            for build in &bp.builds {
                for job in &build.jobs {
                    job.skip.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

/// A queue item: a single job during reproduce runs, a whole pair in
/// package mode.
#[derive(Clone)]
pub enum WorkItem {
    Job(Arc<Job>),
    JobPair(Arc<JobPair>),
}

impl WorkItem {
    pub fn name(&self) -> &str {
        match self {
            WorkItem::Job(job) => &job.job_name,
            WorkItem::JobPair(pair) => &pair.full_name,
        }
    }
}

/// Render a value that may be either a number or a string as the string
/// form used for IDs throughout the pipeline.
pub fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
