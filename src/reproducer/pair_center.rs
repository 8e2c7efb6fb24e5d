//! The in-memory repo → build-pair → job-pair → job hierarchy, the per-run
//! work queue, and all match-type / match-history bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, error, info};
use serde_json::Value;

use crate::analyzer::report::ReportMap;
use crate::error::{ReproduceError, Result};
use crate::reproducer::model::{
    id_string, Build, BuildPair, InputBuildPair, Job, JobPair, JobResults, JobRole, MatchRecord,
    PairHistories, Repo, WorkItem,
};

pub struct PairCenter {
    pub repos: IndexMap<String, Repo>,
    pub package_mode: bool,
    pub total_buildpairs: usize,
    pub total_jobpairs: usize,
    pub total_jobs: usize,

    items: Mutex<Vec<WorkItem>>,
    queue: Mutex<VecDeque<usize>>,
}

impl PairCenter {
    /// Read the input file of mined pairs and materialize the model
    /// hierarchy. Filtered job pairs are skipped.
    pub fn new(input_file: &Path, package_mode: bool) -> Result<Self> {
        info!("Initializing pair center.");
        let text = std::fs::read_to_string(input_file).map_err(|e| {
            ReproduceError::InvalidInput(format!(
                "Error reading input file {}: {e}",
                input_file.display()
            ))
        })?;
        let buildpairs: Vec<InputBuildPair> = serde_json::from_str(&text).map_err(|e| {
            ReproduceError::InvalidInput(format!(
                "Error parsing input file {}: {e}",
                input_file.display()
            ))
        })?;

        let mut center = Self {
            repos: IndexMap::new(),
            package_mode,
            total_buildpairs: 0,
            total_jobpairs: 0,
            total_jobs: 0,
            items: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
        };

        for bp in buildpairs {
            // A build pair with only filtered job pairs is dropped outright.
            if bp.jobpairs.iter().all(|jp| jp.is_filtered) {
                continue;
            }
            let repo = bp.repo.clone();
            let materialized = materialize_buildpair(&bp)?;
            center
                .repos
                .entry(repo.clone())
                .or_insert_with(|| Repo {
                    repo,
                    buildpairs: Vec::new(),
                    has_repo: Default::default(),
                    clone_error: Default::default(),
                })
                .buildpairs
                .push(materialized);
        }

        center.set_skip_of_job_pairs();
        center.recount();
        debug!(
            "pair_center.total_buildpairs = {} total_jobpairs = {} total_jobs = {}",
            center.total_buildpairs, center.total_jobpairs, center.total_jobs
        );
        Ok(center)
    }

    fn recount(&mut self) {
        self.total_buildpairs = self.repos.values().map(|r| r.buildpairs.len()).sum();
        self.total_jobpairs = self
            .repos
            .values()
            .flat_map(|r| &r.buildpairs)
            .map(|bp| bp.jobpairs.len())
            .sum();
        self.total_jobs = self
            .jobpairs()
            .flat_map(|jp| jp.jobs.iter())
            .filter(|j| j.job_id != "0")
            .count();
    }

    pub fn jobpairs(&self) -> impl Iterator<Item = &Arc<JobPair>> {
        self.repos
            .values()
            .flat_map(|r| &r.buildpairs)
            .flat_map(|bp| &bp.jobpairs)
    }

    pub fn buildpairs(&self) -> impl Iterator<Item = &BuildPair> {
        self.repos.values().flat_map(|r| &r.buildpairs)
    }

    // ------------------------------------------------------------------
    // Work queue
    // ------------------------------------------------------------------

    /// Rebuild the per-phase queue: jobs for reproduce runs, job pairs for
    /// packaging. Each eligible item is enqueued exactly once.
    pub fn init_queue(&self) {
        let mut items = Vec::new();
        if self.package_mode {
            for jp in self.jobpairs() {
                if !jp.is_reproduced() && !jp.is_skipped() {
                    items.push(WorkItem::JobPair(jp.clone()));
                }
            }
        } else {
            for jp in self.jobpairs() {
                // Reproduce the passed job first so pruning can skip the
                // failed side after a passed-side mismatch.
                for idx in [1, 0] {
                    let job = &jp.jobs[idx];
                    if !job.is_reproduced() && !job.is_skipped() && job.job_id != "0" {
                        items.push(WorkItem::Job(job.clone()));
                    }
                }
            }
        }

        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        queue.extend(0..items.len());
        *self.items.lock().unwrap() = items;
        info!("Finished initializing job queue.");
    }

    pub fn dequeue_item(&self) -> Option<WorkItem> {
        let index = self.queue.lock().unwrap().pop_front()?;
        let items = self.items.lock().unwrap();
        items.get(index).cloned()
    }

    pub fn get_num_remaining_items(&self) -> usize {
        if self.package_mode {
            self.jobpairs()
                .filter(|jp| !jp.is_reproduced() && !jp.is_skipped())
                .count()
        } else {
            self.jobpairs()
                .flat_map(|jp| jp.jobs.iter())
                .filter(|j| !j.is_reproduced() && !j.is_skipped() && j.job_id != "0")
                .count()
        }
    }

    /// Clear per-run job state so the next run attempts everything that is
    /// not permanently skipped.
    pub fn reset_for_next_run(&self) {
        for jp in self.jobpairs() {
            jp.reproduced.store(false, Ordering::SeqCst);
            for job in &jp.jobs {
                job.reproduced.store(false, Ordering::SeqCst);
                job.matched.store(false, Ordering::SeqCst);
            }
        }
        for bp in self.buildpairs() {
            bp.done.store(false, Ordering::SeqCst);
            bp.set_match_type.store(false, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Match bookkeeping (single-threaded, between runs)
    // ------------------------------------------------------------------

    pub fn update_buildpair_done_status(&self) {
        for bp in self.buildpairs() {
            let mut buildpair_done = true;
            for jp in &bp.jobpairs {
                for job in jp.jobs.iter() {
                    if !job.is_reproduced() && !job.is_skipped() && job.job_id != "0" {
                        buildpair_done = false;
                    }
                }
            }
            if buildpair_done {
                bp.done.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Derive build-pair and job-pair match types from the per-job results
    /// of the run that just completed.
    pub fn assign_pair_match_types(&self) {
        for bp in self.buildpairs() {
            if !bp.done.load(Ordering::SeqCst) || bp.set_match_type.load(Ordering::SeqCst) {
                continue;
            }
            let bp_match = if is_buildpair_match_type_1(bp) {
                1
            } else if is_buildpair_match_type_2(bp) {
                2
            } else if is_buildpair_match_type_3(bp) {
                3
            } else {
                0
            };
            bp.match_type.store(bp_match, Ordering::SeqCst);

            for jp in &bp.jobpairs {
                let jp_match = if is_jobpair_match_type_1(jp) {
                    1
                } else if is_jobpair_match_type_2(jp) {
                    2
                } else if is_jobpair_match_type_3(jp) {
                    3
                } else {
                    0
                };
                jp.match_type.store(jp_match, Ordering::SeqCst);
            }

            bp.set_match_type.store(true, Ordering::SeqCst);
        }
    }

    /// Record this run's outcome in each pair's histories. Pairs whose jobs
    /// did not both produce a reproduced log record `N`.
    pub fn assign_pair_match_history(&self, run: u32) {
        for bp in self.buildpairs() {
            // Match types are only derived once the build pair is done.
            let done = bp.done.load(Ordering::SeqCst);
            for jp in &bp.jobpairs {
                if jp.is_skipped() {
                    continue;
                }
                let both_reproduced =
                    done && jp.jobs[0].is_reproduced() && jp.jobs[1].is_reproduced();
                let mut histories = jp.histories.lock().unwrap();
                if both_reproduced {
                    let match_type = jp.match_type.load(Ordering::SeqCst).clamp(0, 3) as u8;
                    histories.match_history.insert(run, MatchRecord::Type(match_type));
                    histories.failed_job_match_history.insert(
                        run,
                        MatchRecord::Type(jp.jobs[0].is_matched() as u8),
                    );
                    histories.passed_job_match_history.insert(
                        run,
                        MatchRecord::Type(jp.jobs[1].is_matched() as u8),
                    );
                } else {
                    histories.match_history.insert(run, MatchRecord::NoRun);
                    histories
                        .failed_job_match_history
                        .insert(run, MatchRecord::NoRun);
                    histories
                        .passed_job_match_history
                        .insert(run, MatchRecord::NoRun);
                }
            }
        }
    }

    /// Record whether this run left a pip patch file for each job.
    pub fn assign_pair_patch_history(&self, config: &crate::config::Config, run: u32) {
        for jp in self.jobpairs() {
            for job in jp.jobs.iter() {
                let patch_path = config
                    .jobpair_dir(&job.buildpair_name, &job.jobpair_name)
                    .join(format!("{}.{}-pip-patch.json", job.job_id, run));
                job.results.lock().unwrap().pip_patch = patch_path.is_file();
            }
        }
    }

    /// Mark pairs unstable across three recorded runs (all misses, or mixed
    /// outcomes) as skipped for subsequent runs.
    pub fn set_skip_of_job_pairs(&self) {
        for jp in self.jobpairs() {
            let histories = jp.histories.lock().unwrap();
            let outcomes: Vec<MatchRecord> =
                histories.match_history.values().copied().collect();
            drop(histories);

            if outcomes.len() < 3 {
                continue;
            }
            let recent = &outcomes[outcomes.len() - 3..];
            let all_zero = recent
                .iter()
                .all(|r| *r == MatchRecord::Type(0));
            let distinct: std::collections::BTreeSet<String> =
                recent.iter().map(|r| format!("{r:?}")).collect();
            if all_zero || distinct.len() > 1 {
                info!(
                    "Skipping jobpair {} because no match or unstable in 3 runs.",
                    jp.jobpair_name
                );
                jp.skip.store(true, Ordering::SeqCst);
                for job in jp.jobs.iter() {
                    job.skip.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Poison every job of a repo after a terminal clone failure.
    pub fn poison_repo(&self, repo: &str) {
        if let Some(repo_obj) = self.repos.get(repo) {
            repo_obj.clone_error.store(true, Ordering::SeqCst);
            repo_obj.set_all_jobs_in_repo_to_skip();
        }
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

fn materialize_buildpair(bp: &InputBuildPair) -> Result<BuildPair> {
    let failed_build_id = id_string(&bp.failed_build.build_id);
    let passed_build_id = id_string(&bp.passed_build.build_id);
    let buildpair_name = format!(
        "{}/{}-{}-{}",
        bp.repo, bp.pr_num, failed_build_id, passed_build_id
    );
    let is_pr = bp.pr_num != -1;

    // Decide each job's pair membership and build system up front so names
    // are fixed before the jobs are shared.
    let mut jobpair_names: HashMap<String, String> = HashMap::new();
    let mut build_systems: HashMap<String, Option<String>> = HashMap::new();
    for jp in &bp.jobpairs {
        if jp.is_filtered {
            continue;
        }
        let failed_id = id_string(&jp.failed_job.job_id);
        let passed_id = id_string(&jp.passed_job.job_id);
        let jobpair_name = format!("{failed_id}-{passed_id}");
        let build_system = jp
            .build_system
            .as_deref()
            .filter(|s| *s != "NA")
            .map(str::to_lowercase);
        for job_id in [&failed_id, &passed_id] {
            jobpair_names.insert(job_id.clone(), jobpair_name.clone());
            build_systems.insert(job_id.clone(), build_system.clone());
        }
    }

    let mut jobs_by_id: HashMap<String, Arc<Job>> = HashMap::new();
    let mut make_build = |input: &crate::reproducer::model::InputBuild,
                          is_failed: bool|
     -> Build {
        let build_id = id_string(&input.build_id);
        let jobs: Vec<Arc<Job>> = input
            .jobs
            .iter()
            .map(|j| {
                let job_id = id_string(&j.job_id);
                let jobpair_name = jobpair_names.get(&job_id).cloned().unwrap_or_default();
                let job = Arc::new(Job {
                    job_id: job_id.clone(),
                    build_job: j.build_job.clone().unwrap_or_default(),
                    language: j.language.clone().unwrap_or_default(),
                    config: j.config.clone(),
                    repo: bp.repo.clone(),
                    branch: bp.branch.clone().unwrap_or_default(),
                    base_sha: input.base_sha.clone().unwrap_or_default(),
                    sha: input.head_sha.clone(),
                    travis_merge_sha: input.travis_merge_sha.clone(),
                    resettable: input.resettable,
                    github_archived: input.github_archived,
                    is_pr,
                    role: if is_failed {
                        JobRole::Failed
                    } else {
                        JobRole::Passed
                    },
                    build_id: build_id.clone(),
                    build_system: build_systems.get(&job_id).cloned().flatten(),
                    buildpair_name: buildpair_name.clone(),
                    jobpair_name: jobpair_name.clone(),
                    job_name: format!("{buildpair_name}/{jobpair_name}/{job_id}"),
                    skip: Default::default(),
                    reproduced: Default::default(),
                    matched: Default::default(),
                    results: Mutex::new(JobResults::default()),
                });
                jobs_by_id.insert(job_id, job.clone());
                job
            })
            .collect();
        Build {
            build_id,
            base_sha: input.base_sha.clone().unwrap_or_default(),
            head_sha: input.head_sha.clone(),
            travis_merge_sha: input.travis_merge_sha.clone(),
            resettable: input.resettable,
            github_archived: input.github_archived,
            committed_at: input.committed_at.clone(),
            message: input.message.clone(),
            is_failed,
            jobs,
        }
    };

    let failed_build = make_build(&bp.failed_build, true);
    let passed_build = make_build(&bp.passed_build, false);

    let mut jobpairs = Vec::new();
    for jp in &bp.jobpairs {
        if jp.is_filtered {
            continue;
        }
        let failed_id = id_string(&jp.failed_job.job_id);
        let passed_id = id_string(&jp.passed_job.job_id);
        let (Some(failed_job), Some(passed_job)) =
            (jobs_by_id.get(&failed_id), jobs_by_id.get(&passed_id))
        else {
            error!(
                "Jobpair {}-{} references jobs missing from the builds.",
                failed_id, passed_id
            );
            return Err(ReproduceError::InvalidInput(format!(
                "jobpair {failed_id}-{passed_id} references unknown jobs"
            )));
        };
        let jobpair_name = format!("{failed_id}-{passed_id}");
        let histories = PairHistories {
            match_history: jp.match_history.clone().unwrap_or_default(),
            failed_job_match_history: jp
                .failed_job
                .match_history
                .clone()
                .unwrap_or_default(),
            passed_job_match_history: jp
                .passed_job
                .match_history
                .clone()
                .unwrap_or_default(),
        };
        jobpairs.push(Arc::new(JobPair {
            repo: bp.repo.clone(),
            jobs: [failed_job.clone(), passed_job.clone()],
            jobpair_name: jobpair_name.clone(),
            buildpair_name: buildpair_name.clone(),
            full_name: format!("{buildpair_name}/{jobpair_name}"),
            is_filtered: jp.is_filtered,
            classification: jp.classification.clone(),
            match_type: Default::default(),
            reproduced: Default::default(),
            skip: Default::default(),
            histories: Mutex::new(histories),
            err_reason: Mutex::new(None),
        }));
    }

    Ok(BuildPair {
        repo: bp.repo.clone(),
        branch: bp.branch.clone(),
        base_branch: bp.base_branch.clone(),
        pr_num: bp.pr_num,
        merged_at: bp.merged_at.clone(),
        is_error_pass: bp.is_error_pass,
        builds: [failed_build, passed_build],
        jobpairs,
        buildpair_name,
        match_type: Default::default(),
        done: Default::default(),
        set_match_type: Default::default(),
    })
}

// ---------------------------------------------------------------------------
// Match-type definitions
// ---------------------------------------------------------------------------

fn result_status(result: &ReportMap) -> Option<&str> {
    result.get("tr_log_status").and_then(Value::as_str)
}

fn result_num(result: &ReportMap, key: &str) -> Option<i64> {
    result.get(key).and_then(Value::as_i64)
}

/// Match type 1: both reproduced logs fully match the originals.
fn is_jobpair_match_type_1(jp: &JobPair) -> bool {
    jp.jobs[0].is_matched() && jp.jobs[1].is_matched()
}

/// Match type 2: still a fail-pass (or error-pass) pair, but some compared
/// attribute differs.
fn is_jobpair_match_type_2(jp: &JobPair) -> bool {
    let failed = jp.jobs[0].results.lock().unwrap();
    let passed = jp.jobs[1].results.lock().unwrap();
    let (Some(failed_result), Some(passed_result)) =
        (&failed.reproduced_result, &passed.reproduced_result)
    else {
        return false;
    };
    let failed_job_failed = result_status(failed_result) != Some("ok");
    let passed_job_passed = result_status(passed_result) == Some("ok");
    failed_job_failed && passed_job_passed
}

/// Match type 3: not a fail-pass pair anymore, but the failed job still has
/// failing tests and the passed job has none.
fn is_jobpair_match_type_3(jp: &JobPair) -> bool {
    let failed = jp.jobs[0].results.lock().unwrap();
    let passed = jp.jobs[1].results.lock().unwrap();
    let (Some(failed_result), Some(passed_result)) =
        (&failed.reproduced_result, &passed.reproduced_result)
    else {
        return false;
    };
    let failed_has_failed_tests =
        result_num(failed_result, "tr_log_num_tests_failed").is_some_and(|n| n > 0);
    let passed_ok = match (
        result_num(passed_result, "tr_log_num_tests_run"),
        result_num(passed_result, "tr_log_num_tests_failed"),
    ) {
        (Some(run), Some(failed_count)) => run > 0 && failed_count == 0,
        _ => return false,
    };
    failed_has_failed_tests && passed_ok
}

fn is_buildpair_match_type_1(bp: &BuildPair) -> bool {
    bp.builds
        .iter()
        .all(|b| b.jobs.iter().all(|j| j.is_matched()))
}

fn is_buildpair_match_type_2(bp: &BuildPair) -> bool {
    for build in &bp.builds {
        for job in &build.jobs {
            if job.results.lock().unwrap().reproduced_result.is_none() {
                return false;
            }
        }
    }
    let failed_build_failed = bp.builds[0].jobs.iter().any(|j| {
        j.results
            .lock()
            .unwrap()
            .reproduced_result
            .as_ref()
            .is_some_and(|r| result_status(r) != Some("ok"))
    });
    let passed_build_passed = bp.builds[1].jobs.iter().all(|j| {
        j.results
            .lock()
            .unwrap()
            .reproduced_result
            .as_ref()
            .map_or(true, |r| result_status(r) == Some("ok"))
    });
    failed_build_failed && passed_build_passed
}

fn is_buildpair_match_type_3(bp: &BuildPair) -> bool {
    for build in &bp.builds {
        for job in &build.jobs {
            if job.results.lock().unwrap().reproduced_result.is_none() {
                return false;
            }
        }
    }
    let failed_build_has_failed_tests = bp.builds[0].jobs.iter().any(|j| {
        j.results
            .lock()
            .unwrap()
            .reproduced_result
            .as_ref()
            .is_some_and(|r| result_num(r, "tr_log_num_tests_failed").is_some_and(|n| n > 0))
    });
    let mut passed_build_has_no_failed_tests = true;
    for job in &bp.builds[1].jobs {
        let results = job.results.lock().unwrap();
        if let Some(result) = &results.reproduced_result {
            match (
                result_num(result, "tr_log_num_tests_run"),
                result_num(result, "tr_log_num_tests_failed"),
            ) {
                (Some(run), Some(failed_count)) => {
                    if !(run > 0 && failed_count == 0) {
                        passed_build_has_no_failed_tests = false;
                    }
                }
                _ => return false,
            }
        }
    }
    failed_build_has_failed_tests && passed_build_has_no_failed_tests
}
