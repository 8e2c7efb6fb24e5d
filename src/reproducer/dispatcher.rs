//! The reproducing workflow: a pool of workers drains the pair center's
//! queue for each run, provisioning repositories, generating scripts,
//! building and running containers, and comparing the fresh logs against
//! the originals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::json;

use crate::analyzer::comparer;
use crate::analyzer::report::ReportMap;
use crate::analyzer::Analyzer;
use crate::config::{Config, CONTAINER_TIMEOUT_SECS, DISK_SPACE_FLOOR};
use crate::database::DatabaseClient;
use crate::docker::{ContainerRun, DockerClient};
use crate::error::{ReproduceError, Result};
use crate::github::GitHubClient;
use crate::reproducer::build_script::BuildScriptGenerator;
use crate::reproducer::dockerfile;
use crate::reproducer::model::{Job, WorkItem};
use crate::reproducer::pair_center::PairCenter;
use crate::reproducer::repo_setup::{self, SetupLocks};
use crate::reproducer::{packager, Packager};

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub pair_center: Arc<PairCenter>,
    pub analyzer: Arc<Analyzer>,
    pub docker: Arc<DockerClient>,
    pub github: Arc<GitHubClient>,
    pub database: Arc<DatabaseClient>,
    pub locks: Arc<SetupLocks>,
    pub error_reasons: Arc<Mutex<HashMap<String, String>>>,
    pub terminate: Arc<AtomicBool>,
    pub keep: bool,
    pub dependency_solver: bool,
}

pub struct JobDispatcher {
    ctx: Arc<WorkerContext>,
    threads: usize,
    runs: u32,
    package_mode: bool,
    items_processed: Arc<AtomicUsize>,
    reproduce_err: Arc<AtomicUsize>,
    start_time: Instant,
}

impl JobDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_file: &Path,
        config: Config,
        threads: usize,
        runs: u32,
        keep: bool,
        package_mode: bool,
        dependency_solver: bool,
    ) -> Result<Self> {
        info!("Initializing job dispatcher.");
        let pair_center = Arc::new(PairCenter::new(input_file, package_mode)?);
        let github = Arc::new(GitHubClient::new(&config.credentials.github_tokens));
        let database = Arc::new(DatabaseClient::new(
            &config.credentials.database_url,
            config.credentials.database_token.as_deref(),
        ));
        let analyzer = Arc::new(Analyzer::with_database(
            &config.credentials.github_tokens,
            DatabaseClient::new(
                &config.credentials.database_url,
                config.credentials.database_token.as_deref(),
            ),
        ));
        let config = Arc::new(config);

        let error_reasons = {
            let path = config.error_reason_file_path();
            let map = std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default();
            Arc::new(Mutex::new(map))
        };

        let ctx = Arc::new(WorkerContext {
            config,
            pair_center,
            analyzer,
            docker: Arc::new(DockerClient::new()),
            github,
            database,
            locks: SetupLocks::new(),
            error_reasons,
            terminate: Arc::new(AtomicBool::new(false)),
            keep,
            dependency_solver,
        });

        Ok(Self {
            ctx,
            threads: threads.max(1),
            runs,
            package_mode,
            items_processed: Arc::new(AtomicUsize::new(0)),
            reproduce_err: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        })
    }

    /// The entry point for reproducing (or packaging) the loaded pairs.
    pub async fn run(&mut self) -> Result<()> {
        if self.ctx.pair_center.total_jobs < 1 {
            info!("No jobs to reproduce. Exiting.");
            return Ok(());
        }
        self.ctx.config.directories_setup()?;

        // Stop cleanly between items on Ctrl-C.
        let terminate = self.ctx.terminate.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Caught interrupt. Cleaning up before terminating.");
                terminate.store(true, Ordering::SeqCst);
            }
        });

        if self.package_mode {
            self.run_package_phase().await?;
        } else {
            self.run_reproduce_phase().await?;
        }

        info!("Done! {}", self.progress_str());
        Ok(())
    }

    async fn run_reproduce_phase(&mut self) -> Result<()> {
        for run in 1..=self.runs {
            if self.ctx.terminate.load(Ordering::SeqCst) {
                break;
            }
            info!("Starting reproduce run {}/{}.", run, self.runs);
            if run > 1 {
                self.ctx.pair_center.reset_for_next_run();
            }
            self.ensure_disk_space().await?;

            self.ctx.pair_center.init_queue();
            self.spawn_workers(run).await;

            // Single-threaded bookkeeping between runs; workers are joined.
            let center = &self.ctx.pair_center;
            center.update_buildpair_done_status();
            center.assign_pair_match_types();
            center.assign_pair_match_history(run);
            center.assign_pair_patch_history(&self.ctx.config, run);
            center.set_skip_of_job_pairs();
            self.flush_error_reasons();
            info!("{}", self.progress_str());
        }

        let packager = Packager::new(self.ctx.clone(), self.runs);
        packager.report_reproducibility();
        packager.write_output_json()?;
        Ok(())
    }

    async fn run_package_phase(&mut self) -> Result<()> {
        self.ensure_disk_space().await?;
        self.ctx.pair_center.init_queue();
        self.spawn_workers(0).await;
        self.flush_error_reasons();

        let packager = Packager::new(self.ctx.clone(), self.runs);
        packager.report_reproducibility();
        packager.write_output_json()?;
        Ok(())
    }

    /// Launch up to `threads` workers and wait for the queue to drain.
    async fn spawn_workers(&self, run: u32) {
        let remaining = self.ctx.pair_center.get_num_remaining_items();
        if remaining == 0 {
            info!("No remaining items. Skipping run.");
            return;
        }
        let worker_count = self.threads.min(remaining);
        info!("Initialized {} workers.", worker_count);

        let mut handles = Vec::with_capacity(worker_count);
        for wid in 0..worker_count {
            let ctx = self.ctx.clone();
            let items_processed = self.items_processed.clone();
            let reproduce_err = self.reproduce_err.clone();
            handles.push(tokio::spawn(async move {
                worker_main(ctx, wid, run, items_processed, reproduce_err).await;
            }));
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Worker panicked: {e}");
            }
        }
    }

    fn progress_str(&self) -> String {
        format!(
            "{} total jobs, {} processed, {} errors, {} remaining, {:.0}s elapsed",
            self.ctx.pair_center.total_jobs,
            self.items_processed.load(Ordering::SeqCst),
            self.reproduce_err.load(Ordering::SeqCst),
            self.ctx.pair_center.get_num_remaining_items(),
            self.start_time.elapsed().as_secs_f64()
        )
    }

    fn flush_error_reasons(&self) {
        let reasons = self.ctx.error_reasons.lock().unwrap();
        let path = self.ctx.config.error_reason_file_path();
        if let Ok(serialized) = serde_json::to_string_pretty(&*reasons) {
            if let Err(e) = std::fs::write(&path, serialized) {
                warn!("Could not write error reasons to {}: {e}", path.display());
            }
        }
    }

    /// Enforce the free-disk floor: prune images and wipe the workspace
    /// when below it, and fail the task if that did not help.
    async fn ensure_disk_space(&self) -> Result<()> {
        if self.ctx.config.skip_check_disk {
            return Ok(());
        }
        if free_disk_fraction(&self.ctx.config.workspace_dir).await? >= DISK_SPACE_FLOOR {
            return Ok(());
        }
        warn!("Free disk below floor; pruning images and wiping workspace.");
        self.ctx.docker.prune_images().await?;
        let _ = tokio::fs::remove_dir_all(&self.ctx.config.workspace_dir).await;
        tokio::fs::create_dir_all(&self.ctx.config.workspace_dir).await?;

        let fraction = free_disk_fraction(&self.ctx.config.workspace_dir).await?;
        if fraction < DISK_SPACE_FLOOR {
            self.flush_error_reasons();
            return Err(ReproduceError::DiskExhausted(format!(
                "only {:.0}% free after pruning",
                fraction * 100.0
            )));
        }
        Ok(())
    }
}

/// Fraction of the filesystem holding `path` that is free.
async fn free_disk_fraction(path: &Path) -> Result<f64> {
    let output = tokio::process::Command::new("df")
        .args(["--output=pcent", &path.to_string_lossy()])
        .output()
        .await
        .map_err(|e| ReproduceError::Io(e))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let used_percent = text
        .lines()
        .nth(1)
        .and_then(|l| l.trim().trim_end_matches('%').parse::<f64>().ok())
        .unwrap_or(0.0);
    Ok(1.0 - used_percent / 100.0)
}

async fn worker_main(
    ctx: Arc<WorkerContext>,
    wid: usize,
    run: u32,
    items_processed: Arc<AtomicUsize>,
    reproduce_err: Arc<AtomicUsize>,
) {
    loop {
        if ctx.terminate.load(Ordering::SeqCst) {
            return;
        }
        let Some(item) = ctx.pair_center.dequeue_item() else {
            info!("[WORKER {wid}] Workload complete. Exiting worker.");
            return;
        };
        items_processed.fetch_add(1, Ordering::SeqCst);

        let outcome = match &item {
            WorkItem::Job(job) => process_job(&ctx, job, wid, run).await,
            WorkItem::JobPair(pair) => packager::package_jobpair(&ctx, pair).await,
        };

        if let Err(e) = outcome {
            error!("[WORKER {wid}] {} {e}", item.name());
            reproduce_err.fetch_add(1, Ordering::SeqCst);
            if e.is_fatal() {
                ctx.terminate.store(true, Ordering::SeqCst);
            }
            let reason = e.to_string();
            match &item {
                WorkItem::Job(job) => {
                    ctx.error_reasons
                        .lock()
                        .unwrap()
                        .insert(job.job_id.clone(), reason.clone());
                    if let ReproduceError::RepoClone(_) = e {
                        // Terminal clone failures poison the whole repo.
                        ctx.pair_center.poison_repo(&job.repo);
                    }
                    job.results.lock().unwrap().err_reason = Some(reason);
                }
                WorkItem::JobPair(pair) => {
                    *pair.err_reason.lock().unwrap() = Some(reason);
                }
            }
        }
    }
}

/// Reproduce one job: provision, generate, build, run, analyze, compare.
async fn process_job(ctx: &WorkerContext, job: &Arc<Job>, wid: usize, run: u32) -> Result<()> {
    let start = Instant::now();
    info!("[WORKER {wid}] Running {job}");

    let config = &ctx.config;
    let jobpair_dir = config.jobpair_dir(&job.buildpair_name, &job.jobpair_name);
    tokio::fs::create_dir_all(&jobpair_dir).await?;

    let log_path = config.log_path_in_task(&job.buildpair_name, &job.jobpair_name, &job.job_id, run);
    let info_path = jobpair_dir.join(format!("{}.{}.json", job.job_id, run));

    if !log_path.is_file() {
        reproduce_into(ctx, job, run, &log_path, &info_path, &jobpair_dir).await?;
    } else {
        debug!("Log already exists in task.");
    }

    analyze_and_compare(ctx, job, &log_path, &info_path).await?;

    info!(
        "[WORKER {wid}] Done running job {} after {:.1} seconds.",
        job.job_name,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn reproduce_into(
    ctx: &WorkerContext,
    job: &Arc<Job>,
    run: u32,
    log_path: &Path,
    info_path: &Path,
    jobpair_dir: &Path,
) -> Result<()> {
    let config = &ctx.config;

    repo_setup::setup_repo(job, config, &ctx.github, &ctx.locks).await?;

    let generator = BuildScriptGenerator::new(job, config, ctx.dependency_solver);
    generator.generate().await?;

    // The original log is needed both for base-image resolution and for
    // comparison later.
    let orig_log_path = config.orig_log_path(&job.job_id);
    let orig_log = ensure_orig_log(ctx, job, &orig_log_path).await.ok();

    let runs_on = dockerfile::resolve_runs_on(job, orig_log.as_deref());
    let image_tag = dockerfile::image_tag_for_job(job, &runs_on);
    let dockerfile_path = config.dockerfile_path(&job.job_id, &job.sha);
    dockerfile::write_job_dockerfile(&dockerfile_path, job, &image_tag, &runs_on)?;

    let local_image = format!("job_id:{}", job.job_id);
    let context_dir = config.reproduce_tmp_dir(&job.job_id, &job.sha);
    ctx.docker
        .build_image(&context_dir, &dockerfile_path, &local_image)
        .await?;

    let container_name = format!("job-{}-run-{}", job.job_id, run);
    let result = ctx
        .docker
        .run_container(&local_image, &container_name, CONTAINER_TIMEOUT_SECS)
        .await;

    // Keep the artifacts the packager needs next to the logs.
    copy_bundle_into_task(config, job, jobpair_dir).await?;

    match result {
        Ok(ContainerRun::Completed { log, exit_code }) => {
            tokio::fs::write(log_path, &log).await?;
            tokio::fs::write(info_path, json!({ "exit_code": exit_code }).to_string()).await?;
        }
        Ok(ContainerRun::TimedOut { log }) => {
            // The log is still captured; the job counts as attempted only.
            tokio::fs::write(log_path, &log).await?;
            clean_workspace_job_dir(ctx, job, &local_image).await;
            return Err(ReproduceError::Timeout(CONTAINER_TIMEOUT_SECS));
        }
        Err(e) => {
            clean_workspace_job_dir(ctx, job, &local_image).await;
            return Err(e);
        }
    }

    info!("Cleaning workspace.");
    clean_workspace_job_dir(ctx, job, &local_image).await;
    Ok(())
}

/// Remove the per-job workspace and, unless `--keep` was given, the
/// reproduction image.
async fn clean_workspace_job_dir(ctx: &WorkerContext, job: &Job, local_image: &str) {
    let _ = tokio::fs::remove_dir_all(ctx.config.workspace_job_dir(&job.job_id)).await;
    if !ctx.keep {
        let _ = ctx.docker.remove_image(local_image).await;
    }
}

/// Copy the generated script, Dockerfile, helpers, and repo tar into the
/// job pair's task directory for packaging.
async fn copy_bundle_into_task(config: &Config, job: &Job, jobpair_dir: &Path) -> Result<()> {
    let tmp = config.reproduce_tmp_dir(&job.job_id, &job.sha);
    let copies: [(PathBuf, PathBuf); 3] = [
        (tmp.join("run.sh"), jobpair_dir.join(format!("{}.sh", job.job_id))),
        (
            config.dockerfile_path(&job.job_id, &job.sha),
            jobpair_dir.join(format!("{}-Dockerfile", job.job_id)),
        ),
        (
            tmp.join(crate::config::TARFILE_NAME),
            jobpair_dir.join(format!("{}.tar", job.job_id)),
        ),
    ];
    for (src, dst) in copies {
        if src.is_file() {
            tokio::fs::copy(&src, &dst).await?;
        }
    }
    let helpers_src = tmp.join("helpers");
    let helpers_dst = jobpair_dir.join(format!("{}-helpers", job.job_id));
    if helpers_src.is_dir() && !helpers_dst.exists() {
        let _ = tokio::process::Command::new("cp")
            .args([
                "-a",
                &helpers_src.to_string_lossy().into_owned(),
                &helpers_dst.to_string_lossy().into_owned(),
            ])
            .output()
            .await;
    }
    Ok(())
}

/// Download the original log if it is not already on disk, returning its
/// text.
pub async fn ensure_orig_log(
    ctx: &WorkerContext,
    job: &Job,
    orig_log_path: &Path,
) -> Result<String> {
    if orig_log_path.is_file() {
        return Ok(tokio::fs::read_to_string(orig_log_path).await?);
    }
    debug!("Original log not found at {}.", orig_log_path.display());
    info!("Downloading original log for {}.", job.job_id);
    let url = format!(
        "https://api.github.com/repos/{}/actions/jobs/{}/logs",
        job.repo, job.job_id
    );
    let text = ctx.github.get_text(&url).await.map_err(|e| {
        ReproduceError::Api(format!("Could not download original log: {e}"))
    })?;
    if let Some(parent) = orig_log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(orig_log_path, &text).await?;
    Ok(text)
}

/// Analyze the original and reproduced logs and record the comparison on
/// the job. The original is analyzed even when reproduction failed, so its
/// result can still reach the artifact record.
async fn analyze_and_compare(
    ctx: &WorkerContext,
    job: &Arc<Job>,
    log_path: &Path,
    info_path: &Path,
) -> Result<()> {
    let config = &ctx.config;
    let orig_log_path = config.orig_log_path(&job.job_id);
    ensure_orig_log(ctx, job, &orig_log_path).await?;

    let mut original_result = ctx
        .analyzer
        .analyze_single_log(
            &orig_log_path,
            &job.job_id,
            job.build_system.as_deref(),
            Some(&job.sha),
            Some(&job.repo),
        )
        .await?;
    check_supported(&original_result, "Original")?;

    // The mined verdict outranks the analyzer for the passed side.
    if job.role == crate::reproducer::model::JobRole::Passed
        && original_result.get("tr_log_status").and_then(|v| v.as_str()) == Some("broken")
    {
        warn!("Analyzer incorrectly classified an ok original log as broken. Overriding.");
        original_result.insert("tr_log_status".into(), json!("ok"));
    }

    if !log_path.is_file() || !info_path.is_file() {
        job.results.lock().unwrap().orig_result = Some(original_result);
        return Ok(());
    }

    let mut reproduced_result = ctx
        .analyzer
        .analyze_single_log(
            log_path,
            &job.job_id,
            job.build_system.as_deref(),
            Some(&job.sha),
            Some(&job.repo),
        )
        .await?;
    check_supported(&reproduced_result, "Reproduced")?;

    // The container's exit code is authoritative for the reproduced run.
    let run_info: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(info_path).await?)?;
    let exit_code = run_info.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(1);
    let job_status = if exit_code == 0 { "ok" } else { "broken" };
    if reproduced_result.get("tr_log_status").and_then(|v| v.as_str()) != Some(job_status) {
        warn!(
            "Analyzer classified a(n) {} reproduced log as {:?}. Overriding.",
            job_status,
            reproduced_result.get("tr_log_status")
        );
        reproduced_result.insert("tr_log_status".into(), json!(job_status));
    }

    let (matched, mismatch_attrs) =
        comparer::compare_attributes(&reproduced_result, &original_result, false);
    job.matched.store(matched, Ordering::SeqCst);
    job.reproduced.store(true, Ordering::SeqCst);

    if matched {
        info!("Reproduced log and original log match        ({})", job.job_name);
    } else {
        info!("Reproduced log and original log do not match ({})", job.job_name);
        info!("The original log is stored at {}.", orig_log_path.display());
        info!("The reproduced log is stored at {}.", log_path.display());
        for m in &mismatch_attrs {
            info!("  {:<40}(original, reproduced) = ({}, {})", m.attr, m.orig, m.reproduced);
        }
    }

    let mut results = job.results.lock().unwrap();
    results.orig_result = Some(original_result);
    results.reproduced_result = Some(reproduced_result);
    results.mismatch_attrs = mismatch_attrs;
    Ok(())
}

fn check_supported(result: &ReportMap, which: &str) -> Result<()> {
    if result
        .get("not_in_supported_language")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let language = result
            .get("tr_log_lan")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        return Err(ReproduceError::UnsupportedWorkflow(format!(
            "{which} log was not generated from a job in a supported programming language. \
             The primary language was \"{language}\"."
        )));
    }
    Ok(())
}
