//! After the reproduce runs: classify each pair's stability, assemble the
//! job-pair artifact image, and emit the metadata record.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, warn};
use serde_json::{json, Value};

use crate::error::{ReproduceError, Result};
use crate::reproducer::dispatcher::{ensure_orig_log, WorkerContext};
use crate::reproducer::dockerfile::write_jobpair_dockerfile;
use crate::reproducer::model::{Job, JobPair, MatchHistory, MatchRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Reproducible,
    Flaky,
    Unreproducible,
}

impl Stability {
    pub fn as_str(self) -> &'static str {
        match self {
            Stability::Reproducible => "Reproducible",
            Stability::Flaky => "Flaky",
            Stability::Unreproducible => "Unreproducible",
        }
    }
}

pub fn reproduce_successes(history: &MatchHistory) -> usize {
    history
        .values()
        .filter(|r| **r == MatchRecord::Type(1))
        .count()
}

pub fn reproduce_attempts(history: &MatchHistory) -> usize {
    history
        .values()
        .filter(|r| **r != MatchRecord::NoRun)
        .count()
}

/// Stability after N runs: every run a full match is reproducible, none is
/// unreproducible, anything in between is flaky.
pub fn classify(history: &MatchHistory, runs: u32) -> Stability {
    let successes = reproduce_successes(history);
    if successes == runs as usize {
        Stability::Reproducible
    } else if successes > 0 {
        Stability::Flaky
    } else {
        Stability::Unreproducible
    }
}

/// `<repo with slashes replaced by dashes>-<failed job id>`.
pub fn construct_jobpair_image_tag(jobpair: &JobPair) -> String {
    format!(
        "{}-{}",
        jobpair.repo.replace('/', "-"),
        jobpair.failed_job().job_id
    )
}

pub struct Packager {
    ctx: Arc<WorkerContext>,
    runs: u32,
}

impl Packager {
    pub fn new(ctx: Arc<WorkerContext>, runs: u32) -> Self {
        Self { ctx, runs }
    }

    /// Log each pair's match history and reproducibility verdict.
    pub fn report_reproducibility(&self) {
        info!("Visualizing match history:");
        info!("N means no reproduced log exists. (An error occurred while reproducing the job.)");
        for jp in self.ctx.pair_center.jobpairs() {
            let histories = jp.histories.lock().unwrap();
            info!("{}", jp.full_name);
            for (history, name) in [
                (&histories.match_history, "Job pair"),
                (&histories.failed_job_match_history, "Failed job"),
                (&histories.passed_job_match_history, "Passed job"),
            ] {
                let rendered: Vec<String> = (1..=self.runs)
                    .map(|run| match history.get(&run) {
                        Some(MatchRecord::Type(t)) => t.to_string(),
                        _ => "N".to_string(),
                    })
                    .collect();
                if history.is_empty() {
                    info!("No match history. (This jobpair is not reproduced.)");
                } else {
                    info!("{:>24} match history: {}", name, rendered.join(" -> "));
                }
            }
        }

        info!("Visualizing reproducibility:");
        for jp in self.ctx.pair_center.jobpairs() {
            let histories = jp.histories.lock().unwrap();
            let stability = classify(&histories.match_history, self.runs);
            info!(
                "{} job pair reproducibility: {}",
                jp.full_name,
                stability.as_str()
            );
        }
    }

    /// Write the result JSON annotated with match histories, analyzed
    /// results, mismatched attributes, and patches.
    pub fn write_output_json(&self) -> Result<()> {
        info!("Writing output JSON annotated with match history.");
        let mut records = Vec::new();
        for bp in self.ctx.pair_center.buildpairs() {
            let mut jobpairs = Vec::new();
            for jp in &bp.jobpairs {
                let histories = jp.histories.lock().unwrap();
                let stability = classify(&histories.match_history, self.runs);
                jobpairs.push(json!({
                    "failed_job": job_record(jp.failed_job(), &histories.failed_job_match_history),
                    "passed_job": job_record(jp.passed_job(), &histories.passed_job_match_history),
                    "jobpair_name": jp.jobpair_name.clone(),
                    "is_filtered": jp.is_filtered,
                    "classification": jp.classification.clone(),
                    "build_system": jp.failed_job().build_system.clone(),
                    "match_history": histories.match_history.clone(),
                    "reproduce_successes": reproduce_successes(&histories.match_history),
                    "reproduce_attempts": reproduce_attempts(&histories.match_history),
                    "stability": stability.as_str(),
                    "err_reason": jp.err_reason.lock().unwrap().clone().unwrap_or_else(|| "NA".into()),
                }));
            }
            records.push(json!({
                "repo": bp.repo.clone(),
                "pr_num": bp.pr_num,
                "branch": bp.branch.clone(),
                "base_branch": bp.base_branch.clone(),
                "merged_at": bp.merged_at.clone(),
                "is_error_pass": bp.is_error_pass,
                "failed_build": {"build_id": bp.builds[0].build_id.clone()},
                "passed_build": {"build_id": bp.builds[1].build_id.clone()},
                "match": bp.match_type.load(Ordering::SeqCst),
                "jobpairs": jobpairs,
            }));
        }

        let path = self.ctx.config.result_json_path();
        std::fs::create_dir_all(&self.ctx.config.result_json_dir)?;
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)?;
        info!("Wrote {}.", path.display());
        Ok(())
    }
}

fn job_record(job: &Arc<Job>, history: &MatchHistory) -> Value {
    let results = job.results.lock().unwrap();
    let mut patches = serde_json::Map::new();
    if results.pip_patch {
        patches.insert("pip-yaml-patch".into(), json!("applied"));
    }
    json!({
        "job_id": job.job_id.clone(),
        "match_history": history.clone(),
        "orig_result": results.orig_result.clone(),
        "mismatch_attrs": results.mismatch_attrs.clone(),
        "pip_patch": results.pip_patch,
        "patches": patches,
        "err_reason": results.err_reason.clone(),
    })
}

/// Package one reproduced job pair into a single artifact image, push it,
/// and upsert its metadata record.
pub async fn package_jobpair(ctx: &WorkerContext, jobpair: &Arc<JobPair>) -> Result<()> {
    let config = &ctx.config;
    let jobpair_dir = config.jobpair_dir(&jobpair.buildpair_name, &jobpair.jobpair_name);

    // Stage the per-job artifacts under the names the Dockerfile expects.
    for (job, tar_name) in [
        (jobpair.failed_job(), "failed.tar"),
        (jobpair.passed_job(), "passed.tar"),
    ] {
        let src = jobpair_dir.join(format!("{}.tar", job.job_id));
        if !src.is_file() {
            return Err(ReproduceError::RepoSetup(format!(
                "Cannot find the repository tar file to copy for {}.",
                job.job_id
            )));
        }
        tokio::fs::copy(&src, jobpair_dir.join(tar_name)).await?;

        let orig_log_path = config.orig_log_path(&job.job_id);
        ensure_orig_log(ctx, job, &orig_log_path).await?;
        tokio::fs::copy(
            &orig_log_path,
            jobpair_dir.join(format!("{}-orig.log", job.job_id)),
        )
        .await?;
    }

    // Both jobs must have been built from the same base image.
    let failed_base = dockerfile_base_image(
        &jobpair_dir.join(format!("{}-Dockerfile", jobpair.failed_job().job_id)),
    )?;
    let passed_base = dockerfile_base_image(
        &jobpair_dir.join(format!("{}-Dockerfile", jobpair.passed_job().job_id)),
    )?;

    let dockerfile_path = jobpair_dir.join("Dockerfile");
    write_jobpair_dockerfile(&dockerfile_path, jobpair, &failed_base, &passed_base)?;

    let image_tag = construct_jobpair_image_tag(jobpair);
    let Some(registry) = &config.credentials.docker_registry else {
        warn!("No Docker registry configured; building {image_tag} locally only.");
        let local_name = format!("bugswarm-local:{image_tag}");
        ctx.docker
            .build_image(&jobpair_dir, &dockerfile_path, &local_name)
            .await?;
        jobpair.reproduced.store(true, Ordering::SeqCst);
        return Ok(());
    };

    let full_image_name = format!("{registry}:{image_tag}");
    ctx.docker
        .build_image(&jobpair_dir, &dockerfile_path, &full_image_name)
        .await?;
    ctx.docker.push_image(&full_image_name).await?;

    let record = artifact_record(jobpair, &image_tag);
    ctx.database.upsert_artifact(&image_tag, &record).await?;

    // Drop the staging copies; the image has them now.
    for job in jobpair.jobs.iter() {
        let _ = tokio::fs::remove_file(jobpair_dir.join(format!("{}-orig.log", job.job_id))).await;
    }
    let _ = tokio::fs::remove_file(jobpair_dir.join("failed.tar")).await;
    let _ = tokio::fs::remove_file(jobpair_dir.join("passed.tar")).await;

    jobpair.reproduced.store(true, Ordering::SeqCst);
    info!("Packaged {} as {}.", jobpair.full_name, full_image_name);
    Ok(())
}

fn dockerfile_base_image(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ReproduceError::RepoSetup(format!("missing Dockerfile {}: {e}", path.display()))
    })?;
    content
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("FROM "))
        .map(str::to_string)
        .ok_or_else(|| {
            ReproduceError::Docker(format!("{} has no FROM line", path.display()))
        })
}

/// The artifact metadata record inserted (or patched) into the database.
fn artifact_record(jobpair: &JobPair, image_tag: &str) -> Value {
    let histories = jobpair.histories.lock().unwrap();
    let failed = jobpair.failed_job();
    let passed = jobpair.passed_job();
    let failed_results = failed.results.lock().unwrap();
    let passed_results = passed.results.lock().unwrap();

    let frameworks = failed_results
        .orig_result
        .as_ref()
        .and_then(|r| r.get("tr_log_frameworks").cloned())
        .unwrap_or(json!(""));
    let failing_tests = failed_results
        .orig_result
        .as_ref()
        .and_then(|r| r.get("tr_log_tests_failed").cloned())
        .unwrap_or(json!(""));

    json!({
        "image_tag": image_tag,
        "repo": jobpair.repo.clone(),
        "lang": failed.language.clone(),
        "build_system": failed.build_system.clone(),
        "test_framework": frameworks,
        "failed_job": {
            "job_id": failed.job_id.clone(),
            "trigger_sha": failed.sha.clone(),
            "base_sha": failed.base_sha.clone(),
            "failing_tests": failing_tests,
            "mismatch_attrs": failed_results.mismatch_attrs.clone(),
            "patches": job_patches(failed, &failed_results.pip_patch),
        },
        "passed_job": {
            "job_id": passed.job_id.clone(),
            "trigger_sha": passed.sha.clone(),
            "base_sha": passed.base_sha.clone(),
            "mismatch_attrs": passed_results.mismatch_attrs.clone(),
            "patches": job_patches(passed, &passed_results.pip_patch),
        },
        "match_history": histories.match_history.clone(),
        "reproduce_successes": reproduce_successes(&histories.match_history),
        "reproduce_attempts": reproduce_attempts(&histories.match_history),
        "stability": classify(&histories.match_history, histories.match_history.len().max(1) as u32).as_str(),
        "classification": jobpair.classification.clone(),
        "component_versions": {
            "reproducer": env!("CARGO_PKG_VERSION"),
            "analyzer": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn job_patches(job: &Job, pip_patch: &bool) -> Value {
    let mut patches = serde_json::Map::new();
    patches.insert("remove-ppa".into(), json!("always"));
    if *pip_patch {
        patches.insert("pip-yaml-patch".into(), json!("applied"));
    }
    if job.build_system.as_deref() == Some("maven") {
        patches.insert("mvn-tls".into(), json!("tlsv1.2"));
    }
    json!(patches)
}
