//! Repository provisioning: clone once per repo into `stored_repos/`,
//! snapshot a tar, then materialize each job's workspace at the required
//! commit and tar the result for the container build.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::process::Command;

use crate::config::{Config, TARFILE_NAME};
use crate::error::{ReproduceError, Result};
use crate::github::{construct_github_archive_repo_sha_url, construct_github_repo_url, GitHubClient};
use crate::reproducer::model::Job;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECONDS: u64 = 5;
const POLL_SECONDS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    InProgress,
    Ready,
    Failed,
}

/// Shared clone/workspace state. One worker claims each key; the others
/// poll until it leaves `InProgress`.
#[derive(Default)]
pub struct SetupLocks {
    cloned_repos: Mutex<HashMap<String, SetupStatus>>,
    workspace_locks: Mutex<HashMap<String, SetupStatus>>,
}

enum Claim {
    Claimed,
    Wait,
    AlreadyReady,
    AlreadyFailed,
}

impl SetupLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn claim(map: &Mutex<HashMap<String, SetupStatus>>, key: &str) -> Claim {
        let mut map = map.lock().unwrap();
        match map.get(key) {
            None => {
                map.insert(key.to_string(), SetupStatus::InProgress);
                Claim::Claimed
            }
            Some(SetupStatus::InProgress) => Claim::Wait,
            Some(SetupStatus::Ready) => Claim::AlreadyReady,
            Some(SetupStatus::Failed) => Claim::AlreadyFailed,
        }
    }

    fn finish(map: &Mutex<HashMap<String, SetupStatus>>, key: &str, status: SetupStatus) {
        map.lock().unwrap().insert(key.to_string(), status);
    }

    fn status(map: &Mutex<HashMap<String, SetupStatus>>, key: &str) -> Option<SetupStatus> {
        map.lock().unwrap().get(key).copied()
    }

    pub fn repo_failed(&self, repo: &str) -> bool {
        Self::status(&self.cloned_repos, repo) == Some(SetupStatus::Failed)
    }
}

/// Ensure the job's workspace contains the repository at the required
/// commit and produce the tar the Dockerfile ADDs.
pub async fn setup_repo(
    job: &Job,
    config: &Config,
    github: &GitHubClient,
    locks: &SetupLocks,
) -> Result<()> {
    if locks.repo_failed(&job.repo) {
        return Err(ReproduceError::RepoSetup(
            "Previously encountered an error while cloning a repository. Skipping.".to_string(),
        ));
    }
    if SetupLocks::status(&locks.workspace_locks, &job.job_id) == Some(SetupStatus::Failed) {
        return Err(ReproduceError::RepoSetup(
            "Previously encountered an error while setting up a repository. Skipping.".to_string(),
        ));
    }

    // ---- Clone the repository (one worker per repo) ----

    match SetupLocks::claim(&locks.cloned_repos, &job.repo) {
        Claim::Claimed => {
            let result = clone_project_repo_if_not_exists(job, config).await;
            match result {
                Ok(()) => {
                    SetupLocks::finish(&locks.cloned_repos, &job.repo, SetupStatus::Ready);
                }
                Err(e) => {
                    SetupLocks::finish(&locks.cloned_repos, &job.repo, SetupStatus::Failed);
                    return Err(e);
                }
            }
        }
        Claim::Wait => loop {
            tokio::time::sleep(Duration::from_secs(POLL_SECONDS)).await;
            match SetupLocks::status(&locks.cloned_repos, &job.repo) {
                Some(SetupStatus::InProgress) => continue,
                Some(SetupStatus::Ready) => break,
                _ => {
                    return Err(ReproduceError::RepoSetup(format!(
                        "Another worker failed to clone the repo {}",
                        job.repo
                    )))
                }
            }
        },
        Claim::AlreadyReady => {}
        Claim::AlreadyFailed => {
            return Err(ReproduceError::RepoSetup(format!(
                "Another worker failed to clone the repo {}",
                job.repo
            )))
        }
    }

    // ---- Materialize the workspace (one worker per job) ----

    match SetupLocks::claim(&locks.workspace_locks, &job.job_id) {
        Claim::Claimed => {
            let result = if !job.resettable && job.github_archived {
                download_repo(job, config, github).await
            } else if job.resettable {
                copy_and_reset_repo(job, config).await
            } else {
                Err(ReproduceError::RepoSetup(
                    "Job is neither resettable nor GitHub archived.".to_string(),
                ))
            };
            match result {
                Ok(()) => {
                    SetupLocks::finish(&locks.workspace_locks, &job.job_id, SetupStatus::Ready)
                }
                Err(e) => {
                    SetupLocks::finish(&locks.workspace_locks, &job.job_id, SetupStatus::Failed);
                    return Err(e);
                }
            }
        }
        Claim::Wait => loop {
            tokio::time::sleep(Duration::from_secs(POLL_SECONDS)).await;
            match SetupLocks::status(&locks.workspace_locks, &job.job_id) {
                Some(SetupStatus::InProgress) => continue,
                Some(SetupStatus::Ready) => break,
                _ => {
                    return Err(ReproduceError::RepoSetup(format!(
                        "Another worker failed to set up the repo {}",
                        job.repo
                    )))
                }
            }
        },
        Claim::AlreadyReady => debug!("Job {} is already set up.", job.job_id),
        Claim::AlreadyFailed => {
            return Err(ReproduceError::RepoSetup(format!(
                "Another worker failed to set up the repo {}",
                job.repo
            )))
        }
    }

    Ok(())
}

async fn run_command(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<()> {
    debug!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .map_err(|e| ReproduceError::RepoSetup(format!("failed to spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(ReproduceError::Git(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn git(args: &[&str], cwd: &Path) -> Result<()> {
    run_command("git", args, Some(cwd)).await
}

/// Clone the project once, set a default identity, fetch PR refs, and
/// snapshot the clone into `repo.tar`.
async fn clone_project_repo_if_not_exists(job: &Job, config: &Config) -> Result<()> {
    let storage_dir = config.repo_storage_dir(&job.repo);

    if !storage_dir.join(".git").is_dir() {
        tokio::fs::create_dir_all(&storage_dir).await?;
        let url = construct_github_repo_url(&job.repo);

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECONDS * attempt as u64))
                    .await;
            }
            match run_command(
                "git",
                &["clone", &url, &storage_dir.to_string_lossy()],
                None,
            )
            .await
            {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    info!("Clone attempt {} for {} failed.", attempt + 1, job.repo);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(ReproduceError::RepoClone(format!(
                "Max retries exceeded cloning {}: {e}",
                job.repo
            )));
        }

        git(&["config", "user.name", "BugSwarm"], &storage_dir).await?;
        git(&["config", "user.email", "dev.bugswarm@gmail.com"], &storage_dir).await?;
        // PR merge commits are only reachable through the pull refs.
        git(
            &["fetch", "origin", "refs/pull/*/head:refs/remotes/origin/pr/*"],
            &storage_dir,
        )
        .await?;
    }

    let tar_path = config.repo_storage_tar_path(&job.repo);
    run_command(
        "tar",
        &[
            "-cf",
            &tar_path.to_string_lossy(),
            "-C",
            &config.stored_repos_dir.to_string_lossy(),
            &job.repo,
        ],
        None,
    )
    .await?;
    Ok(())
}

/// Extract the snapshot into the workspace and reset to the job's commit.
async fn copy_and_reset_repo(job: &Job, config: &Config) -> Result<()> {
    info!("Copying and resetting the repository.");
    let sha_dir = config.workspace_sha_dir(&job.job_id, &job.sha);
    let tar_path = config.repo_storage_tar_path(&job.repo);

    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECONDS)).await;
        }
        let _ = tokio::fs::remove_dir_all(config.workspace_job_dir(&job.job_id)).await;
        tokio::fs::create_dir_all(&sha_dir).await?;
        match run_command(
            "tar",
            &[
                "-xf",
                &tar_path.to_string_lossy(),
                "-C",
                &sha_dir.to_string_lossy(),
            ],
            None,
        )
        .await
        {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                info!("Failed to extract the repository: {e}");
                last_error = Some(e);
            }
        }
    }
    if let Some(e) = last_error {
        return Err(ReproduceError::RepoSetup(format!(
            "Max retries exceeded untarring repo {}: {e}",
            job.repo
        )));
    }

    let repo_dir = config.reproducing_repo_dir(&job.job_id, &job.sha, &job.repo);

    if job.is_pr {
        // Prefer the recorded merge SHA; fall back to resetting the base
        // and merging the head.
        let merge_sha = job.travis_merge_sha.as_deref().unwrap_or_default();
        let merged = if !merge_sha.is_empty() {
            info!("Resetting to merge SHA {merge_sha}");
            let fetched = git(&["fetch", "origin", merge_sha], &repo_dir).await;
            match fetched {
                Ok(()) => git(&["reset", "--hard", merge_sha], &repo_dir).await.is_ok(),
                Err(_) => false,
            }
        } else {
            false
        };
        if !merged {
            info!(
                "Cannot reset to merge SHA. Resetting to base {} and merging head {}",
                job.base_sha, job.sha
            );
            git(&["fetch", "origin", &job.sha], &repo_dir).await?;
            git(&["fetch", "origin", &job.base_sha], &repo_dir).await?;
            git(&["reset", "--hard", &job.base_sha], &repo_dir).await?;
            git(&["merge", &job.sha], &repo_dir).await?;
        }
    } else {
        info!("Resetting to head SHA {}", job.sha);
        git(&["fetch", "origin", &job.sha], &repo_dir).await?;
        git(&["reset", "--hard", &job.sha], &repo_dir).await?;
    }

    git(&["submodule", "update", "--init"], &repo_dir).await?;

    tar_repo(job, config).await
}

/// For non-resettable but archived commits: download the zip snapshot and
/// overlay the cached clone's `.git` so tooling that expects a repository
/// still works. Submodules cannot be restored on this path.
async fn download_repo(job: &Job, config: &Config, github: &GitHubClient) -> Result<()> {
    let sha = if job.is_pr {
        job.travis_merge_sha.as_deref().unwrap_or(&job.sha)
    } else {
        &job.sha
    };
    let zip_path = config.repo_zip_path(&job.repo, sha);
    let sha_dir = config.workspace_sha_dir(&job.job_id, &job.sha);
    tokio::fs::create_dir_all(&sha_dir).await?;

    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECONDS)).await;
        }
        if !zip_path.exists() {
            let src = construct_github_archive_repo_sha_url(&job.repo, sha);
            debug!("Downloading the repository archive from {src}.");
            if let Err(e) = github.download_to_file(&src, &zip_path).await {
                info!("Failed to download the repository: {e}");
                let _ = tokio::fs::remove_file(&zip_path).await;
                last_error = Some(e);
                continue;
            }
        }
        match run_command(
            "unzip",
            &[
                "-q",
                "-o",
                &zip_path.to_string_lossy(),
                "-d",
                &sha_dir.to_string_lossy(),
            ],
            None,
        )
        .await
        {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&zip_path).await;
                last_error = Some(e);
            }
        }
    }
    if let Some(e) = last_error {
        return Err(ReproduceError::RepoSetup(format!(
            "Max retries exceeded downloading zip for repo {}: {e}",
            job.repo
        )));
    }

    // GitHub archives unzip to `<name>-<sha>/`; move it to the repo path
    // and graft the cached `.git` on top.
    let repo_name = job.repo.split('/').nth(1).unwrap_or(&job.repo);
    let unzip_dir = sha_dir.join(format!("{repo_name}-{sha}"));
    let repo_dir = config.reproducing_repo_dir(&job.job_id, &job.sha, &job.repo);
    tokio::fs::create_dir_all(repo_dir.parent().unwrap_or(Path::new("."))).await?;
    run_command(
        "cp",
        &[
            "-a",
            &format!("{}/.", unzip_dir.to_string_lossy()),
            &repo_dir.to_string_lossy(),
        ],
        None,
    )
    .await?;
    let cached_git = config.repo_storage_dir(&job.repo).join(".git");
    run_command(
        "cp",
        &[
            "-a",
            &cached_git.to_string_lossy(),
            &repo_dir.to_string_lossy(),
        ],
        None,
    )
    .await?;

    tar_repo(job, config).await
}

/// Archive the final working tree into the reproduce-tmp directory.
pub async fn tar_repo(job: &Job, config: &Config) -> Result<()> {
    let reproduce_tmp = config.reproduce_tmp_dir(&job.job_id, &job.sha);
    tokio::fs::create_dir_all(&reproduce_tmp).await?;
    let tar_path = reproduce_tmp.join(TARFILE_NAME);
    let sha_dir = config.workspace_sha_dir(&job.job_id, &job.sha);
    run_command(
        "tar",
        &[
            "-cf",
            &tar_path.to_string_lossy(),
            "-C",
            &sha_dir.to_string_lossy(),
            &job.repo,
        ],
        None,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_transitions() {
        let locks = SetupLocks::default();
        assert!(matches!(
            SetupLocks::claim(&locks.cloned_repos, "a/b"),
            Claim::Claimed
        ));
        assert!(matches!(
            SetupLocks::claim(&locks.cloned_repos, "a/b"),
            Claim::Wait
        ));
        SetupLocks::finish(&locks.cloned_repos, "a/b", SetupStatus::Ready);
        assert!(matches!(
            SetupLocks::claim(&locks.cloned_repos, "a/b"),
            Claim::AlreadyReady
        ));
        SetupLocks::finish(&locks.cloned_repos, "a/b", SetupStatus::Failed);
        assert!(matches!(
            SetupLocks::claim(&locks.cloned_repos, "a/b"),
            Claim::AlreadyFailed
        ));
        assert!(locks.repo_failed("a/b"));
        assert!(!locks.repo_failed("other/repo"));
    }
}
