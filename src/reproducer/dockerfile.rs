//! Dockerfile generation: one per job for reproduction runs, one per job
//! pair for the packaged artifact image.

use std::path::Path;

use log::{debug, info};

use crate::error::{ReproduceError, Result};
use crate::reproducer::model::{Job, JobPair};

const BUGSWARM_IMAGES: &[(&str, &str)] = &[
    ("ubuntu-22.04", "bugswarm/githubactionsjobrunners:ubuntu-22.04"),
    ("ubuntu-20.04", "bugswarm/githubactionsjobrunners:ubuntu-20.04"),
    ("ubuntu-18.04", "bugswarm/githubactionsjobrunners:ubuntu-18.04"),
];

const DEFAULT_IMAGE_LABEL: &str = "ubuntu-22.04";

/// Map a runner label to the maintained runner image, or `None` for labels
/// there is no image for.
pub fn bugswarm_image_tag(image_label: &str, use_default: bool) -> Option<String> {
    let label = image_label.to_lowercase();
    for (known, image) in BUGSWARM_IMAGES {
        if label == *known {
            return Some(image.to_string());
        }
    }
    if use_default {
        bugswarm_image_tag(DEFAULT_IMAGE_LABEL, false)
    } else {
        None
    }
}

/// Resolve the runner label for a job: a supported `runs-on` entry, else
/// whatever the original log recorded, else the default.
pub fn resolve_runs_on(job: &Job, original_log: Option<&str>) -> String {
    if let Some(label) = job.runs_on() {
        if bugswarm_image_tag(&label, false).is_some() {
            return label;
        }
    }
    if let Some(log_text) = original_log {
        if let Some(label) = image_label_from_log(log_text) {
            if bugswarm_image_tag(&label, false).is_some() {
                return label;
            }
        }
    }
    DEFAULT_IMAGE_LABEL.to_string()
}

/// Pull the runner label out of the original log's environment header;
/// this is how `ubuntu-latest` resolves to a concrete release.
pub fn image_label_from_log(log_text: &str) -> Option<String> {
    for line in log_text.lines().take(100) {
        for marker in ["Runner Image: ", "Virtual Environment: "] {
            if let Some(idx) = line.find(marker) {
                let label = line[idx + marker.len()..].trim();
                if !label.is_empty() {
                    return Some(label.split_whitespace().next().unwrap_or(label).to_string());
                }
            }
        }
    }
    None
}

/// The image the job's container will be built from. A `container:` entry
/// always wins over `runs-on`.
pub fn image_tag_for_job(job: &Job, runs_on: &str) -> String {
    if let Some(container) = job.container() {
        return container;
    }
    bugswarm_image_tag(runs_on, true).unwrap_or_else(|| {
        bugswarm_image_tag(DEFAULT_IMAGE_LABEL, false).unwrap_or_default()
    })
}

/// Write the per-job Dockerfile.
///
/// Jobs running on a plain container image need the reproduction toolchain
/// (sudo, curl, node for action stubs) installed first; the maintained
/// runner images carry it already.
pub fn write_job_dockerfile(
    destination: &Path,
    job: &Job,
    image_tag: &str,
    runs_on: &str,
) -> Result<()> {
    info!("Use Docker image {} for job runner.", image_tag);

    let job_id = &job.job_id;
    let on_bugswarm_runner = job.container().is_none();

    let mut lines = vec![format!("FROM {image_tag}")];

    if !on_bugswarm_runner {
        // The provider mounts /opt/hostedtoolcache into containers; copy it
        // from the matching runner image when one exists.
        if let Some(base_image) = bugswarm_image_tag(runs_on, false) {
            lines.push(format!(
                "COPY --from={base_image} /opt/hostedtoolcache /opt/hostedtoolcache"
            ));
        }
        lines.extend([
            "RUN apt-get update && apt-get -y install sudo curl coreutils python3 vim".to_string(),
            "RUN apt-get install -y python-is-python3 || sudo ln -s /usr/bin/python3 /usr/bin/python"
                .to_string(),
            "RUN curl -fsSL https://deb.nodesource.com/setup_16.x | bash -".to_string(),
            "RUN apt-get install -y nodejs".to_string(),
        ]);
    }

    lines.extend([
        // Remove PPAs and clean APT so stale sources cannot break installs.
        "RUN sudo rm -rf /var/lib/apt/lists/*".to_string(),
        "RUN sudo rm -rf /etc/apt/sources.list.d/*".to_string(),
        "RUN sudo apt-get clean".to_string(),
        // Deprecated TLS versions break dependency downloads on old images.
        "RUN sudo apt-get update && sudo apt-get -y install --only-upgrade openssl libssl-dev vim"
            .to_string(),
        "RUN echo \"TERM=dumb\" >> /etc/environment".to_string(),
        // Hooks can set environment variables through this file.
        "RUN touch /etc/reproducer-environment && chmod 777 /etc/reproducer-environment"
            .to_string(),
        "RUN useradd -ms /bin/bash github".to_string(),
        "RUN echo \"ALL ALL=(ALL:ALL) NOPASSWD: ALL\" >> /etc/sudoers".to_string(),
        "ADD repo-to-docker.tar /home/github/build/".to_string(),
        format!("ADD --chown=github:github run.sh /usr/local/bin/"),
        format!("ADD --chown=github:github actions /home/github/{job_id}/actions"),
        format!("ADD --chown=github:github steps /home/github/{job_id}/steps"),
        format!("ADD --chown=github:github helpers /home/github/{job_id}/helpers"),
        format!("ADD --chown=github:github event.json /home/github/{job_id}/event.json"),
        "RUN chmod 777 /usr/local/bin/run.sh".to_string(),
        format!("RUN chmod -R 777 /home/github/{job_id}"),
        "RUN rm -rf /home/linuxbrew && chown -R github:github /home".to_string(),
        "USER github".to_string(),
        // Needs bash; sh chokes on the redirections in run.sh.
        "ENTRYPOINT [\"/bin/bash\", \"-c\"]".to_string(),
        "CMD [\"/usr/local/bin/run.sh\"]".to_string(),
    ]);

    let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
    std::fs::write(destination, content)?;
    debug!("Wrote Dockerfile to {}", destination.display());
    Ok(())
}

/// Write the job-pair Dockerfile: both tarballs, both scripts, both helper
/// bundles, and both original logs in one image.
///
/// The two jobs must agree on the base image.
pub fn write_jobpair_dockerfile(
    destination: &Path,
    jobpair: &JobPair,
    failed_image_tag: &str,
    passed_image_tag: &str,
) -> Result<()> {
    if failed_image_tag != passed_image_tag {
        return Err(ReproduceError::Docker(format!(
            "DifferentBaseImage: the failed job and the passed job use different base images \
             ({failed_image_tag} vs {passed_image_tag})"
        )));
    }

    let failed_id = &jobpair.failed_job().job_id;
    let passed_id = &jobpair.passed_job().job_id;

    let mut lines = vec![
        format!("FROM {failed_image_tag}"),
        "RUN sudo rm -rf /var/lib/apt/lists/*".to_string(),
        "RUN sudo rm -rf /etc/apt/sources.list.d/*".to_string(),
        "RUN sudo apt-get clean".to_string(),
        "RUN sudo apt-get update && sudo apt-get install --only-upgrade openssl libssl-dev"
            .to_string(),
        "ADD failed.tar /home/github/build/failed/".to_string(),
        "ADD passed.tar /home/github/build/passed/".to_string(),
        format!("ADD {failed_id}-orig.log /home/github/build/"),
        format!("ADD {passed_id}-orig.log /home/github/build/"),
        "RUN chmod 777 -R /home/github/build".to_string(),
        format!("ADD {failed_id}.sh /usr/local/bin/run_failed.sh"),
        format!("ADD {passed_id}.sh /usr/local/bin/run_passed.sh"),
        format!("ADD --chown=github:github {failed_id}-helpers /home/github/{failed_id}/helpers"),
        format!("ADD --chown=github:github {passed_id}-helpers /home/github/{passed_id}/helpers"),
        "RUN chmod +x /usr/local/bin/run_failed.sh".to_string(),
        "RUN chmod +x /usr/local/bin/run_passed.sh".to_string(),
        "USER github".to_string(),
    ];
    lines.push(String::new());

    let content = lines.join("\n");
    std::fs::write(destination, content)?;
    debug!("Wrote jobpair Dockerfile to {}", destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reproducer::model::{JobResults, JobRole, PairHistories};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use std::sync::{Arc, Mutex};

    fn test_job(job_id: &str, config: serde_json::Value) -> Arc<Job> {
        Arc::new(Job {
            job_id: job_id.into(),
            build_job: "1.1".into(),
            language: "java".into(),
            config,
            repo: "owner/project".into(),
            branch: "main".into(),
            base_sha: "base".into(),
            sha: "head".into(),
            travis_merge_sha: None,
            resettable: true,
            github_archived: true,
            is_pr: false,
            role: JobRole::Failed,
            build_id: "100".into(),
            build_system: None,
            buildpair_name: "bp".into(),
            jobpair_name: "jp".into(),
            job_name: "job".into(),
            skip: AtomicBool::new(false),
            reproduced: AtomicBool::new(false),
            matched: AtomicBool::new(false),
            results: Mutex::new(JobResults::default()),
        })
    }

    fn test_pair(failed: Arc<Job>, passed: Arc<Job>) -> JobPair {
        JobPair {
            repo: "owner/project".into(),
            jobs: [failed, passed],
            jobpair_name: "1-2".into(),
            buildpair_name: "bp".into(),
            full_name: "bp/1-2".into(),
            is_filtered: false,
            classification: None,
            match_type: AtomicI32::new(0),
            reproduced: AtomicBool::new(false),
            skip: AtomicBool::new(false),
            histories: Mutex::new(PairHistories::default()),
            err_reason: Mutex::new(None),
        }
    }

    #[test]
    fn test_image_label_mapping() {
        assert_eq!(
            bugswarm_image_tag("ubuntu-20.04", false).as_deref(),
            Some("bugswarm/githubactionsjobrunners:ubuntu-20.04")
        );
        assert_eq!(bugswarm_image_tag("windows-2019", false), None);
        assert_eq!(
            bugswarm_image_tag("windows-2019", true).as_deref(),
            Some("bugswarm/githubactionsjobrunners:ubuntu-22.04")
        );
    }

    #[test]
    fn test_resolve_runs_on_falls_back_to_log() {
        let job = test_job("1", json!({"runs-on": "ubuntu-latest"}));
        let log_text = "Current runner version: '2.290.1'\nRunner Image: ubuntu-18.04\n";
        assert_eq!(resolve_runs_on(&job, Some(log_text)), "ubuntu-18.04");
        assert_eq!(resolve_runs_on(&job, None), "ubuntu-22.04");
    }

    #[test]
    fn test_virtual_environment_marker() {
        assert_eq!(
            image_label_from_log("Virtual Environment: ubuntu-20.04\n"),
            Some("ubuntu-20.04".to_string())
        );
    }

    #[test]
    fn test_container_overrides_runs_on() {
        let job = test_job("1", json!({"runs-on": "ubuntu-20.04", "container": "maven:3-jdk-11"}));
        assert_eq!(image_tag_for_job(&job, "ubuntu-20.04"), "maven:3-jdk-11");
    }

    #[test]
    fn test_job_dockerfile_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("1-Dockerfile");
        let job = test_job("1", json!({"runs-on": "ubuntu-20.04"}));
        write_job_dockerfile(
            &path,
            &job,
            "bugswarm/githubactionsjobrunners:ubuntu-20.04",
            "ubuntu-20.04",
        )
        .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("FROM bugswarm/githubactionsjobrunners:ubuntu-20.04\n"));
        assert!(content.contains("ADD repo-to-docker.tar /home/github/build/"));
        assert!(content.contains("USER github"));
        assert!(content.contains("ENTRYPOINT [\"/bin/bash\", \"-c\"]"));
        assert!(content.contains("CMD [\"/usr/local/bin/run.sh\"]"));
        // Runner image already has the toolchain.
        assert!(!content.contains("deb.nodesource.com"));
    }

    #[test]
    fn test_container_job_installs_toolchain() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("1-Dockerfile");
        let job = test_job("1", json!({"runs-on": "ubuntu-20.04", "container": "maven:3-jdk-11"}));
        write_job_dockerfile(&path, &job, "maven:3-jdk-11", "ubuntu-20.04").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("deb.nodesource.com"));
        assert!(content.contains(
            "COPY --from=bugswarm/githubactionsjobrunners:ubuntu-20.04 /opt/hostedtoolcache"
        ));
    }

    #[test]
    fn test_jobpair_dockerfile_requires_same_base() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pair-Dockerfile");
        let pair = test_pair(test_job("1", json!({})), test_job("2", json!({})));

        let err = write_jobpair_dockerfile(&path, &pair, "image-a", "image-b");
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("DifferentBaseImage"));

        write_jobpair_dockerfile(&path, &pair, "image-a", "image-a").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("ADD failed.tar /home/github/build/failed/"));
        assert!(content.contains("ADD passed.tar /home/github/build/passed/"));
        assert!(content.contains("ADD 1.sh /usr/local/bin/run_failed.sh"));
        assert!(content.contains("ADD 2.sh /usr/local/bin/run_passed.sh"));
        assert!(content.contains("ADD 1-orig.log /home/github/build/"));
    }
}
