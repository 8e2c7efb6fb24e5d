//! Thin façade over the container runtime, driven through the `docker` CLI:
//! build, run (with a wall-clock cap), push, remove.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::{ReproduceError, Result};

/// Outcome of a container run. A timed-out run still carries whatever log
/// output the container produced before being killed.
pub enum ContainerRun {
    Completed { log: String, exit_code: i32 },
    TimedOut { log: String },
}

pub struct DockerClient;

impl DockerClient {
    pub fn new() -> Self {
        Self
    }

    async fn run_docker(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ReproduceError::Docker(format!("failed to spawn docker: {e}")))?;
        Ok(output)
    }

    /// Build an image from a Dockerfile. The build context directory must
    /// already contain every ADDed file.
    pub async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &Path,
        full_image_name: &str,
    ) -> Result<()> {
        let output = self
            .run_docker(&[
                "build",
                "-f",
                &dockerfile.to_string_lossy(),
                "-t",
                full_image_name,
                &context_dir.to_string_lossy(),
            ])
            .await?;
        if !output.status.success() {
            return Err(ReproduceError::Docker(format!(
                "docker build of {} failed: {}",
                full_image_name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Run a container and capture its stdout as the reproduced log.
    ///
    /// On timeout the container is killed, whatever output was collected is
    /// returned, and the caller records the job as attempted-not-reproduced.
    pub async fn run_container(
        &self,
        full_image_name: &str,
        container_name: &str,
        timeout_secs: u64,
    ) -> Result<ContainerRun> {
        debug!("docker run --name {container_name} {full_image_name}");
        let child = Command::new("docker")
            .args(["run", "--name", container_name, full_image_name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReproduceError::Docker(format!("failed to spawn docker run: {e}")))?;

        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let log_text = String::from_utf8_lossy(&output.stdout).into_owned();
                let exit_code = output.status.code().unwrap_or(-1);
                self.remove_container(container_name).await;
                Ok(ContainerRun::Completed {
                    log: log_text,
                    exit_code,
                })
            }
            Ok(Err(e)) => {
                self.remove_container(container_name).await;
                Err(ReproduceError::Docker(format!("docker run failed: {e}")))
            }
            Err(_) => {
                warn!("Container {container_name} exceeded {timeout_secs}s; killing.");
                let _ = self.run_docker(&["kill", container_name]).await;
                // Salvage the partial log before removing the container.
                let log_text = self
                    .run_docker(&["logs", container_name])
                    .await
                    .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
                    .unwrap_or_default();
                self.remove_container(container_name).await;
                Ok(ContainerRun::TimedOut { log: log_text })
            }
        }
    }

    async fn remove_container(&self, container_name: &str) {
        if let Ok(output) = self.run_docker(&["rm", "-f", container_name]).await {
            if !output.status.success() {
                debug!(
                    "docker rm {} failed: {}",
                    container_name,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }
    }

    pub async fn push_image(&self, full_image_name: &str) -> Result<()> {
        info!("Pushing {full_image_name}");
        let output = self.run_docker(&["push", full_image_name]).await?;
        if !output.status.success() {
            return Err(ReproduceError::Docker(format!(
                "docker push of {} failed: {}",
                full_image_name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        let output = self.run_docker(&["rmi", "-f", image]).await?;
        if !output.status.success() {
            debug!(
                "docker rmi {} failed: {}",
                image,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Remove dangling images to reclaim disk between runs.
    pub async fn prune_images(&self) -> Result<()> {
        info!("Pruning inactive Docker images.");
        let output = self.run_docker(&["image", "prune", "-af"]).await?;
        if !output.status.success() {
            warn!(
                "docker image prune failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}
