//! Thin façade over the metadata database REST API. Artifact records are
//! keyed by image tag; insert a new record or patch an existing one.

use log::{info, warn};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::{ReproduceError, Result};

pub struct DatabaseClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl DatabaseClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = Client::builder()
            .user_agent("BugSwarm/0.3.0")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("token {token}")),
            None => request,
        }
    }

    pub async fn find_artifact(&self, image_tag: &str) -> Result<Option<Value>> {
        let url = format!("{}/artifacts/{}", self.base_url, image_tag);
        let response = self.authed(self.client.get(&url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ReproduceError::Api(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await?))
    }

    /// Insert the artifact record, or patch it if one already exists for the
    /// image tag.
    pub async fn upsert_artifact(&self, image_tag: &str, record: &Value) -> Result<()> {
        if self.token.is_none() {
            warn!("No database token configured; skipping artifact upsert.");
            return Ok(());
        }

        if self.find_artifact(image_tag).await?.is_some() {
            let url = format!("{}/artifacts/{}", self.base_url, image_tag);
            let response = self.authed(self.client.patch(&url).json(record)).send().await?;
            if !response.status().is_success() {
                return Err(ReproduceError::Api(format!(
                    "PATCH {url} returned {}",
                    response.status()
                )));
            }
            info!("Patched existing artifact record for {image_tag}.");
        } else {
            let url = format!("{}/artifacts", self.base_url);
            let response = self.authed(self.client.post(&url).json(record)).send().await?;
            if !response.status().is_success() {
                return Err(ReproduceError::Api(format!(
                    "POST {url} returned {}",
                    response.status()
                )));
            }
            info!("Inserted artifact record for {image_tag}.");
        }
        Ok(())
    }

    /// Look up the build system recorded for a previously mined job.
    pub async fn build_system_for_job(&self, job_id: &str) -> Option<String> {
        let Ok(job_id_num) = job_id.parse::<i64>() else {
            return None;
        };
        let filter = format!(
            r#"{{"$or": [{{"passed_job.job_id": {job_id_num}}}, {{"failed_job.job_id": {job_id_num}}}]}}"#
        );
        let url = format!("{}/artifacts?where={}", self.base_url, filter);
        let response = self.authed(self.client.get(&url)).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let build_system = body
            .get("_items")?
            .as_array()?
            .first()?
            .get("build_system")?
            .as_str()?;
        if build_system == "NA" {
            Some("NA".to_string())
        } else {
            Some(build_system.to_lowercase())
        }
    }
}
