//! Thin façade over the GitHub REST API: `get(url) -> (status, json)` with
//! token rotation. Everything else about GitHub (pair mining, caching) lives
//! outside this crate.

use log::warn;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{ReproduceError, Result};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECONDS: u64 = 5;

pub struct GitHubClient {
    client: Client,
    tokens: Vec<String>,
}

impl GitHubClient {
    pub fn new(tokens: &[String]) -> Self {
        let client = Client::builder()
            .user_agent("BugSwarm/0.3.0")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            tokens: tokens.to_vec(),
        }
    }

    /// GET a URL, rotating through the configured tokens when one is rate
    /// limited. Returns the final status and parsed body; an unparsable body
    /// yields `Value::Null` rather than an error so callers can decide on
    /// the status alone.
    pub async fn get(&self, url: &str) -> Result<(StatusCode, Value)> {
        let url = Url::parse(url)
            .map_err(|e| ReproduceError::Api(format!("Invalid URL {url}: {e}")))?;
        let mut retry_count = 0;
        let mut token_index = 0;

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(token) = self.tokens.get(token_index) {
                request = request.header("Authorization", format!("token {token}"));
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({}), retrying in {}s ({}/{})...",
                        e,
                        RETRY_DELAY_SECONDS,
                        retry_count + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECONDS)).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            // 403 with more tokens left usually means rate limiting; rotate.
            if status == StatusCode::FORBIDDEN && token_index + 1 < self.tokens.len() {
                warn!("GitHub API rate limited; rotating to next token.");
                token_index += 1;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(ReproduceError::Api(format!(
                        "GitHub API returned {status} after {MAX_RETRIES} retries for {url}"
                    )));
                }
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECONDS)).await;
                retry_count += 1;
                continue;
            }

            let json = response.json::<Value>().await.unwrap_or(Value::Null);
            return Ok((status, json));
        }
    }

    /// Download a file as raw text (workflow YAMLs, archives metadata).
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let mut request = self.client.get(url);
        if let Some(token) = self.tokens.first() {
            request = request.header("Authorization", format!("token {token}"));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ReproduceError::Api(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    /// Download a binary payload (repository zip archives) to a file.
    pub async fn download_to_file(&self, url: &str, dest: &std::path::Path) -> Result<()> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ReproduceError::Api(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

/// The URL to clone a repository from its slug.
pub fn construct_github_repo_url(repo: &str) -> String {
    format!("https://github.com/{repo}.git")
}

/// The URL of the zip archive of a repository at a specific commit.
pub fn construct_github_archive_repo_sha_url(repo: &str, sha: &str) -> String {
    format!("https://github.com/{repo}/archive/{sha}.zip")
}
