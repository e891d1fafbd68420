//! Build service client — starts builds, polls them, and publishes results.

use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::{BuildConfig, JobflowError, Result};
use serde::Deserialize;
use serde_json::json;

/// Result of starting a build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildHandle {
    pub build_id: String,
    pub message: String,
}

/// Where a build currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildStatus {
    InProgress,
    /// A release version is present when the build already landed in a milestone.
    Succeeded { release_version: Option<String> },
    Failed(String),
}

/// External build service.
#[async_trait]
pub trait BuildApi: Send + Sync {
    async fn initiate_build(
        &self,
        product: &str,
        is_patch_build: bool,
        branch: Option<&str>,
    ) -> Result<BuildHandle>;

    async fn build_status(&self, build_id: &str) -> Result<BuildStatus>;

    /// Move the build into a milestone and return the milestone version.
    async fn create_milestone(&self, build_id: &str, product: &str) -> Result<String>;

    /// Map the milestone onto the product's release channel and return its URL.
    async fn map_channel(&self, build_id: &str, milestone_version: &str, product: &str) -> Result<String>;
}

/// JSON-over-HTTP [`BuildApi`].
pub struct HttpBuildApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    build_id: serde_json::Value,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    release_version: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MilestoneResponse {
    milestone_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    channel_url: String,
}

impl HttpBuildApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(JobflowError::Config("build api_url is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobflowError::Http(format!("client setup failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        Self::new(
            &config.api_url,
            config.api_token.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| JobflowError::Http(format!("{what} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(JobflowError::Http(format!("{what} returned {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| JobflowError::Http(format!("{what} response unreadable: {e}")))
    }
}

#[async_trait]
impl BuildApi for HttpBuildApi {
    async fn initiate_build(
        &self,
        product: &str,
        is_patch_build: bool,
        branch: Option<&str>,
    ) -> Result<BuildHandle> {
        let req = self.client.post(self.url("/builds")).json(&json!({
            "product": product,
            "isPatchBuild": is_patch_build,
            "branchName": branch,
        }));
        let resp: InitiateResponse = self.send(req, "initiate build").await?;
        let build_id = match resp.build_id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(JobflowError::Http(format!(
                    "build service returned no build id ({other}): {}",
                    resp.message
                )));
            }
        };
        tracing::info!("🏗️ Build {} started for {}", build_id, product);
        Ok(BuildHandle {
            build_id,
            message: resp.message,
        })
    }

    async fn build_status(&self, build_id: &str) -> Result<BuildStatus> {
        let req = self.client.get(self.url(&format!("/builds/{build_id}")));
        let resp: StatusResponse = self.send(req, "build status").await?;
        Ok(parse_status(resp))
    }

    async fn create_milestone(&self, build_id: &str, product: &str) -> Result<String> {
        let req = self
            .client
            .post(self.url(&format!("/builds/{build_id}/milestone")))
            .json(&json!({ "product": product }));
        let resp: MilestoneResponse = self.send(req, "create milestone").await?;
        Ok(resp.milestone_version)
    }

    async fn map_channel(&self, build_id: &str, milestone_version: &str, product: &str) -> Result<String> {
        let req = self
            .client
            .post(self.url(&format!("/builds/{build_id}/channel")))
            .json(&json!({
                "product": product,
                "milestoneVersion": milestone_version,
            }));
        let resp: ChannelResponse = self.send(req, "map channel").await?;
        Ok(resp.channel_url)
    }
}

fn parse_status(resp: StatusResponse) -> BuildStatus {
    match resp.status.as_str() {
        "BUILD_SUCCESS" => BuildStatus::Succeeded {
            release_version: resp.release_version.filter(|v| !v.is_empty()),
        },
        "BUILD_FAILED" => BuildStatus::Failed(
            resp.error_message
                .unwrap_or_else(|| "Build failed".to_string()),
        ),
        _ => BuildStatus::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(raw: &str) -> BuildStatus {
        parse_status(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(status(r#"{"status":"RUNNING"}"#), BuildStatus::InProgress);
        assert_eq!(
            status(r#"{"status":"BUILD_SUCCESS","releaseVersion":"9.1.0"}"#),
            BuildStatus::Succeeded {
                release_version: Some("9.1.0".into())
            }
        );
        assert_eq!(
            status(r#"{"status":"BUILD_SUCCESS","releaseVersion":""}"#),
            BuildStatus::Succeeded { release_version: None }
        );
        assert_eq!(
            status(r#"{"status":"BUILD_FAILED"}"#),
            BuildStatus::Failed("Build failed".into())
        );
        assert_eq!(
            status(r#"{"status":"BUILD_FAILED","errorMessage":"compile error"}"#),
            BuildStatus::Failed("compile error".into())
        );
    }

    #[test]
    fn test_client_requires_url() {
        assert!(HttpBuildApi::new("  ", None, Duration::from_secs(5)).is_err());
        let api = HttpBuildApi::new("https://builds.example.com/api/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(api.url("/builds/7"), "https://builds.example.com/api/builds/7");
    }
}
