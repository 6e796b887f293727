// Source-control client: issues and pull requests from a GitHub-style REST API.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::SourceControlSection;
use crate::error::UpstreamError;
use crate::types::{ActivityKind, ActivityRecord, ActivityState};

use super::{ActivityQuery, ActivitySource, Page, PageRequest};

/// Pause and wait for reset when remaining drops below this threshold.
const RATE_LIMIT_PAUSE_THRESHOLD: u32 = 5;

/// Source-control REST client.
#[derive(Debug)]
pub struct ForgeClient {
    api_base: String,
    token: String,
    client: Client,
    /// Remaining API calls before the rate limit resets.
    rate_remaining: AtomicU32,
    /// Unix timestamp when the rate-limit window resets.
    rate_reset: AtomicU64,
}

impl ForgeClient {
    pub fn new(section: &SourceControlSection, token: String) -> crate::error::Result<Self> {
        Ok(Self {
            api_base: section.api_base.trim_end_matches('/').to_string(),
            token,
            client: super::http_client(Duration::from_secs(section.timeout_secs))?,
            rate_remaining: AtomicU32::new(u32::MAX),
            rate_reset: AtomicU64::new(0),
        })
    }

    async fn api_get<T: serde::de::DeserializeOwned>(&self, path: &str) -> crate::error::Result<T> {
        let url = format!("{}{path}", self.api_base);

        self.wait_for_rate_reset().await;

        debug!(url = %url, "Forge API request");
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&e))?;

        self.update_rate_limit(resp.headers());

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| UpstreamError::Parse(format!("{path}: {e}")).into());
        }

        let retry_after = header_u64(resp.headers(), "retry-after");
        let body = resp.text().await.unwrap_or_default();
        Err(self.classify_failure(status, retry_after, body).into())
    }

    fn classify_failure(&self, status: StatusCode, retry_after: Option<u64>, body: String) -> UpstreamError {
        let exhausted = self.rate_remaining.load(Ordering::Relaxed) == 0;
        match status {
            StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited {
                retry_after_secs: retry_after.or_else(|| self.secs_until_reset()),
            },
            StatusCode::FORBIDDEN if exhausted || retry_after.is_some() => {
                UpstreamError::RateLimited {
                    retry_after_secs: retry_after.or_else(|| self.secs_until_reset()),
                }
            }
            StatusCode::UNAUTHORIZED => UpstreamError::Auth(format!("forge returned {status}")),
            _ => UpstreamError::Api {
                status: status.as_u16(),
                body,
            },
        }
    }

    /// Update rate limit state from response headers.
    fn update_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining") {
            let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
            self.rate_remaining.store(remaining, Ordering::Relaxed);
            if remaining < 10 {
                warn!(remaining, "Forge API rate limit low");
            }
        }
        if let Some(reset) = header_u64(headers, "x-ratelimit-reset") {
            self.rate_reset.store(reset, Ordering::Relaxed);
        }
    }

    fn secs_until_reset(&self) -> Option<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let reset_at = self.rate_reset.load(Ordering::Relaxed);
        (reset_at > now).then(|| reset_at - now + 1)
    }

    /// Sleep until the rate limit window resets if remaining is low.
    async fn wait_for_rate_reset(&self) {
        let remaining = self.rate_remaining.load(Ordering::Relaxed);
        if remaining > RATE_LIMIT_PAUSE_THRESHOLD {
            return;
        }
        if let Some(wait) = self.secs_until_reset() {
            warn!(remaining, wait_secs = wait, "Rate limit low, waiting for reset");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }
    }

    async fn fetch_issues(
        &self,
        query: &ActivityQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<ActivityRecord>> {
        let rows: Vec<serde_json::Value> = self
            .api_get(&format!(
                "/repos/{}/issues?state=all&since={}&sort=updated&direction=desc&per_page={}&page={}",
                query.repository,
                query.since.format("%Y-%m-%dT%H:%M:%SZ"),
                page.size,
                page.page_number()
            ))
            .await?;

        let fetched = rows.len();
        let records = super::decode_rows::<GhIssue>("forge issues", rows)
            .into_iter()
            // The issues endpoint also lists pull requests; those come from /pulls.
            .filter(|i| i.pull_request.is_none())
            .map(|i| i.into_record(&query.repository))
            .collect();
        Ok(Page {
            records,
            fetched,
            last: false,
        })
    }

    async fn fetch_pulls(
        &self,
        query: &ActivityQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<ActivityRecord>> {
        let rows: Vec<serde_json::Value> = self
            .api_get(&format!(
                "/repos/{}/pulls?state=all&sort=updated&direction=desc&per_page={}&page={}",
                query.repository,
                page.size,
                page.page_number()
            ))
            .await?;

        let fetched = rows.len();
        let pulls = super::decode_rows::<GhPullRequest>("forge pulls", rows);
        let total = pulls.len();
        // Sorted by update time, so everything after the first stale entry is stale too.
        let records: Vec<_> = pulls
            .into_iter()
            .take_while(|p| p.updated_at.is_none_or(|t| t >= query.since))
            .map(|p| p.into_record(&query.repository))
            .collect();
        let last = records.len() < total;
        Ok(Page {
            records,
            fetched,
            last,
        })
    }
}

#[async_trait::async_trait]
impl ActivitySource for ForgeClient {
    #[instrument(skip_all, name = "forge_fetch", fields(query = %query, page = page.page_number()))]
    async fn fetch_activities(
        &self,
        query: &ActivityQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<ActivityRecord>> {
        match query.kind {
            ActivityKind::Issue => self.fetch_issues(query, page).await,
            ActivityKind::ChangeRequest => self.fetch_pulls(query, page).await,
        }
    }

    #[instrument(skip(self), name = "forge_org_repos")]
    async fn list_org_repositories(
        &self,
        org: &str,
        limit: u32,
    ) -> crate::error::Result<Vec<String>> {
        let rows: Vec<serde_json::Value> = self
            .api_get(&format!(
                "/orgs/{org}/repos?sort=updated&direction=desc&per_page={}",
                limit.max(1)
            ))
            .await?;
        let repositories: Vec<String> = super::decode_rows::<GhRepository>("forge repos", rows)
            .into_iter()
            .filter_map(|r| r.full_name)
            .filter(|name| name.contains('/'))
            .take(limit as usize)
            .collect();
        debug!(org, count = repositories.len(), "Listed organization repositories");
        Ok(repositories)
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

fn organization_of(repository: &str) -> String {
    repository
        .split_once('/')
        .map_or_else(String::new, |(org, _)| org.to_string())
}

// ── Forge API types ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct GhIssue {
    number: Option<u64>,
    #[serde(default)]
    title: String,
    state: Option<String>,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    user: Option<GhUser>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: String,
    pull_request: Option<serde_json::Value>,
}

impl GhIssue {
    fn into_record(self, repository: &str) -> ActivityRecord {
        let created = self.created_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        ActivityRecord {
            repository: repository.to_string(),
            number: self.number.unwrap_or_default(),
            title: self.title,
            body: self.body,
            state: ActivityState::from_api(self.state.as_deref().unwrap_or_default(), false),
            created,
            updated: self.updated_at.unwrap_or(created),
            author: self.user.map(|u| u.login),
            url: self.html_url,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            organization: organization_of(repository),
            kind: ActivityKind::Issue,
            base_branch: None,
            head_branch: None,
            merged_at: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GhPullRequest {
    number: Option<u64>,
    #[serde(default)]
    title: String,
    state: Option<String>,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    user: Option<GhUser>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    html_url: String,
    base: Option<GhBranch>,
    head: Option<GhBranch>,
}

impl GhPullRequest {
    fn into_record(self, repository: &str) -> ActivityRecord {
        let created = self.created_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        ActivityRecord {
            repository: repository.to_string(),
            number: self.number.unwrap_or_default(),
            title: self.title,
            body: self.body,
            state: ActivityState::from_api(
                self.state.as_deref().unwrap_or_default(),
                self.merged_at.is_some(),
            ),
            created,
            updated: self.updated_at.unwrap_or(created),
            author: self.user.map(|u| u.login),
            url: self.html_url,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            organization: organization_of(repository),
            kind: ActivityKind::ChangeRequest,
            base_branch: self.base.map(|b| b.branch),
            head_branch: self.head.map(|b| b.branch),
            merged_at: self.merged_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GhRepository {
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    #[serde(rename = "ref")]
    branch: String,
}
