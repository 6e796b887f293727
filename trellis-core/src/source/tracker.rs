// Issue-tracker client: JQL search over a Jira-style REST API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::TrackerSection;
use crate::error::UpstreamError;
use crate::types::{ItemKind, ItemState, TrackedItemRecord};

use super::{IssueSource, ItemQuery, Page, PageRequest};

const SEARCH_FIELDS: &str = "summary,description,status,priority,issuetype,project,created,updated,assignee,reporter,labels,components";

/// Tracker REST client.
#[derive(Debug)]
pub struct TrackerClient {
    base_url: String,
    username: Option<String>,
    token: String,
    client: Client,
}

impl TrackerClient {
    pub fn new(
        section: &TrackerSection,
        username: Option<String>,
        token: String,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            base_url: section.base_url.trim_end_matches('/').to_string(),
            username,
            token,
            client: super::http_client(Duration::from_secs(section.timeout_secs))?,
        })
    }

    async fn search(&self, jql: &str, page: PageRequest) -> crate::error::Result<SearchResponse> {
        let url = format!("{}/rest/api/2/search", self.base_url);
        let start_at = page.offset.to_string();
        let max_results = page.size.to_string();

        let mut req = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("jql", jql),
                ("startAt", start_at.as_str()),
                ("maxResults", max_results.as_str()),
                ("fields", SEARCH_FIELDS),
            ]);
        req = match &self.username {
            Some(user) => req.basic_auth(user, Some(&self.token)),
            None => req.bearer_auth(&self.token),
        };

        debug!(jql, start_at = page.offset, "Tracker search request");

        let resp = req.send().await.map_err(|e| UpstreamError::from_reqwest(&e))?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| UpstreamError::Parse(format!("tracker search: {e}")).into());
        }

        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                UpstreamError::Auth(format!("tracker returned {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited {
                retry_after_secs: retry_after,
            },
            _ => UpstreamError::Api {
                status: status.as_u16(),
                body,
            },
        }
        .into())
    }
}

#[async_trait::async_trait]
impl IssueSource for TrackerClient {
    #[instrument(skip_all, name = "tracker_fetch", fields(query = %query, offset = page.offset))]
    async fn fetch_items(
        &self,
        query: &ItemQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<TrackedItemRecord>> {
        let response = self.search(&build_jql(query), page).await?;
        let records = super::decode_rows::<Issue>("tracker", response.issues)
            .into_iter()
            .map(normalize_issue)
            .collect();
        Ok(Page::full(records))
    }
}

/// Quote a value as a JQL string literal.
fn jql_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

pub(crate) fn build_jql(query: &ItemQuery) -> String {
    match query {
        ItemQuery::Open { project } => format!(
            "project = {} AND statusCategory != Done ORDER BY updated DESC",
            jql_string(project)
        ),
        ItemQuery::ClosedSince { project, since } => format!(
            "project = {} AND statusCategory = Done AND updated >= {} ORDER BY updated DESC",
            jql_string(project),
            jql_string(&since.format("%Y-%m-%d %H:%M").to_string())
        ),
    }
}

/// Parse tracker timestamps such as `2024-03-01T10:15:30.000+0000`.
pub(crate) fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| {
        DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
            .or_else(|_| DateTime::parse_from_rfc3339(s))
            .ok()
    })
    .map_or(DateTime::<Utc>::UNIX_EPOCH, |dt| dt.with_timezone(&Utc))
}

fn normalize_issue(issue: Issue) -> TrackedItemRecord {
    let f = issue.fields;
    let state = f
        .status
        .as_ref()
        .and_then(|s| s.status_category.as_ref())
        .map_or(ItemState::Other, |c| ItemState::from_status_category(&c.key));

    TrackedItemRecord {
        key: issue.key.unwrap_or_default(),
        summary: f.summary.unwrap_or_default(),
        description: f.description,
        status: f.status.and_then(|s| s.name).unwrap_or_default(),
        state,
        priority: f.priority.map(|p| p.name),
        kind: f
            .issuetype
            .map_or_else(|| ItemKind::Other(String::new()), |t| ItemKind::parse(&t.name)),
        project: f.project.map(|p| p.key).unwrap_or_default(),
        created: parse_timestamp(f.created.as_deref()),
        updated: parse_timestamp(f.updated.as_deref()),
        assignee: f.assignee.and_then(Person::into_name),
        reporter: f.reporter.and_then(Person::into_name),
        labels: f.labels,
        components: f.components.into_iter().map(|c| c.name).collect(),
    }
}

// ── Tracker API types ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    /// Decoded row by row, see [`super::decode_rows`].
    #[serde(default)]
    issues: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Issue {
    key: Option<String>,
    #[serde(default)]
    fields: Fields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fields {
    summary: Option<String>,
    description: Option<String>,
    status: Option<Status>,
    priority: Option<Named>,
    issuetype: Option<Named>,
    project: Option<ProjectRef>,
    created: Option<String>,
    updated: Option<String>,
    assignee: Option<Person>,
    reporter: Option<Person>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    components: Vec<Named>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    name: Option<String>,
    status_category: Option<StatusCategory>,
}

#[derive(Debug, Deserialize)]
struct StatusCategory {
    key: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    display_name: Option<String>,
    name: Option<String>,
}

impl Person {
    fn into_name(self) -> Option<String> {
        self.display_name.or(self.name)
    }
}
