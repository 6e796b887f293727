//! Upstream data sources and the pagination driver shared by both of them.

pub mod forge;
pub mod tracker;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::types::{ActivityKind, ActivityRecord, TrackedItemRecord};

pub use forge::ForgeClient;
pub use tracker::TrackerClient;

/// Which slice of a result set to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based index of the first record.
    pub offset: u32,
    pub size: u32,
}

impl PageRequest {
    /// One-based page number for APIs that paginate by page.
    pub fn page_number(&self) -> u32 {
        self.offset / self.size.max(1) + 1
    }
}

/// One page of normalized records.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    /// Rows the upstream returned for this request, before any client-side
    /// filtering. A value below the requested size ends pagination.
    pub fetched: usize,
    /// Set when the source knows no further page can contain matches.
    pub last: bool,
}

impl<T> Page<T> {
    /// A page whose records are exactly what the upstream returned.
    pub fn full(records: Vec<T>) -> Self {
        let fetched = records.len();
        Self {
            records,
            fetched,
            last: false,
        }
    }
}

/// A tracked-item query for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemQuery {
    /// Every item not in a terminal state.
    Open { project: String },
    /// Items in a terminal state updated at or after `since`.
    ClosedSince {
        project: String,
        since: DateTime<Utc>,
    },
}

impl ItemQuery {
    pub fn project(&self) -> &str {
        match self {
            Self::Open { project } | Self::ClosedSince { project, .. } => project,
        }
    }
}

impl std::fmt::Display for ItemQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { project } => write!(f, "{project} (open)"),
            Self::ClosedSince { project, since } => {
                write!(f, "{project} (closed since {})", since.to_rfc3339())
            }
        }
    }
}

/// A source-control query for one repository and record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityQuery {
    /// `org/repo`.
    pub repository: String,
    pub kind: ActivityKind,
    /// Only records updated at or after this instant.
    pub since: DateTime<Utc>,
}

impl std::fmt::Display for ActivityQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.repository, self.kind.as_str())
    }
}

/// Paginated read access to the issue tracker.
#[async_trait::async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch_items(
        &self,
        query: &ItemQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<TrackedItemRecord>>;
}

/// Paginated read access to source control.
#[async_trait::async_trait]
pub trait ActivitySource: Send + Sync {
    async fn fetch_activities(
        &self,
        query: &ActivityQuery,
        page: PageRequest,
    ) -> crate::error::Result<Page<ActivityRecord>>;

    /// Up to `limit` `org/repo` names of an organization, most recently
    /// updated first. Sources without organization listings return none.
    async fn list_org_repositories(
        &self,
        _org: &str,
        _limit: u32,
    ) -> crate::error::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Request pages until a short or final page, sleeping `delay` in between.
///
/// Each page request goes through `retry`; a page that still fails ends the
/// whole fetch with that error.
pub async fn fetch_all<T, F, Fut>(
    label: &str,
    page_size: u32,
    delay: Duration,
    retry: &RetryPolicy,
    mut fetch_page: F,
) -> crate::error::Result<Vec<T>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = crate::error::Result<Page<T>>>,
{
    let size = page_size.max(1);
    let mut offset = 0u32;
    let mut out = Vec::new();

    loop {
        let request = PageRequest { offset, size };
        let page = retry.run(label, || fetch_page(request)).await?;
        let fetched = u32::try_from(page.fetched).unwrap_or(u32::MAX);
        debug!(
            query = label,
            offset,
            fetched,
            kept = page.records.len(),
            "Fetched page"
        );
        out.extend(page.records);

        if page.last || fetched < size {
            break;
        }
        offset = offset.saturating_add(fetched);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(out)
}

/// Decode each row of a page on its own.
///
/// A row that does not fit `T` becomes `T::default()`, which downstream
/// validation rejects as malformed, so one bad row never costs the rest of
/// its page. The returned vector has one entry per input row.
pub(crate) fn decode_rows<T>(label: &str, rows: Vec<serde_json::Value>) -> Vec<T>
where
    T: DeserializeOwned + Default,
{
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            serde_json::from_value(row).unwrap_or_else(|e| {
                warn!(source = label, index, error = %e, "Undecodable upstream record");
                T::default()
            })
        })
        .collect()
}

/// Shared HTTP client settings for both upstream clients.
pub(crate) fn http_client(timeout: Duration) -> crate::error::Result<reqwest::Client> {
    // Err only means a provider is already installed for this process.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| crate::error::UpstreamError::from_reqwest(&e).into())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::{SyncError, UpstreamError};

    fn numbers(request: PageRequest, total: u32) -> Page<u32> {
        let end = (request.offset + request.size).min(total);
        Page::full((request.offset..end).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_short_page() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let all = fetch_all("q", 10, Duration::from_secs(1), &RetryPolicy::no_retry(), |req| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(numbers(req, 25)) }
        })
        .await
        .unwrap();
        assert_eq!(all, (0..25).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Delay only between pages, not after the last one.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exact_multiple_needs_one_empty_page() {
        let calls = AtomicU32::new(0);
        let all = fetch_all("q", 10, Duration::ZERO, &RetryPolicy::no_retry(), |req| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(numbers(req, 20)) }
        })
        .await
        .unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn last_flag_ends_early() {
        let all = fetch_all("q", 2, Duration::ZERO, &RetryPolicy::no_retry(), |_| async {
            Ok(Page {
                records: vec![1],
                fetched: 2,
                last: true,
            })
        })
        .await
        .unwrap();
        assert_eq!(all, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_a_failing_page() {
        let calls = AtomicU32::new(0);
        let all = fetch_all("q", 10, Duration::ZERO, &RetryPolicy::default(), |req| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SyncError::from(UpstreamError::Timeout("slow".into())))
                } else {
                    Ok(numbers(req, 5))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    struct Row {
        #[serde(default)]
        id: u32,
        name: String,
    }

    #[test]
    fn bad_rows_decode_to_default_in_place() {
        let rows = serde_json::json!([
            {"id": 1, "name": "a"},
            {"id": "two", "name": "b"},
            {"id": 3},
            {"id": 4, "name": "d"}
        ]);
        let serde_json::Value::Array(rows) = rows else {
            unreachable!()
        };
        let decoded: Vec<Row> = decode_rows("rows", rows);
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[0].name, "a");
        assert_eq!(decoded[1], Row::default());
        assert_eq!(decoded[2], Row::default());
        assert_eq!(decoded[3].id, 4);
    }

    #[test]
    fn page_numbers() {
        assert_eq!(PageRequest { offset: 0, size: 100 }.page_number(), 1);
        assert_eq!(PageRequest { offset: 200, size: 100 }.page_number(), 3);
    }
}
