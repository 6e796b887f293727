// Integration test fixtures for Trellis: in-memory upstream sources,
// a store with injectable write failures, record builders and a zero-delay
// configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};

use trellis_core::config::{CompiledPatterns, TrellisConfig};
use trellis_core::error::{Result, StoreError, SyncError, UpstreamError};
use trellis_core::source::{
    ActivityQuery, ActivitySource, IssueSource, ItemQuery, Page, PageRequest,
};
use trellis_core::store::{GraphStore, SqliteStore};
use trellis_core::sync::{SyncEngine, SyncOptions};
use trellis_core::types::{
    ActivityKind, ActivityRecord, ActivityState, Edge, EdgeKind, ItemKind, ItemState, Node,
    NodeFilter, NodeId, NodeKind, StoreStats, SyncReport, TrackedItemRecord,
};

// ── Record builders ────────────────────────────────────────────────

/// A fixed instant so fixtures are reproducible.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// An open tracked item; the project is the key prefix.
pub fn open_item(key: &str, kind: ItemKind, summary: &str) -> TrackedItemRecord {
    let project = key.rsplit_once('-').map_or("", |(p, _)| p).to_string();
    TrackedItemRecord {
        key: key.to_string(),
        summary: summary.to_string(),
        description: None,
        status: "In Progress".to_string(),
        state: ItemState::Open,
        priority: Some("Major".to_string()),
        kind,
        project,
        created: t0() - Duration::days(30),
        updated: Utc::now(),
        assignee: None,
        reporter: None,
        labels: Vec::new(),
        components: Vec::new(),
    }
}

/// A tracked item closed a day ago.
pub fn closed_item(key: &str, kind: ItemKind, summary: &str) -> TrackedItemRecord {
    TrackedItemRecord {
        status: "Done".to_string(),
        state: ItemState::Closed,
        updated: Utc::now() - Duration::days(1),
        ..open_item(key, kind, summary)
    }
}

/// A source-control record updated just now.
pub fn activity(repository: &str, number: u64, kind: ActivityKind, title: &str) -> ActivityRecord {
    let organization = repository
        .split_once('/')
        .map_or("", |(org, _)| org)
        .to_string();
    let segment = match kind {
        ActivityKind::Issue => "issues",
        ActivityKind::ChangeRequest => "pull",
    };
    ActivityRecord {
        repository: repository.to_string(),
        number,
        title: title.to_string(),
        body: None,
        state: ActivityState::Open,
        created: t0(),
        updated: Utc::now(),
        author: Some("octocat".to_string()),
        url: format!("https://github.com/{repository}/{segment}/{number}"),
        labels: Vec::new(),
        organization,
        kind,
        base_branch: None,
        head_branch: None,
        merged_at: None,
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Config for `projects` and `repositories` (all in category `core`), with
/// every delay set to zero so tests never sleep for real.
pub fn test_config(projects: &[&str], repositories: &[&str]) -> TrellisConfig {
    let mut config = TrellisConfig::default();
    config.tracker.base_url = "http://tracker.invalid".to_string();
    config.tracker.projects = projects.iter().map(ToString::to_string).collect();
    config.tracker.page_size = 2;
    config.tracker.page_delay_ms = 0;
    if !repositories.is_empty() {
        config.source_control.repositories.insert(
            "core".to_string(),
            repositories.iter().map(ToString::to_string).collect(),
        );
    }
    config.source_control.page_size = 2;
    config.source_control.rate_limit_delay_ms = 0;
    config.retry.initial_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.sync.fetch_concurrency = 2;
    config
}

// ── Fake issue tracker ─────────────────────────────────────────────

/// In-memory issue tracker.
///
/// Open queries return every open record of the project; closed queries
/// return closed records updated at or after the query's `since`. Results are
/// paginated the same way the real client is.
#[derive(Debug, Default)]
pub struct FakeIssueSource {
    records: Mutex<Vec<TrackedItemRecord>>,
    /// The next N calls fail with a transient network error.
    transient_failures: AtomicU32,
    /// Every call fails with rejected credentials.
    reject_auth: AtomicBool,
    calls: AtomicU32,
}

impl FakeIssueSource {
    pub fn new(records: Vec<TrackedItemRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn set_records(&self, records: Vec<TrackedItemRecord>) {
        *self.records.lock().expect("fixture mutex poisoned") = records;
    }

    pub fn fail_transiently(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn matches(record: &TrackedItemRecord, query: &ItemQuery) -> bool {
        let in_project = record.project == query.project()
            || record.key.starts_with(&format!("{}-", query.project()));
        match query {
            ItemQuery::Open { .. } => in_project && record.state != ItemState::Closed,
            ItemQuery::ClosedSince { since, .. } => {
                in_project && record.state == ItemState::Closed && record.updated >= *since
            }
        }
    }
}

#[async_trait::async_trait]
impl IssueSource for FakeIssueSource {
    async fn fetch_items(
        &self,
        query: &ItemQuery,
        page: PageRequest,
    ) -> Result<Page<TrackedItemRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(UpstreamError::Auth("HTTP 401".into()).into());
        }
        if take_failure(&self.transient_failures) {
            return Err(UpstreamError::Network("connection reset".into()).into());
        }

        let records = self.records.lock().expect("fixture mutex poisoned");
        let matching: Vec<TrackedItemRecord> = records
            .iter()
            .filter(|r| Self::matches(r, query))
            .cloned()
            .collect();
        Ok(paginate(matching, page))
    }
}

// ── Fake source control ────────────────────────────────────────────

/// In-memory source-control host.
#[derive(Debug, Default)]
pub struct FakeActivitySource {
    records: Mutex<Vec<ActivityRecord>>,
    transient_failures: AtomicU32,
    /// Repositories whose queries fail with a permanent 404.
    missing_repositories: Mutex<HashSet<String>>,
    /// `since` of every query seen, in call order.
    seen_since: Mutex<Vec<DateTime<Utc>>>,
    /// Organization → its repositories, most recently updated first.
    organizations: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeActivitySource {
    pub fn new(records: Vec<ActivityRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn set_records(&self, records: Vec<ActivityRecord>) {
        *self.records.lock().expect("fixture mutex poisoned") = records;
    }

    pub fn fail_transiently(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn remove_repository(&self, repository: &str) {
        self.missing_repositories
            .lock()
            .expect("fixture mutex poisoned")
            .insert(repository.to_string());
    }

    pub fn restore_repositories(&self) {
        self.missing_repositories
            .lock()
            .expect("fixture mutex poisoned")
            .clear();
    }

    pub fn add_organization(&self, org: &str, repositories: &[&str]) {
        self.organizations
            .lock()
            .expect("fixture mutex poisoned")
            .insert(
                org.to_string(),
                repositories.iter().map(ToString::to_string).collect(),
            );
    }

    pub fn seen_since(&self) -> Vec<DateTime<Utc>> {
        self.seen_since
            .lock()
            .expect("fixture mutex poisoned")
            .clone()
    }
}

#[async_trait::async_trait]
impl ActivitySource for FakeActivitySource {
    async fn fetch_activities(
        &self,
        query: &ActivityQuery,
        page: PageRequest,
    ) -> Result<Page<ActivityRecord>> {
        self.seen_since
            .lock()
            .expect("fixture mutex poisoned")
            .push(query.since);
        if take_failure(&self.transient_failures) {
            return Err(UpstreamError::Timeout("30s".into()).into());
        }
        if self
            .missing_repositories
            .lock()
            .expect("fixture mutex poisoned")
            .contains(&query.repository)
        {
            return Err(SyncError::from(UpstreamError::Api {
                status: 404,
                body: "Not Found".into(),
            }));
        }

        let records = self.records.lock().expect("fixture mutex poisoned");
        let matching: Vec<ActivityRecord> = records
            .iter()
            .filter(|r| {
                r.repository == query.repository && r.kind == query.kind && r.updated >= query.since
            })
            .cloned()
            .collect();
        Ok(paginate(matching, page))
    }

    async fn list_org_repositories(&self, org: &str, limit: u32) -> Result<Vec<String>> {
        let organizations = self.organizations.lock().expect("fixture mutex poisoned");
        let Some(repositories) = organizations.get(org) else {
            return Err(SyncError::from(UpstreamError::Api {
                status: 404,
                body: "Not Found".into(),
            }));
        };
        Ok(repositories.iter().take(limit as usize).cloned().collect())
    }
}

// ── Failing store ──────────────────────────────────────────────────

/// How often a targeted store write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failures {
    /// The first N attempts fail, later ones reach the store.
    Times(u32),
    /// Every attempt fails.
    Always,
}

#[derive(Debug)]
struct Plan {
    failures: Failures,
    attempts: u32,
}

impl Plan {
    /// Count one attempt; `true` when it must fail.
    fn attempt(&mut self) -> bool {
        self.attempts += 1;
        match self.failures {
            Failures::Times(n) => self.attempts <= n,
            Failures::Always => true,
        }
    }
}

/// A [`SqliteStore`] whose writes to chosen nodes or edge kinds fail with a
/// transient `SQLite` error.
#[derive(Debug)]
pub struct FlakyStore {
    inner: SqliteStore,
    /// Keyed by node name.
    nodes: Mutex<HashMap<String, Plan>>,
    edges: Mutex<HashMap<EdgeKind, Plan>>,
}

impl FlakyStore {
    pub fn in_memory() -> Self {
        Self {
            inner: SqliteStore::in_memory().expect("in-memory store"),
            nodes: Mutex::default(),
            edges: Mutex::default(),
        }
    }

    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    /// Fail `upsert_node` for the node named `name`.
    pub fn fail_node(&self, name: &str, failures: Failures) {
        self.nodes
            .lock()
            .expect("fixture mutex poisoned")
            .insert(name.to_string(), Plan { failures, attempts: 0 });
    }

    /// Fail `ensure_edge` for every edge of `kind`.
    pub fn fail_edges(&self, kind: EdgeKind, failures: Failures) {
        self.edges
            .lock()
            .expect("fixture mutex poisoned")
            .insert(kind, Plan { failures, attempts: 0 });
    }

    /// `upsert_node` calls seen for `name`.
    pub fn node_attempts(&self, name: &str) -> u32 {
        self.nodes
            .lock()
            .expect("fixture mutex poisoned")
            .get(name)
            .map_or(0, |p| p.attempts)
    }

    /// `ensure_edge` calls seen for `kind`.
    pub fn edge_attempts(&self, kind: EdgeKind) -> u32 {
        self.edges
            .lock()
            .expect("fixture mutex poisoned")
            .get(&kind)
            .map_or(0, |p| p.attempts)
    }

    fn busy() -> SyncError {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        StoreError::from(busy).into()
    }
}

#[async_trait::async_trait]
impl GraphStore for FlakyStore {
    async fn upsert_node(&self, node: &Node) -> Result<NodeId> {
        let fail = self
            .nodes
            .lock()
            .expect("fixture mutex poisoned")
            .get_mut(&node.name)
            .is_some_and(Plan::attempt);
        if fail {
            return Err(Self::busy());
        }
        self.inner.upsert_node(node).await
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        self.inner.get_node(id).await
    }

    async fn get_node_by_name(&self, kind: NodeKind, name: &str) -> Result<Option<Node>> {
        self.inner.get_node_by_name(kind, name).await
    }

    async fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        self.inner.find_nodes(filter).await
    }

    async fn ensure_edge(&self, kind: EdgeKind, source: NodeId, target: NodeId) -> Result<bool> {
        let fail = self
            .edges
            .lock()
            .expect("fixture mutex poisoned")
            .get_mut(&kind)
            .is_some_and(Plan::attempt);
        if fail {
            return Err(Self::busy());
        }
        self.inner.ensure_edge(kind, source, target).await
    }

    async fn edges_from(&self, source: NodeId, kind: Option<EdgeKind>) -> Result<Vec<Edge>> {
        self.inner.edges_from(source, kind).await
    }

    async fn edges_to(&self, target: NodeId, kind: Option<EdgeKind>) -> Result<Vec<Edge>> {
        self.inner.edges_to(target, kind).await
    }

    async fn get_checkpoint(&self, kind: &str) -> Result<Option<String>> {
        self.inner.get_checkpoint(kind).await
    }

    async fn set_checkpoint(&self, kind: &str, value: &str) -> Result<()> {
        self.inner.set_checkpoint(kind, value).await
    }

    async fn clear_checkpoint(&self, kind: &str) -> Result<()> {
        self.inner.clear_checkpoint(kind).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn paginate<T>(records: Vec<T>, page: PageRequest) -> Page<T> {
    let start = (page.offset as usize).min(records.len());
    let end = (start + page.size as usize).min(records.len());
    Page::full(records.into_iter().skip(start).take(end - start).collect())
}

// ── Pass helpers ───────────────────────────────────────────────────

/// Everything one end-to-end scenario needs.
#[derive(Debug)]
pub struct Harness {
    pub store: SqliteStore,
    pub config: TrellisConfig,
    pub patterns: CompiledPatterns,
    pub issues: FakeIssueSource,
    pub activities: FakeActivitySource,
}

impl Harness {
    pub fn new(
        config: TrellisConfig,
        items: Vec<TrackedItemRecord>,
        activities: Vec<ActivityRecord>,
    ) -> Self {
        let patterns = config.compile_patterns().expect("valid patterns");
        Self {
            store: SqliteStore::in_memory().expect("in-memory store"),
            config,
            patterns,
            issues: FakeIssueSource::new(items),
            activities: FakeActivitySource::new(activities),
        }
    }

    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync_with(SyncOptions::default()).await
    }

    pub async fn sync_with(&self, options: SyncOptions) -> Result<SyncReport> {
        self.sync_on(&self.store, options).await
    }

    /// Run a pass with this harness's sources against another store.
    pub async fn sync_on(&self, store: &dyn GraphStore, options: SyncOptions) -> Result<SyncReport> {
        SyncEngine::new(store, &self.config, &self.patterns)
            .with_issue_source(&self.issues)
            .with_activity_source(&self.activities)
            .run(options)
            .await
    }
}
