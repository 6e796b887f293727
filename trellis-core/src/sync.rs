// Sync orchestrator: Fetch → Filter → Upsert → Resolve → Derive, one pass at a time.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use tracing::{info, instrument, warn};

use crate::config::{CompiledPatterns, SourceControlSection, TrellisConfig};
use crate::error::{SyncError, UpstreamError};
use crate::hierarchy::{HierarchyItem, derive_links};
use crate::progress::{NoopReporter, ProgressReporter, SyncStage};
use crate::resolve::Resolver;
use crate::retention::retain_closed;
use crate::retry::RetryPolicy;
use crate::source::{
    ActivityQuery, ActivitySource, IssueSource, ItemQuery, PageRequest, fetch_all,
};
use crate::store::GraphStore;
use crate::types::{
    ActivityKind, ActivityRecord, EdgeKind, NodeFilter, NodeId, NodeKind, SyncReport,
    TrackedItemRecord,
};
use crate::upsert::EntityWriter;

/// Checkpoint holding the RFC 3339 start time of the last complete activity fetch.
pub const WATERMARK_CHECKPOINT: &str = "activity_watermark";
/// Checkpoint holding the JSON `SyncReport` of the last pass.
pub const REPORT_CHECKPOINT: &str = "last_sync_report";

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Ignore the stored watermark and use the configured default window.
    pub full: bool,
}

static NOOP: NoopReporter = NoopReporter;

/// Runs sync passes against one store.
pub struct SyncEngine<'a> {
    store: &'a dyn GraphStore,
    config: &'a TrellisConfig,
    patterns: &'a CompiledPatterns,
    issues: Option<&'a dyn IssueSource>,
    activities: Option<&'a dyn ActivitySource>,
    retry: RetryPolicy,
    progress: &'a dyn ProgressReporter,
}

impl std::fmt::Debug for SyncEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("issues", &self.issues.is_some())
            .field("activities", &self.activities.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Fetched, filtered records ready for the write stage.
#[derive(Debug, Default)]
struct Fetched {
    items: Vec<TrackedItemRecord>,
    activities: Vec<ActivityRecord>,
    /// Repositories sampled from `collection_orgs` this pass.
    collections: Vec<String>,
    /// An activity query failed, so the watermark must not advance.
    activity_gap: bool,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        config: &'a TrellisConfig,
        patterns: &'a CompiledPatterns,
    ) -> Self {
        Self {
            store,
            config,
            patterns,
            issues: None,
            activities: None,
            retry: RetryPolicy::from_config(&config.retry),
            progress: &NOOP,
        }
    }

    #[must_use]
    pub fn with_issue_source(mut self, source: &'a dyn IssueSource) -> Self {
        self.issues = Some(source);
        self
    }

    #[must_use]
    pub fn with_activity_source(mut self, source: &'a dyn ActivitySource) -> Self {
        self.activities = Some(source);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Run one complete pass.
    ///
    /// Record-level failures are collected in the returned report. An `Err`
    /// means the pass itself could not proceed (rejected credentials, store
    /// unavailable for checkpoints).
    #[instrument(skip_all, name = "sync_pass", fields(full = options.full))]
    pub async fn run(&self, options: SyncOptions) -> crate::error::Result<SyncReport> {
        let clock = Instant::now();
        let started = Utc::now();
        let since = self.activity_since(started, options).await?;

        let mut report = SyncReport {
            started_at: Some(started),
            activity_since: Some(since),
            ..SyncReport::default()
        };
        info!(since = %since.to_rfc3339(), "Starting sync pass");

        let fetched = self.fetch(started, since, &mut report).await?;

        let writer = EntityWriter::new(self.store, &self.retry, started);
        let touched = self.upsert(&writer, &fetched, &mut report).await;
        self.resolve(&writer, &touched, &mut report).await;
        self.derive_hierarchy(&writer, &mut report).await;

        report.duration = clock.elapsed();

        if self.activities.is_some() && !fetched.activity_gap {
            let watermark = started.to_rfc3339();
            self.retry
                .run("set_checkpoint", || {
                    self.store.set_checkpoint(WATERMARK_CHECKPOINT, &watermark)
                })
                .await?;
        } else if fetched.activity_gap {
            warn!("Activity fetch incomplete, keeping previous watermark");
        }

        let json = serde_json::to_string(&report).map_err(crate::error::StoreError::from)?;
        self.retry
            .run("set_checkpoint", || self.store.set_checkpoint(REPORT_CHECKPOINT, &json))
            .await?;

        info!(
            upserted = report.total_upserted(),
            edges_created = report.total_edges_created(),
            errors = report.error_count(),
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Sync pass complete"
        );
        Ok(report)
    }

    async fn activity_since(
        &self,
        now: DateTime<Utc>,
        options: SyncOptions,
    ) -> crate::error::Result<DateTime<Utc>> {
        let default =
            now - ChronoDuration::hours(i64::from(self.config.source_control.updated_since_hours));
        if options.full {
            return Ok(default);
        }

        let stored = self
            .retry
            .run("get_checkpoint", || self.store.get_checkpoint(WATERMARK_CHECKPOINT))
            .await?;
        let parsed = stored.as_deref().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| warn!(value = s, error = %e, "Ignoring unreadable watermark"))
                .ok()
        });
        Ok(parsed.unwrap_or(default))
    }

    // ── Fetch + Filter ─────────────────────────────────────────────

    #[instrument(skip_all, name = "fetch")]
    async fn fetch(
        &self,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> crate::error::Result<Fetched> {
        let concurrency = self.config.sync.fetch_concurrency.max(1);
        let mut fetched = Fetched::default();

        self.progress.start(SyncStage::Fetch, None);

        let (open, closed) = if let Some(source) = self.issues {
            let closed_since =
                now - ChronoDuration::days(i64::from(self.config.tracker.closed_lookback_days));
            let queries: Vec<ItemQuery> = self
                .config
                .tracker
                .projects
                .iter()
                .flat_map(|p| {
                    [
                        ItemQuery::Open { project: p.clone() },
                        ItemQuery::ClosedSince {
                            project: p.clone(),
                            since: closed_since,
                        },
                    ]
                })
                .collect();

            let results: Vec<_> = futures::stream::iter(queries)
                .map(|query| async move {
                    let result = self.fetch_item_query(source, &query).await;
                    (query, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

            let mut open = Vec::new();
            let mut closed = Vec::new();
            for (query, result) in results {
                match result {
                    Ok(records) => {
                        self.progress.advance(records.len() as u64);
                        match query {
                            ItemQuery::Open { .. } => open.extend(records),
                            ItemQuery::ClosedSince { .. } => closed.extend(records),
                        }
                    }
                    Err(e) => self.fetch_failed(&query.to_string(), e, report)?,
                }
            }
            (open, closed)
        } else {
            (Vec::new(), Vec::new())
        };

        if let Some(source) = self.activities {
            let sc = &self.config.source_control;
            fetched.collections = self.sample_collections(source, report).await?;

            // A sample is capped at one short page of issues.
            let mut queries: Vec<(ActivityQuery, Option<u32>)> = sc
                .all_repositories()
                .into_iter()
                .flat_map(|(repository, _)| {
                    [ActivityKind::Issue, ActivityKind::ChangeRequest].map(|kind| {
                        let query = ActivityQuery {
                            repository: repository.clone(),
                            kind,
                            since,
                        };
                        (query, None)
                    })
                })
                .collect();
            queries.extend(fetched.collections.iter().map(|repository| {
                let query = ActivityQuery {
                    repository: repository.clone(),
                    kind: ActivityKind::Issue,
                    since,
                };
                (query, Some(sc.collection_issue_limit))
            }));

            let results: Vec<_> = futures::stream::iter(queries)
                .map(|(query, cap)| async move {
                    let result = match cap {
                        None => self.fetch_activity_query(source, &query).await,
                        Some(limit) => self.fetch_activity_sample(source, &query, limit).await,
                    };
                    (query, cap.is_some(), result)
                })
                .buffered(concurrency)
                .collect()
                .await;

            let excluded: HashSet<&str> = self
                .config
                .source_control
                .labels_exclude
                .iter()
                .map(String::as_str)
                .collect();
            for (query, sampled, result) in results {
                match result {
                    Ok(records) => {
                        self.progress.advance(records.len() as u64);
                        fetched.activities.extend(
                            records
                                .into_iter()
                                .filter(|r| !r.labels.iter().any(|l| excluded.contains(l.as_str()))),
                        );
                    }
                    Err(e) => {
                        // Samples change from pass to pass and never hold the watermark back.
                        fetched.activity_gap |= !sampled;
                        self.fetch_failed(&query.to_string(), e, report)?;
                    }
                }
            }
        }
        self.progress.finish();

        info!(
            open = open.len(),
            closed_candidates = closed.len(),
            activities = fetched.activities.len(),
            "Fetch complete"
        );

        self.progress.start(SyncStage::Filter, None);
        let outcome = retain_closed(
            &open,
            closed,
            self.config.sync.include_closed_with_open_deps,
        );
        report.closed_retained = outcome.retained.len() as u64;
        report.closed_dropped = outcome.dropped.len() as u64;
        info!(
            retained = report.closed_retained,
            dropped = report.closed_dropped,
            "Retention filter applied"
        );
        self.progress.finish();

        fetched.items = open;
        fetched.items.extend(outcome.retained);
        Ok(fetched)
    }

    async fn fetch_item_query(
        &self,
        source: &dyn IssueSource,
        query: &ItemQuery,
    ) -> crate::error::Result<Vec<TrackedItemRecord>> {
        let tracker = &self.config.tracker;
        fetch_all(
            &query.to_string(),
            tracker.page_size,
            tracker.page_delay(),
            &self.retry,
            |page| source.fetch_items(query, page),
        )
        .await
    }

    async fn fetch_activity_query(
        &self,
        source: &dyn ActivitySource,
        query: &ActivityQuery,
    ) -> crate::error::Result<Vec<ActivityRecord>> {
        let sc = &self.config.source_control;
        fetch_all(
            &query.to_string(),
            sc.page_size,
            sc.rate_limit_delay(),
            &self.retry,
            |page| source.fetch_activities(query, page),
        )
        .await
    }

    /// Most recently updated repositories of every collection organization,
    /// minus those already configured by name.
    async fn sample_collections(
        &self,
        source: &dyn ActivitySource,
        report: &mut SyncReport,
    ) -> crate::error::Result<Vec<String>> {
        let sc = &self.config.source_control;
        let mut seen: HashSet<String> = sc.all_repositories().into_iter().map(|(r, _)| r).collect();
        let mut sampled = Vec::new();
        for org in &sc.collection_orgs {
            let listed = self
                .retry
                .run("list_org_repositories", || {
                    source.list_org_repositories(org, sc.collection_repo_limit)
                })
                .await;
            match listed {
                Ok(repositories) => {
                    info!(org = %org, repositories = repositories.len(), "Sampled organization");
                    sampled.extend(repositories.into_iter().filter(|r| seen.insert(r.clone())));
                }
                Err(e) => self.fetch_failed(&format!("{org} (organization)"), e, report)?,
            }
        }
        Ok(sampled)
    }

    async fn fetch_activity_sample(
        &self,
        source: &dyn ActivitySource,
        query: &ActivityQuery,
        limit: u32,
    ) -> crate::error::Result<Vec<ActivityRecord>> {
        let page = PageRequest {
            offset: 0,
            size: limit.max(1),
        };
        let page = self
            .retry
            .run(&query.to_string(), || source.fetch_activities(query, page))
            .await?;
        Ok(page.records.into_iter().take(limit as usize).collect())
    }

    /// Record a failed query. Rejected credentials abort the pass.
    fn fetch_failed(
        &self,
        query: &str,
        err: SyncError,
        report: &mut SyncReport,
    ) -> crate::error::Result<()> {
        if matches!(err, SyncError::Upstream(UpstreamError::Auth(_)) | SyncError::Config(_)) {
            return Err(err);
        }
        warn!(query, error = %err, "Fetch failed, continuing without it");
        report.record_error("fetch", query, &err);
        Ok(())
    }

    // ── Upsert ─────────────────────────────────────────────────────

    /// Write every entity; returns the ids of everything written, in order.
    #[instrument(skip_all, name = "upsert")]
    async fn upsert(
        &self,
        writer: &EntityWriter<'_>,
        fetched: &Fetched,
        report: &mut SyncReport,
    ) -> Vec<NodeId> {
        let sc = &self.config.source_control;
        let mut repositories: Vec<(String, String)> = sc.all_repositories();
        repositories.extend(
            fetched
                .collections
                .iter()
                .map(|r| (r.clone(), SourceControlSection::COLLECTIONS.to_string())),
        );
        let known: HashSet<String> = repositories.iter().map(|(r, _)| r.clone()).collect();
        let mut extra: Vec<String> = fetched
            .activities
            .iter()
            .map(|a| a.repository.clone())
            .filter(|r| !r.trim().is_empty() && !known.contains(r))
            .collect();
        extra.sort();
        extra.dedup();
        repositories.extend(extra.into_iter().map(|r| {
            let category = sc.category_of(&r);
            (r, category)
        }));

        let total = repositories.len() + fetched.items.len() + fetched.activities.len();
        self.progress.start(SyncStage::Upsert, Some(total as u64));

        let mut touched = Vec::with_capacity(total);
        for (repository, category) in &repositories {
            let result = writer.upsert_repository(repository, category, report).await;
            self.collect(result, "upsert", repository, &mut touched, report);
        }
        for item in &fetched.items {
            let result = writer.upsert_item(item, report).await;
            self.collect(result, "upsert", &item.key, &mut touched, report);
        }
        for activity in &fetched.activities {
            let result = writer.upsert_activity(activity, report).await;
            self.collect(result, "upsert", &activity.node_name(), &mut touched, report);
        }
        self.progress.finish();

        let mut seen = HashSet::new();
        touched.retain(|id| seen.insert(*id));

        info!(
            items = report.upserted(NodeKind::TrackedItem),
            activities = report.upserted(NodeKind::ExternalActivity),
            repositories = report.upserted(NodeKind::Repository),
            skipped_malformed = report.skipped_malformed,
            "Upsert complete"
        );
        touched
    }

    fn collect(
        &self,
        result: crate::error::Result<NodeId>,
        stage: &str,
        record: &str,
        touched: &mut Vec<NodeId>,
        report: &mut SyncReport,
    ) {
        self.progress.advance(1);
        match result {
            Ok(id) => touched.push(id),
            Err(SyncError::Malformed(reason)) => {
                warn!(record, reason = %reason, "Skipping malformed record");
                report.skipped_malformed += 1;
            }
            Err(e) => {
                warn!(stage, record, error = %e, "Record failed, skipping");
                report.record_error(stage, record, &e);
            }
        }
    }

    // ── Resolve ────────────────────────────────────────────────────

    #[instrument(skip_all, name = "resolve")]
    async fn resolve(&self, writer: &EntityWriter<'_>, touched: &[NodeId], report: &mut SyncReport) {
        let resolver = Resolver::new(writer, self.patterns);
        self.progress
            .start(SyncStage::Resolve, Some(touched.len() as u64));

        let before = report.total_edges_created();
        for &id in touched {
            self.progress.advance(1);
            let node = match self.retry.run("get_node", || self.store.get_node(id)).await {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(e) => {
                    report.record_error("resolve", id.to_string(), &e);
                    continue;
                }
            };
            if let Err(e) = resolver.resolve(&node, report).await {
                warn!(entity = %node.name, error = %e, "Resolution failed, skipping");
                report.record_error("resolve", node.name.clone(), &e);
            }
        }
        self.progress.finish();

        info!(
            entities = touched.len(),
            edges_created = report.total_edges_created() - before,
            "Resolution complete"
        );
    }

    // ── Derive ─────────────────────────────────────────────────────

    #[instrument(skip_all, name = "derive_hierarchy")]
    async fn derive_hierarchy(&self, writer: &EntityWriter<'_>, report: &mut SyncReport) {
        self.progress.start(SyncStage::Derive, None);
        let filter = NodeFilter {
            kind: Some(NodeKind::TrackedItem),
            ..Default::default()
        };
        let nodes = match self.retry.run("find_nodes", || self.store.find_nodes(&filter)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Cannot load tracked items, skipping hierarchy");
                report.record_error("hierarchy", "tracked items", &e);
                self.progress.finish();
                return;
            }
        };

        let items: Vec<HierarchyItem> = nodes.iter().map(HierarchyItem::from_node).collect();
        let links = derive_links(&items);
        for link in &links {
            self.progress.advance(1);
            if let Err(e) = writer
                .link_pair(EdgeKind::ChildOf, EdgeKind::ParentOf, link.child, link.parent, report)
                .await
            {
                report.record_error("hierarchy", format!("{} -> {}", link.child, link.parent), &e);
            }
        }
        self.progress.finish();

        info!(
            items = items.len(),
            links = links.len(),
            new_links = report.created(EdgeKind::ChildOf),
            "Hierarchy derived"
        );
    }
}

/// Read the report stored by the last successful pass.
pub async fn last_report(store: &dyn GraphStore) -> crate::error::Result<Option<SyncReport>> {
    let Some(json) = store.get_checkpoint(REPORT_CHECKPOINT).await? else {
        return Ok(None);
    };
    let report = serde_json::from_str(&json).map_err(crate::error::StoreError::from)?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn engine_parts() -> (SqliteStore, TrellisConfig, CompiledPatterns) {
        let config = TrellisConfig::default();
        let patterns = config.compile_patterns().unwrap();
        (SqliteStore::in_memory().unwrap(), config, patterns)
    }

    #[tokio::test]
    async fn watermark_defaults_to_configured_window() {
        let (store, config, patterns) = engine_parts();
        let engine = SyncEngine::new(&store, &config, &patterns);
        let now = Utc::now();

        let since = engine.activity_since(now, SyncOptions::default()).await.unwrap();
        assert_eq!(since, now - ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn stored_watermark_wins_unless_full() {
        let (store, config, patterns) = engine_parts();
        let stored = Utc::now() - ChronoDuration::days(3);
        store
            .set_checkpoint(WATERMARK_CHECKPOINT, &stored.to_rfc3339())
            .await
            .unwrap();
        let engine = SyncEngine::new(&store, &config, &patterns);
        let now = Utc::now();

        let since = engine.activity_since(now, SyncOptions::default()).await.unwrap();
        assert_eq!(since, stored);
        let full = engine.activity_since(now, SyncOptions { full: true }).await.unwrap();
        assert_eq!(full, now - ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn unreadable_watermark_falls_back() {
        let (store, config, patterns) = engine_parts();
        store
            .set_checkpoint(WATERMARK_CHECKPOINT, "yesterday-ish")
            .await
            .unwrap();
        let engine = SyncEngine::new(&store, &config, &patterns);
        let now = Utc::now();

        let since = engine.activity_since(now, SyncOptions::default()).await.unwrap();
        assert_eq!(since, now - ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn pass_without_sources_stores_report_but_no_watermark() {
        let (store, config, patterns) = engine_parts();
        let report = SyncEngine::new(&store, &config, &patterns)
            .run(SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total_upserted(), 0);
        assert!(store.get_checkpoint(WATERMARK_CHECKPOINT).await.unwrap().is_none());

        let stored = last_report(&store).await.unwrap().unwrap();
        assert_eq!(stored.started_at, report.started_at);
    }
}
