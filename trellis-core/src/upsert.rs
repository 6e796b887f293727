//! Idempotent entity writes: one node per natural key plus its structural edges.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::error::SyncError;
use crate::retry::RetryPolicy;
use crate::store::GraphStore;
use crate::types::{
    ActivityRecord, EdgeKind, Node, NodeFilter, NodeId, NodeKind, SyncReport, TrackedItemRecord,
};

/// Writes entities through a [`GraphStore`], wrapping each store call in the
/// retry policy.
pub struct EntityWriter<'a> {
    store: &'a dyn GraphStore,
    retry: &'a RetryPolicy,
    synced_at: DateTime<Utc>,
}

impl std::fmt::Debug for EntityWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityWriter")
            .field("retry", self.retry)
            .field("synced_at", &self.synced_at)
            .finish_non_exhaustive()
    }
}

impl<'a> EntityWriter<'a> {
    pub fn new(store: &'a dyn GraphStore, retry: &'a RetryPolicy, synced_at: DateTime<Utc>) -> Self {
        Self {
            store,
            retry,
            synced_at,
        }
    }

    /// Node by natural key.
    pub async fn lookup(&self, kind: NodeKind, name: &str) -> crate::error::Result<Option<Node>> {
        self.retry
            .run("get_node_by_name", || self.store.get_node_by_name(kind, name))
            .await
    }

    pub async fn find(&self, filter: &NodeFilter) -> crate::error::Result<Vec<Node>> {
        self.retry
            .run("find_nodes", || self.store.find_nodes(filter))
            .await
    }

    /// Targets of the `kind` edges leaving `source`.
    pub async fn targets(&self, source: NodeId, kind: EdgeKind) -> crate::error::Result<Vec<NodeId>> {
        let edges = self
            .retry
            .run("edges_from", || self.store.edges_from(source, Some(kind)))
            .await?;
        Ok(edges.into_iter().map(|e| e.target).collect())
    }

    async fn write_node(&self, node: &Node) -> crate::error::Result<NodeId> {
        self.retry
            .run("upsert_node", || self.store.upsert_node(node))
            .await
    }

    /// Get-or-create a node by natural key without touching existing metadata.
    pub async fn ensure_node(
        &self,
        kind: NodeKind,
        name: &str,
        report: &mut SyncReport,
    ) -> crate::error::Result<NodeId> {
        if let Some(node) = self.lookup(kind, name).await? {
            return Ok(node.id);
        }

        let mut node = Node::new(kind, name);
        node.last_synced = self.synced_at;
        let id = self.write_node(&node).await?;
        report.record_upsert(kind);
        debug!(kind = %kind, name, "Created node");
        Ok(id)
    }

    /// Ensure one directed edge, counting it only if newly created.
    pub async fn link(
        &self,
        kind: EdgeKind,
        source: NodeId,
        target: NodeId,
        report: &mut SyncReport,
    ) -> crate::error::Result<bool> {
        let created = self
            .retry
            .run("ensure_edge", || self.store.ensure_edge(kind, source, target))
            .await?;
        report.record_edge(kind, created);
        Ok(created)
    }

    /// Ensure `forward` from `a` to `b` and `reverse` from `b` to `a`.
    pub async fn link_pair(
        &self,
        forward: EdgeKind,
        reverse: EdgeKind,
        a: NodeId,
        b: NodeId,
        report: &mut SyncReport,
    ) -> crate::error::Result<()> {
        self.link(forward, a, b, report).await?;
        self.link(reverse, b, a, report).await?;
        Ok(())
    }

    /// Upsert a tracked item, its project membership and its people.
    pub async fn upsert_item(
        &self,
        record: &TrackedItemRecord,
        report: &mut SyncReport,
    ) -> crate::error::Result<NodeId> {
        let project = item_project(record)?;
        let node = item_node(record, &project, self.synced_at);
        let id = self.write_node(&node).await?;
        report.record_upsert(NodeKind::TrackedItem);

        let project_id = self.ensure_node(NodeKind::Project, &project, report).await?;
        self.link(EdgeKind::BelongsTo, id, project_id, report).await?;

        if let Some(assignee) = non_blank(record.assignee.as_deref()) {
            let user = self.ensure_node(NodeKind::User, assignee, report).await?;
            self.link(EdgeKind::AssignedTo, id, user, report).await?;
        }
        if let Some(reporter) = non_blank(record.reporter.as_deref()) {
            let user = self.ensure_node(NodeKind::User, reporter, report).await?;
            self.link(EdgeKind::ReportedBy, id, user, report).await?;
        }
        Ok(id)
    }

    /// Upsert a repository node and its organization membership.
    pub async fn upsert_repository(
        &self,
        full_name: &str,
        category: &str,
        report: &mut SyncReport,
    ) -> crate::error::Result<NodeId> {
        let (organization, short_name) = split_repository(full_name)?;

        let mut node = Node::new(NodeKind::Repository, full_name);
        node.last_synced = self.synced_at;
        node.metadata.insert("full_name".into(), json!(full_name));
        node.metadata.insert("short_name".into(), json!(short_name));
        node.metadata.insert("organization".into(), json!(organization));
        node.metadata.insert("category".into(), json!(category));
        node.metadata
            .insert("last_synced".into(), json!(self.synced_at.to_rfc3339()));
        let id = self.write_node(&node).await?;
        report.record_upsert(NodeKind::Repository);

        let org_id = self
            .ensure_node(NodeKind::Organization, organization, report)
            .await?;
        self.link(EdgeKind::BelongsTo, id, org_id, report).await?;
        Ok(id)
    }

    /// Upsert an activity, its repository membership and its author.
    ///
    /// The repository node is created bare if it has not been upserted yet.
    pub async fn upsert_activity(
        &self,
        record: &ActivityRecord,
        report: &mut SyncReport,
    ) -> crate::error::Result<NodeId> {
        validate_activity(record)?;
        let node = activity_node(record, self.synced_at);
        let id = self.write_node(&node).await?;
        report.record_upsert(NodeKind::ExternalActivity);

        let repo_id = self
            .ensure_node(NodeKind::Repository, &record.repository, report)
            .await?;
        self.link(EdgeKind::BelongsTo, id, repo_id, report).await?;

        if let Some(author) = non_blank(record.author.as_deref()) {
            let user = self.ensure_node(NodeKind::User, author, report).await?;
            self.link(EdgeKind::CreatedBy, id, user, report).await?;
        }
        Ok(id)
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Project key for an item, taken from the record or the key prefix.
fn item_project(record: &TrackedItemRecord) -> crate::error::Result<String> {
    let key = record.key.trim();
    if key.is_empty() {
        return Err(SyncError::Malformed(format!(
            "tracked item without key (summary: {:?})",
            record.summary
        )));
    }
    if let Some(project) = non_blank(Some(&record.project)) {
        return Ok(project.to_string());
    }
    match key.rsplit_once('-') {
        Some((prefix, _)) if !prefix.is_empty() => Ok(prefix.to_string()),
        _ => Err(SyncError::Malformed(format!(
            "tracked item {key} has no project"
        ))),
    }
}

fn validate_activity(record: &ActivityRecord) -> crate::error::Result<()> {
    if record.repository.trim().is_empty() || record.number == 0 {
        return Err(SyncError::Malformed(format!(
            "activity without repository/number (title: {:?})",
            record.title
        )));
    }
    split_repository(&record.repository).map(|_| ())
}

/// Split `org/repo` into its organization and short name.
pub fn split_repository(full_name: &str) -> crate::error::Result<(&str, &str)> {
    match full_name.split_once('/') {
        Some((org, name)) if !org.is_empty() && !name.is_empty() => Ok((org, name)),
        _ => Err(SyncError::Malformed(format!(
            "repository name {full_name:?} is not of the form org/repo"
        ))),
    }
}

fn item_node(record: &TrackedItemRecord, project: &str, synced_at: DateTime<Utc>) -> Node {
    let mut node = Node::new(NodeKind::TrackedItem, record.key.trim());
    node.last_synced = synced_at;
    let m = &mut node.metadata;
    m.insert("key".into(), json!(record.key.trim()));
    m.insert("summary".into(), json!(record.summary));
    m.insert("description".into(), json!(record.description));
    m.insert("status".into(), json!(record.status));
    m.insert("state".into(), json!(record.state.as_str()));
    m.insert("priority".into(), json!(record.priority));
    m.insert("issue_type".into(), json!(record.kind.as_str()));
    m.insert("project".into(), json!(project));
    m.insert("created".into(), json!(record.created.to_rfc3339()));
    m.insert("updated".into(), json!(record.updated.to_rfc3339()));
    m.insert("assignee".into(), json!(record.assignee));
    m.insert("reporter".into(), json!(record.reporter));
    m.insert("labels".into(), json!(record.labels));
    m.insert("components".into(), json!(record.components));
    m.insert("last_synced".into(), json!(synced_at.to_rfc3339()));
    node
}

fn activity_node(record: &ActivityRecord, synced_at: DateTime<Utc>) -> Node {
    let organization = if record.organization.trim().is_empty() {
        record
            .repository
            .split_once('/')
            .map_or("", |(org, _)| org)
            .to_string()
    } else {
        record.organization.clone()
    };

    let mut node = Node::new(NodeKind::ExternalActivity, record.node_name());
    node.last_synced = synced_at;
    let m = &mut node.metadata;
    m.insert("repository".into(), json!(record.repository));
    m.insert("number".into(), json!(record.number));
    m.insert("title".into(), json!(record.title));
    m.insert("body".into(), json!(record.body));
    m.insert("state".into(), json!(record.state.as_str()));
    m.insert("activity_kind".into(), json!(record.kind.as_str()));
    m.insert("created".into(), json!(record.created.to_rfc3339()));
    m.insert("updated".into(), json!(record.updated.to_rfc3339()));
    m.insert("author".into(), json!(record.author));
    m.insert("url".into(), json!(record.url));
    m.insert("labels".into(), json!(record.labels));
    m.insert("organization".into(), json!(organization));
    m.insert("base_branch".into(), json!(record.base_branch));
    m.insert("head_branch".into(), json!(record.head_branch));
    m.insert(
        "merged_at".into(),
        json!(record.merged_at.map(|t| t.to_rfc3339())),
    );
    m.insert("last_synced".into(), json!(synced_at.to_rfc3339()));
    node
}
