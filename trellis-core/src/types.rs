use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(NodeId);
typed_id!(EdgeId);

// ── Node types ─────────────────────────────────────────────────────

/// Every entity Trellis tracks is a node keyed by `(kind, natural key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// A unit of work from the issue tracker, keyed like `PROJ-123`.
    TrackedItem,
    /// An issue or change request from source control, keyed `org/repo#N`.
    ExternalActivity,
    /// A source-control repository, keyed by full name.
    Repository,
    /// The organization owning repositories.
    Organization,
    /// Tracker project, keyed by project key.
    Project,
    /// Technology tag, keyed by lower-cased name.
    Technology,
    /// Component tag, keyed by lower-cased name.
    Component,
    /// A person, keyed by display name or login.
    User,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackedItem => "TrackedItem",
            Self::ExternalActivity => "ExternalActivity",
            Self::Repository => "Repository",
            Self::Organization => "Organization",
            Self::Project => "Project",
            Self::Technology => "Technology",
            Self::Component => "Component",
            Self::User => "User",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A node in the Trellis graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Natural key: tracker key, `org/repo#N`, repository full name, etc.
    pub name: String,
    /// When this node was last written by a sync pass.
    pub last_synced: DateTime<Utc>,
    /// Entity properties. Replaced wholesale on every upsert.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Node {
    /// Build a node with a placeholder id; the store assigns the real one.
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: NodeId(0),
            kind,
            name: name.into(),
            last_synced: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Concatenated text of the given string metadata fields, skipping absent ones.
    pub fn text_of(&self, fields: &[&str]) -> String {
        fields
            .iter()
            .filter_map(|f| self.metadata.get(*f).and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// String-array metadata field, empty when absent.
    pub fn string_list(&self, field: &str) -> Vec<String> {
        self.metadata
            .get(field)
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Edge types ─────────────────────────────────────────────────────

/// Directed, semantically named relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Item → Project, Activity → Repository, Repository → Organization.
    BelongsTo,
    /// Activity (issue) → `TrackedItem`.
    Addresses,
    /// `TrackedItem` → Activity (issue); reverse of `Addresses`.
    TrackedIn,
    /// Change request → `TrackedItem`, and Repository → Component.
    Implements,
    /// `TrackedItem` → change request; reverse of `Implements`.
    ImplementedIn,
    /// `TrackedItem` → Activity mentioned by number.
    References,
    /// Activity → `TrackedItem`; reverse of `References`.
    ReferencedBy,
    /// Child item → parent item.
    ChildOf,
    /// Parent item → child item.
    ParentOf,
    /// Item or Activity → Technology.
    Involves,
    /// `TrackedItem` → Component.
    Affects,
    /// Activity → Component its repository implements.
    RelatesTo,
    /// Item → User (assignee).
    AssignedTo,
    /// Activity → User (author).
    CreatedBy,
    /// Item → User (reporter).
    ReportedBy,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelongsTo => "BELONGS_TO",
            Self::Addresses => "ADDRESSES",
            Self::TrackedIn => "TRACKED_IN",
            Self::Implements => "IMPLEMENTS",
            Self::ImplementedIn => "IMPLEMENTED_IN",
            Self::References => "REFERENCES",
            Self::ReferencedBy => "REFERENCED_BY",
            Self::ChildOf => "CHILD_OF",
            Self::ParentOf => "PARENT_OF",
            Self::Involves => "INVOLVES",
            Self::Affects => "AFFECTS",
            Self::RelatesTo => "RELATES_TO",
            Self::AssignedTo => "ASSIGNED_TO",
            Self::CreatedBy => "CREATED_BY",
            Self::ReportedBy => "REPORTED_BY",
        }
    }

    /// Parse the stored relationship name back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [EdgeKind; 15] = [
            EdgeKind::BelongsTo,
            EdgeKind::Addresses,
            EdgeKind::TrackedIn,
            EdgeKind::Implements,
            EdgeKind::ImplementedIn,
            EdgeKind::References,
            EdgeKind::ReferencedBy,
            EdgeKind::ChildOf,
            EdgeKind::ParentOf,
            EdgeKind::Involves,
            EdgeKind::Affects,
            EdgeKind::RelatesTo,
            EdgeKind::AssignedTo,
            EdgeKind::CreatedBy,
            EdgeKind::ReportedBy,
        ];
        ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A directed edge between two existing nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub source: NodeId,
    pub target: NodeId,
    /// When this edge was first ensured.
    pub created_at: DateTime<Utc>,
}

// ── Normalized upstream records ────────────────────────────────────

/// Lifecycle state of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Open,
    Closed,
    Other,
}

impl ItemState {
    /// Map a tracker status-category key (`new`, `indeterminate`, `done`).
    pub fn from_status_category(category: &str) -> Self {
        match category.to_ascii_lowercase().as_str() {
            "new" | "indeterminate" => Self::Open,
            "done" => Self::Closed,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Other => "other",
        }
    }
}

/// Kind of tracked item; drives hierarchy derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    Epic,
    Story,
    Task,
    Bug,
    Subtask,
    Other(String),
}

impl ItemKind {
    /// Parse a tracker issue-type name, tolerating case and hyphenation.
    pub fn parse(name: &str) -> Self {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "epic" => Self::Epic,
            "story" | "userstory" => Self::Story,
            "task" => Self::Task,
            "bug" => Self::Bug,
            "subtask" => Self::Subtask,
            _ => Self::Other(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Epic => "Epic",
            Self::Story => "Story",
            Self::Task => "Task",
            Self::Bug => "Bug",
            Self::Subtask => "Sub-task",
            Self::Other(name) => name,
        }
    }

    /// Depth in the epic → story → task/bug/subtask hierarchy.
    pub fn hierarchy_level(&self) -> Option<u8> {
        match self {
            Self::Epic => Some(0),
            Self::Story => Some(1),
            Self::Task | Self::Bug | Self::Subtask => Some(2),
            Self::Other(_) => None,
        }
    }
}

/// One issue from the tracker, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItemRecord {
    /// Project-scoped key, e.g. `PROJ-123`. Empty means malformed.
    pub key: String,
    pub summary: String,
    pub description: Option<String>,
    /// Raw tracker status name, e.g. "In Progress".
    pub status: String,
    pub state: ItemState,
    pub priority: Option<String>,
    pub kind: ItemKind,
    pub project: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
    pub labels: Vec<String>,
    pub components: Vec<String>,
}

impl TrackedItemRecord {
    /// Summary and description joined, the text cross-references are read from.
    pub fn text(&self) -> String {
        match &self.description {
            Some(d) => format!("{} {d}", self.summary),
            None => self.summary.clone(),
        }
    }
}

/// Whether a source-control record is an issue or a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Issue,
    ChangeRequest,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::ChangeRequest => "change_request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Open,
    Closed,
    Merged,
}

impl ActivityState {
    /// Derive from an API `state` string plus merge timestamp.
    pub fn from_api(state: &str, merged: bool) -> Self {
        if merged {
            Self::Merged
        } else if state.eq_ignore_ascii_case("open") {
            Self::Open
        } else {
            Self::Closed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

/// One issue or change request from source control, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Repository full name, `org/repo`. Empty means malformed.
    pub repository: String,
    /// Issue/change-request number. Zero means malformed.
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: ActivityState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub author: Option<String>,
    pub url: String,
    pub labels: Vec<String>,
    pub organization: String,
    pub kind: ActivityKind,
    pub base_branch: Option<String>,
    pub head_branch: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    /// Natural key of the activity node.
    pub fn node_name(&self) -> String {
        activity_name(&self.repository, self.number)
    }

    /// Title and body joined.
    pub fn text(&self) -> String {
        match &self.body {
            Some(b) => format!("{} {b}", self.title),
            None => self.title.clone(),
        }
    }
}

/// Natural key for an `ExternalActivity` node.
pub fn activity_name(repository: &str, number: u64) -> String {
    format!("{repository}#{number}")
}

// ── Store query types ──────────────────────────────────────────────

/// Filter for finding nodes in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Only return nodes of this kind.
    pub kind: Option<NodeKind>,
    /// Only return nodes whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Only return nodes whose name ends with this suffix.
    pub name_suffix: Option<String>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

/// Summary statistics for the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_nodes: u64,
    pub total_edges: u64,
    /// Node count broken down by `NodeKind`.
    pub nodes_by_kind: HashMap<String, u64>,
    /// Edge count broken down by `EdgeKind`.
    pub edges_by_kind: HashMap<String, u64>,
    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

// ── Pass results ───────────────────────────────────────────────────

/// A single record that failed during a pass and was skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    /// Stage in which the failure happened (`upsert`, `resolve`, `fetch`, ...).
    pub stage: String,
    /// Natural key or query description of the failed record.
    pub record: String,
    pub message: String,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.record, self.message)
    }
}

/// Aggregate counters emitted at the end of a pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: Option<DateTime<Utc>>,
    /// Watermark the activity fetch was bounded by.
    pub activity_since: Option<DateTime<Utc>>,
    /// Nodes written per kind (including re-writes of existing nodes).
    pub entities_upserted: BTreeMap<NodeKind, u64>,
    /// Edges newly created per kind; re-ensuring an existing edge counts zero.
    pub edges_created: BTreeMap<EdgeKind, u64>,
    /// Closed items admitted by the retention filter.
    pub closed_retained: u64,
    /// Closed items dropped by the retention filter.
    pub closed_dropped: u64,
    /// Malformed records skipped without retry.
    pub skipped_malformed: u64,
    pub errors: Vec<RecordError>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl SyncReport {
    pub fn record_upsert(&mut self, kind: NodeKind) {
        *self.entities_upserted.entry(kind).or_default() += 1;
    }

    pub fn record_edge(&mut self, kind: EdgeKind, created: bool) {
        if created {
            *self.edges_created.entry(kind).or_default() += 1;
        }
    }

    pub fn record_error(&mut self, stage: &str, record: impl Into<String>, message: impl ToString) {
        self.errors.push(RecordError {
            stage: stage.to_string(),
            record: record.into(),
            message: message.to_string(),
        });
    }

    pub fn upserted(&self, kind: NodeKind) -> u64 {
        self.entities_upserted.get(&kind).copied().unwrap_or(0)
    }

    pub fn created(&self, kind: EdgeKind) -> u64 {
        self.edges_created.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_edges_created(&self) -> u64 {
        self.edges_created.values().sum()
    }

    pub fn total_upserted(&self) -> u64 {
        self.entities_upserted.values().sum()
    }

    /// Total record-level failures, counting malformed skips.
    pub fn error_count(&self) -> u64 {
        u64::try_from(self.errors.len()).unwrap_or(u64::MAX) + self.skipped_malformed
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_kind_parse_tolerates_spelling() {
        assert_eq!(ItemKind::parse("Epic"), ItemKind::Epic);
        assert_eq!(ItemKind::parse("Sub-task"), ItemKind::Subtask);
        assert_eq!(ItemKind::parse("subtask"), ItemKind::Subtask);
        assert_eq!(ItemKind::parse("BUG"), ItemKind::Bug);
        assert_eq!(
            ItemKind::parse("Feature Request"),
            ItemKind::Other("Feature Request".to_string())
        );
    }

    #[test]
    fn hierarchy_levels_descend() {
        assert!(ItemKind::Epic.hierarchy_level() < ItemKind::Story.hierarchy_level());
        assert_eq!(
            ItemKind::Bug.hierarchy_level(),
            ItemKind::Subtask.hierarchy_level()
        );
        assert_eq!(ItemKind::Other("Spike".into()).hierarchy_level(), None);
    }

    #[test]
    fn item_state_from_category() {
        assert_eq!(ItemState::from_status_category("done"), ItemState::Closed);
        assert_eq!(
            ItemState::from_status_category("indeterminate"),
            ItemState::Open
        );
        assert_eq!(ItemState::from_status_category("new"), ItemState::Open);
        assert_eq!(ItemState::from_status_category("weird"), ItemState::Other);
    }

    #[test]
    fn activity_state_prefers_merged() {
        assert_eq!(ActivityState::from_api("closed", true), ActivityState::Merged);
        assert_eq!(ActivityState::from_api("open", false), ActivityState::Open);
        assert_eq!(ActivityState::from_api("closed", false), ActivityState::Closed);
    }

    #[test]
    fn edge_kind_names_round_trip() {
        for kind in [
            EdgeKind::BelongsTo,
            EdgeKind::Addresses,
            EdgeKind::ImplementedIn,
            EdgeKind::ReferencedBy,
            EdgeKind::ChildOf,
            EdgeKind::RelatesTo,
            EdgeKind::ReportedBy,
        ] {
            assert_eq!(EdgeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EdgeKind::parse("RELATES_TO"), Some(EdgeKind::RelatesTo));
        assert_eq!(EdgeKind::parse("LINKS_TO"), None);
    }

    #[test]
    fn activity_name_format() {
        assert_eq!(activity_name("acme/widgets", 42), "acme/widgets#42");
    }

    #[test]
    fn node_text_skips_missing_fields() {
        let mut node = Node::new(NodeKind::TrackedItem, "PROJ-1");
        node.metadata
            .insert("summary".into(), serde_json::json!("Fix login"));
        node.metadata.insert("description".into(), serde_json::Value::Null);
        assert_eq!(node.text_of(&["summary", "description"]), "Fix login");
    }

    #[test]
    fn report_serializes_with_kind_keys() {
        let mut report = SyncReport::default();
        report.record_upsert(NodeKind::TrackedItem);
        report.record_edge(EdgeKind::Addresses, true);
        report.record_edge(EdgeKind::Addresses, false);
        let json = serde_json::to_string(&report).unwrap();
        let back: SyncReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.upserted(NodeKind::TrackedItem), 1);
        assert_eq!(back.created(EdgeKind::Addresses), 1);
    }
}
