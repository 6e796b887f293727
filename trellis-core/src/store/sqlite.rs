use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{StoreError, SyncError};
use crate::types::{Edge, EdgeId, EdgeKind, Node, NodeFilter, NodeId, NodeKind, StoreStats};

use super::GraphStore;
use super::schema;

/// SQLite-backed implementation of `GraphStore`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");

        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::Sqlite)?;

        // Ignored for in-memory databases
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(StoreError::Sqlite)?;

        conn.execute(
            "INSERT OR IGNORE INTO trellis_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION],
        )
        .map_err(StoreError::Sqlite)?;

        Ok(())
    }

    fn parse_metadata(json_str: &str) -> HashMap<String, serde_json::Value> {
        serde_json::from_str(json_str).unwrap_or_default()
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
    }

    fn conversion_error(column: usize, value: &str) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown kind `{value}`").into(),
        )
    }

    fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
        let kind_str: String = row.get("kind")?;
        let metadata_str: Option<String> = row.get("metadata")?;
        let last_synced_str: String = row.get("last_synced")?;

        let kind: NodeKind = serde_json::from_value(serde_json::Value::String(kind_str.clone()))
            .map_err(|_| Self::conversion_error(1, &kind_str))?;

        Ok(Node {
            id: NodeId(row.get("id")?),
            kind,
            name: row.get("name")?,
            last_synced: Self::parse_time(&last_synced_str),
            metadata: metadata_str
                .as_deref()
                .map(Self::parse_metadata)
                .unwrap_or_default(),
        })
    }

    fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
        let kind_str: String = row.get("kind")?;
        let created_str: String = row.get("created_at")?;
        let kind = EdgeKind::parse(&kind_str).ok_or_else(|| Self::conversion_error(1, &kind_str))?;

        Ok(Edge {
            id: EdgeId(row.get("id")?),
            kind,
            source: NodeId(row.get("source_id")?),
            target: NodeId(row.get("target_id")?),
            created_at: Self::parse_time(&created_str),
        })
    }

    fn query_edges(
        &self,
        column: &str,
        node: NodeId,
        kind: Option<EdgeKind>,
    ) -> crate::error::Result<Vec<Edge>> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        let mut sql = format!("SELECT * FROM edges WHERE {column} = ?1");
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(node.0)];
        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?2");
            param_values.push(Box::new(kind.as_str()));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::Sqlite)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(std::convert::AsRef::as_ref)
            .collect();
        let edges = stmt
            .query_map(params_ref.as_slice(), Self::row_to_edge)
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;
        Ok(edges)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait::async_trait]
impl GraphStore for SqliteStore {
    // ── Node operations ────────────────────────────────────────────

    async fn upsert_node(&self, node: &Node) -> crate::error::Result<NodeId> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        let kind_str = node.kind.as_str();
        let metadata_json =
            serde_json::to_string(&node.metadata).map_err(StoreError::Serialization)?;
        let last_synced = node.last_synced.to_rfc3339();

        conn.execute(
            "INSERT INTO nodes (kind, name, last_synced, metadata)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, name) DO UPDATE SET
                last_synced = excluded.last_synced,
                metadata = excluded.metadata",
            params![kind_str, node.name, last_synced, metadata_json],
        )
        .map_err(StoreError::Sqlite)?;

        // last_insert_rowid() is stale after ON CONFLICT DO UPDATE
        let actual_id: i64 = conn
            .query_row(
                "SELECT id FROM nodes WHERE kind = ?1 AND name = ?2",
                params![kind_str, node.name],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        Ok(NodeId(actual_id))
    }

    async fn get_node(&self, id: NodeId) -> crate::error::Result<Option<Node>> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        conn.query_row(
            "SELECT * FROM nodes WHERE id = ?1",
            params![id.0],
            Self::row_to_node,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(SyncError::Store)
    }

    async fn get_node_by_name(
        &self,
        kind: NodeKind,
        name: &str,
    ) -> crate::error::Result<Option<Node>> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        conn.query_row(
            "SELECT * FROM nodes WHERE kind = ?1 AND name = ?2",
            params![kind.as_str(), name],
            Self::row_to_node,
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(SyncError::Store)
    }

    async fn find_nodes(&self, filter: &NodeFilter) -> crate::error::Result<Vec<Node>> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        let mut sql = String::from("SELECT * FROM nodes WHERE 1=1");
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(kind) = &filter.kind {
            let _ = write!(sql, " AND kind = ?{}", param_values.len() + 1);
            param_values.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(prefix) = &filter.name_prefix {
            let _ = write!(
                sql,
                " AND name LIKE ?{} ESCAPE '\\'",
                param_values.len() + 1
            );
            param_values.push(Box::new(format!("{}%", escape_like(prefix))));
        }
        if let Some(suffix) = &filter.name_suffix {
            let _ = write!(
                sql,
                " AND name LIKE ?{} ESCAPE '\\'",
                param_values.len() + 1
            );
            param_values.push(Box::new(format!("%{}", escape_like(suffix))));
        }
        sql.push_str(" ORDER BY name");
        if let Some(limit) = filter.limit {
            let _ = write!(sql, " LIMIT ?{}", param_values.len() + 1);
            param_values.push(Box::new(limit));
        }

        let mut stmt = conn.prepare(&sql).map_err(StoreError::Sqlite)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(std::convert::AsRef::as_ref)
            .collect();
        let nodes = stmt
            .query_map(params_ref.as_slice(), Self::row_to_node)
            .map_err(StoreError::Sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::Sqlite)?;

        Ok(nodes)
    }

    // ── Edge operations ────────────────────────────────────────────

    async fn ensure_edge(
        &self,
        kind: EdgeKind,
        source: NodeId,
        target: NodeId,
    ) -> crate::error::Result<bool> {
        let mut conn = self.conn.lock().expect("trellis store mutex poisoned");
        let tx = conn.transaction().map_err(StoreError::Sqlite)?;

        for endpoint in [source, target] {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
                    params![endpoint.0],
                    |row| row.get(0),
                )
                .map_err(StoreError::Sqlite)?;
            if !exists {
                return Err(StoreError::NodeNotFound(format!("node id {endpoint}")).into());
            }
        }

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO edges (kind, source_id, target_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![kind.as_str(), source.0, target.0, Utc::now().to_rfc3339()],
            )
            .map_err(StoreError::Sqlite)?;
        tx.commit().map_err(StoreError::Sqlite)?;

        Ok(inserted > 0)
    }

    async fn edges_from(
        &self,
        source: NodeId,
        kind: Option<EdgeKind>,
    ) -> crate::error::Result<Vec<Edge>> {
        self.query_edges("source_id", source, kind)
    }

    async fn edges_to(
        &self,
        target: NodeId,
        kind: Option<EdgeKind>,
    ) -> crate::error::Result<Vec<Edge>> {
        self.query_edges("target_id", target, kind)
    }

    // ── Checkpoints ────────────────────────────────────────────────

    async fn get_checkpoint(&self, kind: &str) -> crate::error::Result<Option<String>> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        conn.query_row(
            "SELECT value FROM checkpoints WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::Sqlite)
        .map_err(SyncError::Store)
    }

    async fn set_checkpoint(&self, kind: &str, value: &str) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO checkpoints (kind, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![kind, value, now],
        )
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    async fn clear_checkpoint(&self, kind: &str) -> crate::error::Result<()> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");
        conn.execute("DELETE FROM checkpoints WHERE kind = ?1", params![kind])
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    // ── Metrics ────────────────────────────────────────────────────

    async fn stats(&self) -> crate::error::Result<StoreStats> {
        let conn = self.conn.lock().expect("trellis store mutex poisoned");

        let total_nodes: u64 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .map_err(StoreError::Sqlite)?;
        let total_edges: u64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
            .map_err(StoreError::Sqlite)?;

        let count_by_kind = |table: &str| -> rusqlite::Result<HashMap<String, u64>> {
            let mut stmt =
                conn.prepare(&format!("SELECT kind, COUNT(*) FROM {table} GROUP BY kind"))?;
            let counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(counts)
        };
        let nodes_by_kind = count_by_kind("nodes").map_err(StoreError::Sqlite)?;
        let edges_by_kind = count_by_kind("edges").map_err(StoreError::Sqlite)?;

        let db_size_bytes = self
            .db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len());

        Ok(StoreStats {
            total_nodes,
            total_edges,
            nodes_by_kind,
            edges_by_kind,
            db_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_node(kind: NodeKind, name: &str) -> Node {
        let mut node = Node::new(kind, name);
        node.metadata
            .insert("summary".into(), serde_json::json!(format!("about {name}")));
        node
    }

    #[tokio::test]
    async fn upsert_and_get_node() {
        let store = SqliteStore::in_memory().unwrap();
        let id = store
            .upsert_node(&make_test_node(NodeKind::TrackedItem, "PROJ-1"))
            .await
            .unwrap();
        assert!(id.0 > 0);

        let fetched = store.get_node(id).await.unwrap().unwrap();
        assert_eq!(fetched.kind, NodeKind::TrackedItem);
        assert_eq!(fetched.name, "PROJ-1");
        assert_eq!(fetched.metadata["summary"], "about PROJ-1");
    }

    #[tokio::test]
    async fn upsert_overwrites_metadata_wholesale() {
        let store = SqliteStore::in_memory().unwrap();
        let mut node = make_test_node(NodeKind::TrackedItem, "PROJ-1");
        node.metadata.insert("labels".into(), serde_json::json!(["a"]));
        let id1 = store.upsert_node(&node).await.unwrap();

        let mut node = Node::new(NodeKind::TrackedItem, "PROJ-1");
        node.metadata.insert("status".into(), serde_json::json!("Done"));
        let id2 = store.upsert_node(&node).await.unwrap();

        assert_eq!(id1, id2);
        let fetched = store.get_node(id1).await.unwrap().unwrap();
        assert_eq!(fetched.metadata.len(), 1);
        assert_eq!(fetched.metadata["status"], "Done");
    }

    #[tokio::test]
    async fn same_name_different_kind_are_distinct() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store
            .upsert_node(&make_test_node(NodeKind::Technology, "ansible"))
            .await
            .unwrap();
        let b = store
            .upsert_node(&make_test_node(NodeKind::User, "ansible"))
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn find_nodes_by_suffix_escapes_wildcards() {
        let store = SqliteStore::in_memory().unwrap();
        for name in ["acme/api#12", "acme/web#12", "acme/api#112", "acme/x_y#2"] {
            store
                .upsert_node(&make_test_node(NodeKind::ExternalActivity, name))
                .await
                .unwrap();
        }

        let hits = store
            .find_nodes(&NodeFilter {
                kind: Some(NodeKind::ExternalActivity),
                name_suffix: Some("#12".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = hits.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["acme/api#12", "acme/web#12"]);

        let hits = store
            .find_nodes(&NodeFilter {
                name_prefix: Some("acme/x_".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store
            .find_nodes(&NodeFilter {
                name_prefix: Some("acme/%".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn find_nodes_respects_limit() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..5 {
            store
                .upsert_node(&make_test_node(NodeKind::TrackedItem, &format!("P-{i}")))
                .await
                .unwrap();
        }
        let hits = store
            .find_nodes(&NodeFilter {
                kind: Some(NodeKind::TrackedItem),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn ensure_edge_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store
            .upsert_node(&make_test_node(NodeKind::ExternalActivity, "acme/api#1"))
            .await
            .unwrap();
        let b = store
            .upsert_node(&make_test_node(NodeKind::TrackedItem, "PROJ-1"))
            .await
            .unwrap();

        assert!(store.ensure_edge(EdgeKind::Addresses, a, b).await.unwrap());
        assert!(!store.ensure_edge(EdgeKind::Addresses, a, b).await.unwrap());
        assert!(store.ensure_edge(EdgeKind::TrackedIn, b, a).await.unwrap());

        let out = store.edges_from(a, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EdgeKind::Addresses);
        assert_eq!(out[0].target, b);

        let incoming = store.edges_to(a, Some(EdgeKind::TrackedIn)).await.unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(store.stats().await.unwrap().total_edges, 2);
    }

    #[tokio::test]
    async fn ensure_edge_rejects_missing_endpoint() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store
            .upsert_node(&make_test_node(NodeKind::TrackedItem, "PROJ-1"))
            .await
            .unwrap();
        let err = store
            .ensure_edge(EdgeKind::ChildOf, a, NodeId(9999))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NodeNotFound(_))));
        assert_eq!(store.stats().await.unwrap().total_edges, 0);
    }

    #[tokio::test]
    async fn checkpoint_operations() {
        let store = SqliteStore::in_memory().unwrap();

        assert!(store.get_checkpoint("activity_watermark").await.unwrap().is_none());

        store
            .set_checkpoint("activity_watermark", "2024-01-01T00:00:00Z")
            .await
            .unwrap();
        store
            .set_checkpoint("activity_watermark", "2024-01-02T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(
            store
                .get_checkpoint("activity_watermark")
                .await
                .unwrap()
                .unwrap(),
            "2024-01-02T00:00:00Z"
        );

        store.clear_checkpoint("activity_watermark").await.unwrap();
        assert!(store.get_checkpoint("activity_watermark").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_stats() {
        let store = SqliteStore::in_memory().unwrap();
        let p = store
            .upsert_node(&make_test_node(NodeKind::Project, "PROJ"))
            .await
            .unwrap();
        let i = store
            .upsert_node(&make_test_node(NodeKind::TrackedItem, "PROJ-1"))
            .await
            .unwrap();
        store.ensure_edge(EdgeKind::BelongsTo, i, p).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.nodes_by_kind["Project"], 1);
        assert_eq!(stats.edges_by_kind["BELONGS_TO"], 1);
    }

    #[tokio::test]
    async fn reopen_file_store_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert_node(&make_test_node(NodeKind::Organization, "acme"))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let node = store
            .get_node_by_name(NodeKind::Organization, "acme")
            .await
            .unwrap();
        assert!(node.is_some());
        assert!(store.stats().await.unwrap().db_size_bytes > 0);
    }
}
