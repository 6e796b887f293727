use crate::types::{Edge, EdgeKind, Node, NodeFilter, NodeId, NodeKind, StoreStats};

/// The graph store abstraction. Every sync stage reads and writes through this trait.
///
/// Each method is a single atomic call from the engine's point of view.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    // ── Node operations ────────────────────────────────────────────

    /// Insert a node or overwrite the metadata of the existing `(kind, name)` node.
    async fn upsert_node(&self, node: &Node) -> crate::error::Result<NodeId>;

    async fn get_node(&self, id: NodeId) -> crate::error::Result<Option<Node>>;

    /// Get a node by its kind and natural key.
    async fn get_node_by_name(
        &self,
        kind: NodeKind,
        name: &str,
    ) -> crate::error::Result<Option<Node>>;

    /// Find nodes matching a filter, ordered by name.
    async fn find_nodes(&self, filter: &NodeFilter) -> crate::error::Result<Vec<Node>>;

    // ── Edge operations ────────────────────────────────────────────

    /// Ensure a directed edge exists. Returns `true` if it was newly created.
    ///
    /// Fails with [`StoreError::NodeNotFound`](crate::error::StoreError::NodeNotFound)
    /// when either endpoint is missing; no edge is written in that case.
    async fn ensure_edge(
        &self,
        kind: EdgeKind,
        source: NodeId,
        target: NodeId,
    ) -> crate::error::Result<bool>;

    /// Outgoing edges of a node, optionally restricted to one kind.
    async fn edges_from(
        &self,
        source: NodeId,
        kind: Option<EdgeKind>,
    ) -> crate::error::Result<Vec<Edge>>;

    /// Incoming edges of a node, optionally restricted to one kind.
    async fn edges_to(
        &self,
        target: NodeId,
        kind: Option<EdgeKind>,
    ) -> crate::error::Result<Vec<Edge>>;

    // ── Checkpoints ────────────────────────────────────────────────

    async fn get_checkpoint(&self, kind: &str) -> crate::error::Result<Option<String>>;

    async fn set_checkpoint(&self, kind: &str, value: &str) -> crate::error::Result<()>;

    async fn clear_checkpoint(&self, kind: &str) -> crate::error::Result<()>;

    // ── Metrics ────────────────────────────────────────────────────

    async fn stats(&self) -> crate::error::Result<StoreStats>;
}
