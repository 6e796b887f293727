//! Binds identifiers extracted from entity text to existing graph nodes.
//!
//! A candidate with no matching node produces no edge and no error. The one
//! exception to "never create the target" is tag nodes (technologies and
//! components), which are created on first mention under a lower-cased name.

use std::collections::HashSet;

use tracing::debug;

use crate::config::CompiledPatterns;
use crate::types::{
    ActivityKind, EdgeKind, Node, NodeFilter, NodeId, NodeKind, SyncReport,
};
use crate::upsert::EntityWriter;

pub struct Resolver<'a> {
    writer: &'a EntityWriter<'a>,
    patterns: &'a CompiledPatterns,
}

impl std::fmt::Debug for Resolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("writer", self.writer)
            .finish_non_exhaustive()
    }
}

impl<'a> Resolver<'a> {
    pub fn new(writer: &'a EntityWriter<'a>, patterns: &'a CompiledPatterns) -> Self {
        Self { writer, patterns }
    }

    /// Resolve every outgoing cross-reference of one stored entity.
    pub async fn resolve(&self, node: &Node, report: &mut SyncReport) -> crate::error::Result<()> {
        match node.kind {
            NodeKind::ExternalActivity => self.resolve_activity(node, report).await,
            NodeKind::TrackedItem => self.resolve_item(node, report).await,
            NodeKind::Repository => self.resolve_repository(node, report).await,
            _ => Ok(()),
        }
    }

    async fn resolve_activity(&self, node: &Node, report: &mut SyncReport) -> crate::error::Result<()> {
        let text = node.text_of(&["title", "body"]);
        let is_change_request = node
            .metadata
            .get("activity_kind")
            .and_then(serde_json::Value::as_str)
            == Some(ActivityKind::ChangeRequest.as_str());
        let (forward, reverse) = if is_change_request {
            (EdgeKind::Implements, EdgeKind::ImplementedIn)
        } else {
            (EdgeKind::Addresses, EdgeKind::TrackedIn)
        };

        for key in self.patterns.tracker_keys.unique_identifiers(Some(&text)) {
            let Some(item) = self.writer.lookup(NodeKind::TrackedItem, &key).await? else {
                continue;
            };
            self.writer
                .link_pair(forward, reverse, node.id, item.id, report)
                .await?;
            debug!(activity = %node.name, item = %key, edge = %forward, "Linked");
        }

        self.link_technologies(node.id, &text, report).await?;
        self.link_repository_components(node.id, report).await
    }

    /// Relate an activity to every component its repository implements.
    async fn link_repository_components(
        &self,
        activity: NodeId,
        report: &mut SyncReport,
    ) -> crate::error::Result<()> {
        for repository in self.writer.targets(activity, EdgeKind::BelongsTo).await? {
            for component in self.writer.targets(repository, EdgeKind::Implements).await? {
                self.writer
                    .link(EdgeKind::RelatesTo, activity, component, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn resolve_item(&self, node: &Node, report: &mut SyncReport) -> crate::error::Result<()> {
        let text = node.text_of(&["summary", "description"]);

        for identifier in self.patterns.activity_refs.unique_identifiers(Some(&text)) {
            for target in self.find_activities(&identifier).await? {
                self.writer
                    .link_pair(
                        EdgeKind::References,
                        EdgeKind::ReferencedBy,
                        node.id,
                        target,
                        report,
                    )
                    .await?;
            }
        }

        self.link_technologies(node.id, &text, report).await?;

        let mut haystack = text.to_lowercase();
        for component in node.string_list("components") {
            haystack.push(' ');
            haystack.push_str(&component.to_lowercase());
        }
        for component in self.patterns.components_in(&haystack) {
            let tag = self
                .writer
                .ensure_node(NodeKind::Component, component, report)
                .await?;
            self.writer
                .link(EdgeKind::Affects, node.id, tag, report)
                .await?;
        }
        Ok(())
    }

    async fn resolve_repository(&self, node: &Node, report: &mut SyncReport) -> crate::error::Result<()> {
        let short_name = node
            .metadata
            .get("short_name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let haystack = format!("{short_name} {}", node.name).to_lowercase();
        for component in self.patterns.components_in(&haystack) {
            let tag = self
                .writer
                .ensure_node(NodeKind::Component, component, report)
                .await?;
            self.writer
                .link(EdgeKind::Implements, node.id, tag, report)
                .await?;
        }
        Ok(())
    }

    async fn link_technologies(
        &self,
        source: NodeId,
        text: &str,
        report: &mut SyncReport,
    ) -> crate::error::Result<()> {
        let mut seen = HashSet::new();
        for candidate in self.patterns.technologies.extract(Some(text)) {
            let name = normalize_tag(&candidate.identifier);
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            let tag = self
                .writer
                .ensure_node(NodeKind::Technology, &name, report)
                .await?;
            self.writer
                .link(EdgeKind::Involves, source, tag, report)
                .await?;
        }
        Ok(())
    }

    /// Activities a reference identifier points at.
    ///
    /// A bare number matches that number in every synchronized repository;
    /// a qualified `org/repo#N` identifier is looked up exactly.
    async fn find_activities(&self, identifier: &str) -> crate::error::Result<Vec<NodeId>> {
        if identifier.contains('#') {
            let node = self
                .writer
                .lookup(NodeKind::ExternalActivity, identifier)
                .await?;
            return Ok(node.into_iter().map(|n| n.id).collect());
        }

        let number = identifier.trim_start_matches('0');
        if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Vec::new());
        }
        let nodes = self
            .writer
            .find(&NodeFilter {
                kind: Some(NodeKind::ExternalActivity),
                name_suffix: Some(format!("#{number}")),
                ..Default::default()
            })
            .await?;
        Ok(nodes.into_iter().map(|n| n.id).collect())
    }
}

/// Lower-cased, trimmed tag name.
pub fn normalize_tag(name: &str) -> String {
    name.trim().to_lowercase()
}
