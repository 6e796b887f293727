//! Parent/child derivation across tracked-item kinds.
//!
//! Links are only drawn between adjacent levels (epic → story, then
//! story → task/bug/subtask), so a bug mentioning both its story and the
//! epic is linked to the story alone.

use crate::types::{ItemKind, Node, NodeId};

/// The slice of a tracked item that hierarchy derivation looks at.
#[derive(Debug, Clone)]
pub struct HierarchyItem {
    pub id: NodeId,
    pub key: String,
    pub kind: ItemKind,
    /// Summary and description.
    pub text: String,
    pub labels: Vec<String>,
}

impl HierarchyItem {
    pub fn from_node(node: &Node) -> Self {
        let kind = node
            .metadata
            .get("issue_type")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| ItemKind::Other(String::new()), ItemKind::parse);
        Self {
            id: node.id,
            key: node.name.clone(),
            kind,
            text: node.text_of(&["summary", "description"]),
            labels: node.string_list("labels"),
        }
    }

    fn mentions(&self, key: &str) -> bool {
        self.text.contains(key) || self.labels.iter().any(|l| l == key)
    }
}

/// A derived `child CHILD_OF parent` relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyLink {
    pub child: NodeId,
    pub parent: NodeId,
}

/// All parent/child pairs, epic level first.
pub fn derive_links(items: &[HierarchyItem]) -> Vec<HierarchyLink> {
    let mut links = Vec::new();
    for parent_level in 0..2u8 {
        let parents = items
            .iter()
            .filter(|i| i.kind.hierarchy_level() == Some(parent_level));
        for parent in parents {
            let children = items.iter().filter(|c| {
                c.kind.hierarchy_level() == Some(parent_level + 1)
                    && c.id != parent.id
                    && c.mentions(&parent.key)
            });
            links.extend(children.map(|c| HierarchyLink {
                child: c.id,
                parent: parent.id,
            }));
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, key: &str, kind: ItemKind, text: &str) -> HierarchyItem {
        HierarchyItem {
            id: NodeId(id),
            key: key.to_string(),
            kind,
            text: text.to_string(),
            labels: vec![],
        }
    }

    #[test]
    fn links_adjacent_levels_only() {
        let items = vec![
            item(1, "P-1", ItemKind::Epic, "Platform epic"),
            item(2, "P-2", ItemKind::Story, "Part of P-1"),
            item(3, "P-3", ItemKind::Bug, "Found in P-2 under P-1"),
        ];
        let links = derive_links(&items);
        assert_eq!(
            links,
            vec![
                HierarchyLink {
                    child: NodeId(2),
                    parent: NodeId(1)
                },
                HierarchyLink {
                    child: NodeId(3),
                    parent: NodeId(2)
                },
            ]
        );
    }

    #[test]
    fn label_mentions_count() {
        let mut task = item(2, "P-2", ItemKind::Subtask, "no text reference");
        task.labels = vec!["P-1".into()];
        let items = vec![item(1, "P-1", ItemKind::Story, "story"), task];
        assert_eq!(derive_links(&items).len(), 1);
    }

    #[test]
    fn unknown_kinds_are_ignored() {
        let items = vec![
            item(1, "P-1", ItemKind::Epic, ""),
            item(2, "P-2", ItemKind::Other("Spike".into()), "P-1"),
        ];
        assert!(derive_links(&items).is_empty());
    }

    #[test]
    fn from_node_reads_metadata() {
        let mut node = Node::new(crate::types::NodeKind::TrackedItem, "P-9");
        node.metadata
            .insert("issue_type".into(), serde_json::json!("Sub-task"));
        node.metadata
            .insert("summary".into(), serde_json::json!("child of P-2"));
        node.metadata
            .insert("labels".into(), serde_json::json!(["P-1"]));
        let h = HierarchyItem::from_node(&node);
        assert_eq!(h.kind, ItemKind::Subtask);
        assert!(h.mentions("P-2"));
        assert!(h.mentions("P-1"));
    }
}
