//! Core bookmark tree model, path identity and allow-list filtering.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "marksync-core";

/// Separator joining ancestor names into a node path.
///
/// Names are not escaped: a name that itself contains `>>` can produce the same path as a
/// deeper node, and the path alone cannot be split back into ancestors. Depth and ancestry
/// come from `parent_id`, never from splitting a path.
pub const PATH_SEPARATOR: &str = ">>";

/// Microseconds between 1601-01-01 and 1970-01-01, the offset Chrome uses for `date_added`.
pub const WEBKIT_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// One node of a bookmark tree, already validated at the source boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Folder {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date_added: Option<i64>,
        #[serde(default)]
        children: Vec<TreeNode>,
    },
    #[serde(rename = "url")]
    Link {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date_added: Option<i64>,
    },
}

impl TreeNode {
    pub fn folder(name: impl Into<String>, children: Vec<TreeNode>) -> Self {
        Self::Folder {
            name: name.into(),
            date_added: None,
            children,
        }
    }

    pub fn link(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Link {
            name: name.into(),
            url: url.into(),
            date_added: None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Folder { name, .. } | Self::Link { name, .. } => name,
        }
    }

    pub fn date_added(&self) -> Option<i64> {
        match self {
            Self::Folder { date_added, .. } | Self::Link { date_added, .. } => *date_added,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Folder { .. } => ItemKind::Folder,
            Self::Link { .. } => ItemKind::Url,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Folder { .. } => None,
            Self::Link { url, .. } => Some(url),
        }
    }

    pub fn children(&self) -> &[TreeNode] {
        match self {
            Self::Folder { children, .. } => children,
            Self::Link { .. } => &[],
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(TreeNode::node_count).sum::<usize>()
    }

    pub fn link_count(&self) -> usize {
        match self {
            Self::Link { .. } => 1,
            Self::Folder { children, .. } => children.iter().map(TreeNode::link_count).sum(),
        }
    }
}

/// A top-level named group of a source (`bookmark_bar`, `other`, or a flat source's single root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootTree {
    pub label: String,
    pub root: TreeNode,
}

impl RootTree {
    pub fn new(label: impl Into<String>, root: TreeNode) -> Self {
        Self {
            label: label.into(),
            root,
        }
    }
}

/// Ordered set of roots synced together in one run.
pub type Forest = Vec<RootTree>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Folder,
    Url,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Url => "url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(Self::Folder),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

/// Row contents written through an upsert keyed by `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRow {
    pub name: String,
    pub kind: ItemKind,
    pub url: Option<String>,
    pub date_added: Option<i64>,
    pub parent_id: Option<i64>,
    pub source: String,
    pub path: String,
    pub parent_path: Option<String>,
}

impl ItemRow {
    pub fn from_node(
        node: &TreeNode,
        parent_id: Option<i64>,
        parent_path: Option<&str>,
        source: &str,
    ) -> Self {
        Self {
            name: node.name().to_string(),
            kind: node.kind(),
            url: node.url().map(ToString::to_string),
            date_added: node.date_added(),
            parent_id,
            source: source.to_string(),
            path: compute_path(parent_path, node.name()),
            parent_path: parent_path.map(ToString::to_string),
        }
    }
}

/// Persisted row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub url: Option<String>,
    pub date_added: Option<i64>,
    pub parent_id: Option<i64>,
    pub source: String,
    pub path: String,
    pub parent_path: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl StoredItem {
    /// True when writing `row` over this item would not change any synced field.
    pub fn matches_row(&self, row: &ItemRow) -> bool {
        self.name == row.name
            && self.kind == row.kind
            && self.url == row.url
            && self.date_added == row.date_added
            && self.parent_id == row.parent_id
            && self.source == row.source
            && self.path == row.path
            && self.parent_path == row.parent_path
    }
}

/// Identity of a node: its parent's path joined with its own name, or the bare name for roots.
///
/// Renaming or moving a node changes its path, so the store sees a delete plus an insert.
pub fn compute_path(parent_path: Option<&str>, name: &str) -> String {
    match parent_path {
        Some(parent) => format!("{parent}{PATH_SEPARATOR}{name}"),
        None => name.to_string(),
    }
}

/// `None` when the instant does not fit in WebKit microseconds.
pub fn webkit_micros_from_datetime(at: DateTime<Utc>) -> Option<i64> {
    at.timestamp_micros().checked_add(WEBKIT_EPOCH_OFFSET_MICROS)
}

/// `None` for out-of-range input, e.g. a Takeout `add_date` that is not in seconds.
pub fn webkit_micros_from_unix_seconds(secs: i64) -> Option<i64> {
    secs.checked_mul(1_000_000)?
        .checked_add(WEBKIT_EPOCH_OFFSET_MICROS)
}

pub fn datetime_from_webkit_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros.checked_sub(WEBKIT_EPOCH_OFFSET_MICROS)?)
}

/// Prunes a tree down to folders whose names appear in an allow-list.
///
/// A folder survives only when its own name is allowed; branches under a rejected
/// folder are never visited, so an allowed folder nested inside a rejected one is
/// dropped with it. Links survive once their enclosing folder did. Child order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeFilter {
    allowed: BTreeSet<String>,
}

impl TreeFilter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn filter(&self, node: &TreeNode) -> Option<TreeNode> {
        match node {
            TreeNode::Link { name, url, .. } => {
                if name.is_empty() || url.is_empty() {
                    None
                } else {
                    Some(node.clone())
                }
            }
            TreeNode::Folder {
                name,
                date_added,
                children,
            } => {
                if !self.allows(name) {
                    return None;
                }
                Some(TreeNode::Folder {
                    name: name.clone(),
                    date_added: *date_added,
                    children: self.filter_children(children),
                })
            }
        }
    }

    /// Filters a root's descendants without applying the name check to the root itself.
    ///
    /// A root left without children is kept as an empty folder.
    pub fn filter_root(&self, root: &RootTree) -> RootTree {
        let root_node = match &root.root {
            TreeNode::Folder {
                name,
                date_added,
                children,
            } => TreeNode::Folder {
                name: name.clone(),
                date_added: *date_added,
                children: self.filter_children(children),
            },
            link @ TreeNode::Link { .. } => link.clone(),
        };
        RootTree::new(root.label.clone(), root_node)
    }

    pub fn filter_forest(&self, forest: &[RootTree]) -> Forest {
        forest.iter().map(|root| self.filter_root(root)).collect()
    }

    fn filter_children(&self, children: &[TreeNode]) -> Vec<TreeNode> {
        children.iter().filter_map(|child| self.filter(child)).collect()
    }
}
