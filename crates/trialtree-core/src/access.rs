//! Explicit child lookup by index or id.
//!
//! The lookup rules match how rows are usually addressed from experiment
//! markup: integer keys (and string-encoded integers like `"2"` or `"-1"`)
//! are positional, with negative values counting from the end; anything else
//! looks up a direct child by id. Methods never compete with child names —
//! lookup is an ordinary call returning `Option`, not interception.
//!
//! # Example
//!
//! ```
//! use trialtree_core::{StepData, StepTree};
//!
//! let mut tree = StepTree::new();
//! let block = tree.push(tree.root(), Some("block1"), StepData::new())?;
//! tree.push(block, Some("trial1"), StepData::new())?;
//! tree.push(block, Some("trial2"), StepData::new())?;
//!
//! let last = tree.root_ref().get("block1").and_then(|b| b.get(-1)).unwrap();
//! assert_eq!(last.id(), "trial2");
//! assert_eq!(tree.root_ref().get("block1").and_then(|b| b.get("0")).unwrap().id(), "trial1");
//! # Ok::<(), trialtree_core::StepError>(())
//! ```

use crate::data::StepData;
use crate::node::{NodeId, StepTree};

/// A child lookup key: positional index or id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKey<'a> {
    /// Positional index; negative counts from the end (`-1` is the last).
    Index(i64),
    /// Child id, except that a string parsing as an integer is treated as a
    /// positional index.
    Name(&'a str),
}

impl From<i64> for ChildKey<'static> {
    fn from(index: i64) -> Self {
        ChildKey::Index(index)
    }
}

impl From<i32> for ChildKey<'static> {
    fn from(index: i32) -> Self {
        ChildKey::Index(index.into())
    }
}

impl From<usize> for ChildKey<'static> {
    fn from(index: usize) -> Self {
        ChildKey::Index(i64::try_from(index).unwrap_or(i64::MAX))
    }
}

impl<'a> From<&'a str> for ChildKey<'a> {
    fn from(name: &'a str) -> Self {
        ChildKey::Name(name)
    }
}

impl<'a> From<&'a String> for ChildKey<'a> {
    fn from(name: &'a String) -> Self {
        ChildKey::Name(name)
    }
}

impl StepTree {
    /// Looks up a direct child of `node` by [`ChildKey`] rules.
    #[must_use]
    pub fn child<'a>(&self, node: NodeId, key: impl Into<ChildKey<'a>>) -> Option<NodeId> {
        match key.into() {
            ChildKey::Index(index) => self.child_by_position(node, index),
            ChildKey::Name(name) => match name.parse::<i64>() {
                Ok(index) => self.child_by_position(node, index),
                Err(_) => self.child_by_name(node, name),
            },
        }
    }

    fn child_by_position(&self, node: NodeId, index: i64) -> Option<NodeId> {
        let children = self.children(node);
        let len = i64::try_from(children.len()).ok()?;
        let index = if index < 0 { len + index } else { index };
        if (0..len).contains(&index) {
            Some(children[index as usize])
        } else {
            None
        }
    }

    fn child_by_name(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.children(node)
            .iter()
            .copied()
            .find(|&child| self.id(child) == name)
    }

    /// A borrowed view of `node` for chained reads.
    #[must_use]
    pub fn node_ref(&self, node: NodeId) -> NodeRef<'_> {
        NodeRef { tree: self, node }
    }

    /// [`node_ref`](Self::node_ref) of the root.
    #[must_use]
    pub fn root_ref(&self) -> NodeRef<'_> {
        self.node_ref(self.root())
    }
}

/// A read-only view pairing a tree borrow with a node handle, so lookups can
/// chain without re-threading the tree.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'t> {
    tree: &'t StepTree,
    node: NodeId,
}

impl<'t> NodeRef<'t> {
    /// The underlying handle.
    #[must_use]
    pub fn handle(self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn id(self) -> &'t str {
        self.tree.id(self.node)
    }

    #[must_use]
    pub fn path_string(self) -> String {
        self.tree.path_string(self.node)
    }

    #[must_use]
    pub fn data(self) -> &'t StepData {
        self.tree.data(self.node)
    }

    #[must_use]
    pub fn child_count(self) -> usize {
        self.tree.child_count(self.node)
    }

    #[must_use]
    pub fn is_leaf(self) -> bool {
        self.tree.is_leaf(self.node)
    }

    #[must_use]
    pub fn depth(self) -> usize {
        self.tree.depth(self.node)
    }

    /// Child lookup by [`ChildKey`] rules.
    #[must_use]
    pub fn get<'a>(self, key: impl Into<ChildKey<'a>>) -> Option<NodeRef<'t>> {
        self.tree
            .child(self.node, key)
            .map(|child| self.tree.node_ref(child))
    }

    /// Views of the direct children, in order.
    pub fn children(self) -> impl Iterator<Item = NodeRef<'t>> {
        self.tree
            .children(self.node)
            .iter()
            .map(move |&child| self.tree.node_ref(child))
    }
}
