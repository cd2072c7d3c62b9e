//! The hierarchical step tree.
//!
//! Every node owns an ordered list of children plus a cursor selecting one of
//! them; following cursors from the root designates the **current leaf** — the
//! trial a participant currently sees. Nodes live in a slab-style arena and
//! are addressed by copyable [`NodeId`] handles, so subtrees can be cleared
//! and rebuilt without reference juggling.
//!
//! Navigation is O(depth): [`next`](StepTree::next) advances the deepest
//! cursor first and carries into the next sibling subtree when one is
//! exhausted, exactly mirroring how a nested experiment runs (all trials of
//! block one, then all trials of block two, ...).
//!
//! # Example
//!
//! ```
//! use trialtree_core::{StepData, StepTree};
//!
//! let mut tree = StepTree::new();
//! let block = tree.push(tree.root(), Some("block1"), StepData::new())?;
//! tree.push(block, Some("trial1"), StepData::new().with("color", "red"))?;
//! tree.push(block, Some("trial2"), StepData::new().with("color", "blue"))?;
//!
//! let first = tree.next().unwrap();
//! assert_eq!(tree.path_string(first), "block1/trial1");
//! let second = tree.next().unwrap();
//! assert_eq!(tree.path_string(second), "block1/trial2");
//! assert_eq!(tree.next(), None);
//! # Ok::<(), trialtree_core::StepError>(())
//! ```

use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::data::StepData;
use crate::error::{Result, StepError};

/// Reserved id of the synthetic root. Never appears inside paths.
pub const ROOT_ID: &str = "/";

/// Separator joining ids into path strings; forbidden inside ids.
pub const PATH_SEPARATOR: char = '/';

// =============================================================================
// Handles and nodes
// =============================================================================

/// Copyable handle to a node in a [`StepTree`] arena.
///
/// Handles stay valid until the node is removed by a clear operation. Using a
/// handle after its node was cleared, or against a different tree, is a
/// caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    cursor: usize,
    depth: usize,
    data: StepData,
    shuffled: bool,
}

impl Node {
    fn new(id: String, parent: Option<NodeId>, depth: usize, data: StepData) -> Self {
        Node {
            id,
            parent,
            children: Vec::new(),
            cursor: 0,
            depth,
            data,
            shuffled: false,
        }
    }
}

// =============================================================================
// StepTree
// =============================================================================

/// A tree-structured state machine over experiment steps.
///
/// A fresh (or [`reset`](Self::reset)) tree is *not started*: its cursor
/// chain already points at the leftmost leaf, and the first call to
/// [`next`](Self::next) enters that leaf instead of advancing past it. After
/// N leaves have been visited, further calls return `None` and the cursors
/// stay clamped on the last leaf.
#[derive(Debug, Clone)]
pub struct StepTree {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    root: NodeId,
    started: bool,
}

impl Default for StepTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTree {
    /// An empty tree holding only the synthetic root.
    #[must_use]
    pub fn new() -> Self {
        let root = Node::new(ROOT_ID.to_owned(), None, 0, StepData::new());
        StepTree {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
            started: false,
        }
    }

    /// Handle of the synthetic root.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Whether `id` currently names a live node of this tree.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(Option::is_some)
    }

    /// Number of live nodes, the root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Whether any leaf has been consumed since the last reset.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[track_caller]
    fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.index()).and_then(Option::as_ref) {
            Some(node) => node,
            None => panic!("{id:?} does not belong to this tree (or was cleared)"),
        }
    }

    #[track_caller]
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("{id:?} does not belong to this tree (or was cleared)"),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                assert!(self.nodes.len() < u32::MAX as usize, "node arena exhausted");
                let slot = self.nodes.len() as u32;
                self.nodes.push(Some(node));
                NodeId(slot)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Appends a child under `parent` and returns its handle.
    ///
    /// With `id: None` the child gets an auto id: the current sibling count in
    /// decimal, bumped past any explicitly taken name so sibling ids (and
    /// therefore paths) stay unique.
    ///
    /// # Errors
    ///
    /// [`StepError::DuplicateId`] if `id` already names a sibling,
    /// [`StepError::InvalidId`] if it contains the path separator.
    pub fn push(&mut self, parent: NodeId, id: Option<&str>, data: StepData) -> Result<NodeId> {
        self.insert(parent, id, -1, data)
    }

    /// Inserts a child under `parent` at `index`.
    ///
    /// Negative indices count from the end in splice style: `-1` appends,
    /// `-2` inserts before the last child, and so on. Out-of-range positions
    /// clamp to the valid range. When the tree is started, the parent cursor
    /// keeps pointing at the same child it pointed at before.
    ///
    /// # Errors
    ///
    /// See [`push`](Self::push).
    pub fn insert(
        &mut self,
        parent: NodeId,
        id: Option<&str>,
        index: i64,
        data: StepData,
    ) -> Result<NodeId> {
        let len = self.node(parent).children.len();
        let id = match id {
            Some(explicit) => {
                if explicit.contains(PATH_SEPARATOR) {
                    return Err(StepError::InvalidId {
                        id: explicit.to_owned(),
                    });
                }
                if self.child_position_by_id(parent, explicit).is_some() {
                    return Err(StepError::DuplicateId {
                        parent: self.display_path(parent),
                        id: explicit.to_owned(),
                    });
                }
                explicit.to_owned()
            }
            None => {
                let mut n = len;
                let mut candidate = n.to_string();
                while self.child_position_by_id(parent, &candidate).is_some() {
                    n += 1;
                    candidate = n.to_string();
                }
                candidate
            }
        };

        let position = splice_position(index, len);
        let depth = self.node(parent).depth + 1;
        let child = self.alloc(Node::new(id, Some(parent), depth, data));

        let started = self.started;
        let parent_node = self.node_mut(parent);
        let keep_cursor_on_child = started && len > 0 && position <= parent_node.cursor;
        parent_node.children.insert(position, child);
        if keep_cursor_on_child {
            parent_node.cursor += 1;
        }
        Ok(child)
    }

    /// Renames a node in place. Paths through it change accordingly.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidId`] if the new id contains the separator,
    /// [`StepError::DuplicateId`] if a sibling already uses it.
    pub fn rename(&mut self, node: NodeId, id: &str) -> Result<()> {
        if self.node(node).id == id {
            return Ok(());
        }
        if id.contains(PATH_SEPARATOR) {
            return Err(StepError::InvalidId { id: id.to_owned() });
        }
        if let Some(parent) = self.node(node).parent {
            if self.child_position_by_id(parent, id).is_some() {
                return Err(StepError::DuplicateId {
                    parent: self.display_path(parent),
                    id: id.to_owned(),
                });
            }
        }
        self.node_mut(node).id = id.to_owned();
        Ok(())
    }

    /// Deep-copies the subtree at `source` as a new child of `parent`.
    ///
    /// Data and shuffled flags are copied; cursors in the copy start at 0.
    /// With `id: None` the copy gets a fresh auto id; nested nodes keep
    /// their original ids (unique within the copy by construction).
    ///
    /// # Errors
    ///
    /// As [`push`](Self::push) for the top-level id.
    pub fn copy_subtree(
        &mut self,
        source: NodeId,
        parent: NodeId,
        id: Option<&str>,
    ) -> Result<NodeId> {
        // Capture before pushing so copying a node under itself snapshots
        // the original child list.
        let children = self.children(source).to_vec();
        let data = self.data(source).clone();
        let shuffled = self.is_shuffled(source);
        let copy = self.push(parent, id, data)?;
        self.set_shuffled(copy, shuffled);
        for child in children {
            let child_id = self.id(child).to_owned();
            self.copy_subtree(child, copy, Some(&child_id))?;
        }
        Ok(copy)
    }

    // -------------------------------------------------------------------------
    // Plain accessors
    // -------------------------------------------------------------------------

    /// The node's id (the root reports `"/"`).
    #[must_use]
    pub fn id(&self, node: NodeId) -> &str {
        &self.node(node).id
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    /// Direct children, in order.
    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.node(node).children
    }

    /// Direct child count.
    #[must_use]
    pub fn child_count(&self, node: NodeId) -> usize {
        self.node(node).children.len()
    }

    #[must_use]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.node(node).children.is_empty()
    }

    /// Distance from the root (root is 0).
    #[must_use]
    pub fn depth(&self, node: NodeId) -> usize {
        self.node(node).depth
    }

    /// Index of the selected child. Meaningless for leaves (always 0).
    #[must_use]
    pub fn cursor(&self, node: NodeId) -> usize {
        self.node(node).cursor
    }

    /// Whether this node's children have been shuffled since the last clear.
    #[must_use]
    pub fn is_shuffled(&self, node: NodeId) -> bool {
        self.node(node).shuffled
    }

    #[must_use]
    pub fn data(&self, node: NodeId) -> &StepData {
        &self.node(node).data
    }

    pub fn data_mut(&mut self, node: NodeId) -> &mut StepData {
        &mut self.node_mut(node).data
    }

    pub fn set_data(&mut self, node: NodeId, data: StepData) {
        self.node_mut(node).data = data;
    }

    /// Position of `node` among its siblings, `None` for the root.
    #[must_use]
    pub fn sibling_index(&self, node: NodeId) -> Option<usize> {
        let parent = self.node(node).parent?;
        self.node(parent).children.iter().position(|&c| c == node)
    }

    /// Absolute depth of the deepest leaf in this subtree.
    #[must_use]
    pub fn tree_depth(&self, node: NodeId) -> usize {
        let n = self.node(node);
        n.children
            .iter()
            .map(|&child| self.tree_depth(child))
            .max()
            .unwrap_or(n.depth)
    }

    /// Whether `node` is the leftmost leaf of the whole tree.
    #[must_use]
    pub fn is_first_leaf(&self, node: NodeId) -> bool {
        if !self.is_leaf(node) {
            return false;
        }
        let mut current = node;
        while let Some(parent) = self.node(current).parent {
            if self.node(parent).children.first() != Some(&current) {
                return false;
            }
            current = parent;
        }
        true
    }

    fn child_position_by_id(&self, parent: NodeId, id: &str) -> Option<usize> {
        self.node(parent)
            .children
            .iter()
            .position(|&child| self.node(child).id == id)
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    /// Ids from the root down to `node`, root excluded.
    #[must_use]
    pub fn path(&self, node: NodeId) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = node;
        while let Some(parent) = self.node(current).parent {
            segments.push(self.node(current).id.clone());
            current = parent;
        }
        segments.reverse();
        segments
    }

    /// The path joined with `/`. The root itself reports an empty string.
    #[must_use]
    pub fn path_string(&self, node: NodeId) -> String {
        self.path(node).join("/")
    }

    fn display_path(&self, node: NodeId) -> String {
        if self.node(node).parent.is_none() {
            ROOT_ID.to_owned()
        } else {
            self.path_string(node)
        }
    }

    /// Leaves of the subtree in depth-first order. A childless node is its
    /// own (single) leaf.
    #[must_use]
    pub fn leaf_ids(&self, node: NodeId) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        self.collect_leaves(node, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, node: NodeId, out: &mut Vec<NodeId>) {
        let children = &self.node(node).children;
        if children.is_empty() {
            out.push(node);
            return;
        }
        for &child in children {
            self.collect_leaves(child, out);
        }
    }

    /// Path strings of the subtree's leaves, in traversal order.
    #[must_use]
    pub fn leaf_paths(&self, node: NodeId) -> Vec<String> {
        self.leaf_ids(node)
            .into_iter()
            .map(|leaf| self.path_string(leaf))
            .collect()
    }

    #[must_use]
    pub fn leaf_count(&self, node: NodeId) -> usize {
        self.leaf_ids(node).len()
    }

    /// The set of leaf paths under `node`, excluding `node` itself.
    ///
    /// A bare node yields an empty set, not a set containing its own path,
    /// so scripts can ask "what rows exist already" before populating.
    #[must_use]
    pub fn existing_paths(&self, node: NodeId) -> HashSet<String> {
        self.leaf_ids(node)
            .into_iter()
            .filter(|&leaf| leaf != node)
            .map(|leaf| self.path_string(leaf))
            .collect()
    }

    /// Resolves a slash-joined path to a node handle.
    ///
    /// Empty segments (leading slash, doubled slashes) are skipped, so
    /// `"/block1/trial2"` and `"block1/trial2"` are equivalent.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] naming the first segment that matched no
    /// child.
    pub fn resolve_path(&self, path: &str) -> Result<NodeId> {
        let mut node = self.root;
        for segment in path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()) {
            match self.child_position_by_id(node, segment) {
                Some(position) => node = self.node(node).children[position],
                None => {
                    return Err(StepError::InvalidPath {
                        path: path.to_owned(),
                        segment: segment.to_owned(),
                    });
                }
            }
        }
        Ok(node)
    }

    /// Like [`resolve_path`](Self::resolve_path), but `None` on a miss.
    #[must_use]
    pub fn node_at_path(&self, path: &str) -> Option<NodeId> {
        self.resolve_path(path).ok()
    }

    /// Replaces the data of the node addressed by `path`.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] if the path does not resolve.
    pub fn set_data_at_path(&mut self, path: &str, data: StepData) -> Result<NodeId> {
        let node = self.resolve_path(path)?;
        self.set_data(node, data);
        Ok(node)
    }

    /// Non-empty data records along the node's root-to-leaf line: ancestors
    /// first (root excluded), then the node, then its selected descendants
    /// down to the current leaf of the subtree.
    #[must_use]
    pub fn data_along_path(&self, node: NodeId) -> Vec<&StepData> {
        let mut line = Vec::new();
        let mut current = node;
        while let Some(parent) = self.node(current).parent {
            line.push(current);
            current = parent;
        }
        line.reverse();
        // Continue below `node` through the cursor chain.
        let mut current = node;
        while !self.node(current).children.is_empty() {
            let n = self.node(current);
            current = n.children[n.cursor];
            line.push(current);
        }
        line.into_iter()
            .map(|id| &self.node(id).data)
            .filter(|data| !data.is_empty())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Navigation
    // -------------------------------------------------------------------------

    /// The leaf the cursor chain currently designates.
    #[must_use]
    pub fn current_leaf(&self) -> NodeId {
        let mut node = self.root;
        loop {
            let n = self.node(node);
            if n.children.is_empty() {
                return node;
            }
            node = n.children[n.cursor];
        }
    }

    #[must_use]
    pub fn current_path(&self) -> Vec<String> {
        self.path(self.current_leaf())
    }

    #[must_use]
    pub fn current_path_string(&self) -> String {
        self.path_string(self.current_leaf())
    }

    #[must_use]
    pub fn current_data(&self) -> &StepData {
        self.data(self.current_leaf())
    }

    /// Position of the current leaf among its siblings ("trial m of this
    /// block"). `None` when the tree has no steps at all.
    #[must_use]
    pub fn block_index(&self) -> Option<usize> {
        let leaf = self.current_leaf();
        let parent = self.node(leaf).parent?;
        Some(self.node(parent).cursor)
    }

    /// Sibling count of the current leaf ("of n"). Zero for a bare root.
    #[must_use]
    pub fn block_length(&self) -> usize {
        let leaf = self.current_leaf();
        match self.node(leaf).parent {
            Some(parent) => self.node(parent).children.len(),
            None => 0,
        }
    }

    /// Advances to the next leaf and returns it, or `None` once the sequence
    /// is exhausted (cursors stay clamped on the last leaf).
    ///
    /// The first call on a fresh or reset tree *enters* the current leaf
    /// rather than moving past it, so a tree with N leaves yields exactly N
    /// leaves before the first `None`.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<NodeId> {
        if !self.started {
            if self.node(self.root).children.is_empty() {
                return None;
            }
            self.started = true;
            return Some(self.current_leaf());
        }
        self.advance(self.root)
    }

    /// Steps back to the previous leaf, or `None` at the first leaf (and on
    /// a tree nothing has been consumed from).
    pub fn prev(&mut self) -> Option<NodeId> {
        if !self.started {
            return None;
        }
        self.retreat(self.root)
    }

    /// Whether another leaf remains ahead of the current one.
    #[must_use]
    pub fn has_next(&self) -> bool {
        if !self.started {
            return !self.node(self.root).children.is_empty();
        }
        self.has_next_below(self.root)
    }

    /// Whether a leaf lies behind the current one.
    #[must_use]
    pub fn has_prev(&self) -> bool {
        self.started && self.has_prev_below(self.root)
    }

    /// What [`next`](Self::next) would return, with no observable change:
    /// every cursor and the started flag are restored afterwards.
    pub fn peek_next(&mut self) -> Option<NodeId> {
        let saved = self.cursor_snapshot();
        let result = self.next();
        self.restore_cursor_snapshot(saved);
        result
    }

    /// What [`prev`](Self::prev) would return, with no observable change.
    pub fn peek_prev(&mut self) -> Option<NodeId> {
        let saved = self.cursor_snapshot();
        let result = self.prev();
        self.restore_cursor_snapshot(saved);
        result
    }

    /// Zeroes every cursor and marks the tree not started.
    pub fn reset(&mut self) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.cursor = 0;
        }
        self.started = false;
    }

    /// Jumps to the node at `path`: resets the tree, walks the path setting
    /// each cursor, then descends to the leftmost leaf below the target.
    /// Returns the leaf landed on; the tree counts as started.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] if a segment matches no child; the tree is
    /// left fully reset in that case.
    pub fn go_to(&mut self, path: &str) -> Result<NodeId> {
        let segments: Vec<&str> = path
            .split(PATH_SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();
        self.go_to_segments(&segments)
    }

    /// [`go_to`](Self::go_to) with pre-split segments.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] if a segment matches no child.
    pub fn go_to_segments<S: AsRef<str>>(&mut self, segments: &[S]) -> Result<NodeId> {
        self.reset();
        let mut node = self.root;
        for segment in segments {
            let segment = segment.as_ref();
            match self.child_position_by_id(node, segment) {
                Some(position) => {
                    self.node_mut(node).cursor = position;
                    node = self.node(node).children[position];
                }
                None => {
                    let path = segments
                        .iter()
                        .map(AsRef::as_ref)
                        .collect::<Vec<_>>()
                        .join("/");
                    self.reset();
                    return Err(StepError::InvalidPath {
                        path,
                        segment: segment.to_owned(),
                    });
                }
            }
        }
        let leaf = self.descend_first(node);
        self.started = true;
        Ok(leaf)
    }

    fn advance(&mut self, node: NodeId) -> Option<NodeId> {
        let (len, cursor) = {
            let n = self.node(node);
            (n.children.len(), n.cursor)
        };
        if len == 0 {
            return None;
        }
        let selected = self.node(node).children[cursor];
        if let Some(leaf) = self.advance(selected) {
            return Some(leaf);
        }
        if cursor + 1 < len {
            self.node_mut(node).cursor = cursor + 1;
            let entered = self.node(node).children[cursor + 1];
            Some(self.descend_first(entered))
        } else {
            None
        }
    }

    fn retreat(&mut self, node: NodeId) -> Option<NodeId> {
        let (len, cursor) = {
            let n = self.node(node);
            (n.children.len(), n.cursor)
        };
        if len == 0 {
            return None;
        }
        let selected = self.node(node).children[cursor];
        if let Some(leaf) = self.retreat(selected) {
            return Some(leaf);
        }
        if cursor > 0 {
            self.node_mut(node).cursor = cursor - 1;
            let entered = self.node(node).children[cursor - 1];
            Some(self.descend_last(entered))
        } else {
            None
        }
    }

    fn descend_first(&mut self, node: NodeId) -> NodeId {
        let mut current = node;
        loop {
            let first = {
                let n = self.node_mut(current);
                n.cursor = 0;
                n.children.first().copied()
            };
            match first {
                Some(child) => current = child,
                None => return current,
            }
        }
    }

    fn descend_last(&mut self, node: NodeId) -> NodeId {
        let mut current = node;
        loop {
            let last = {
                let n = self.node_mut(current);
                n.cursor = n.children.len().saturating_sub(1);
                n.children.last().copied()
            };
            match last {
                Some(child) => current = child,
                None => return current,
            }
        }
    }

    fn has_next_below(&self, node: NodeId) -> bool {
        let n = self.node(node);
        if n.children.is_empty() {
            return false;
        }
        if n.cursor + 1 < n.children.len() {
            return true;
        }
        self.has_next_below(n.children[n.cursor])
    }

    fn has_prev_below(&self, node: NodeId) -> bool {
        let n = self.node(node);
        if n.children.is_empty() {
            return false;
        }
        if n.cursor > 0 {
            return true;
        }
        self.has_prev_below(n.children[n.cursor])
    }

    fn cursor_snapshot(&self) -> (Vec<usize>, bool) {
        let cursors = self
            .nodes
            .iter()
            .map(|slot| slot.as_ref().map_or(0, |n| n.cursor))
            .collect();
        (cursors, self.started)
    }

    fn restore_cursor_snapshot(&mut self, (cursors, started): (Vec<usize>, bool)) {
        for (slot, cursor) in self.nodes.iter_mut().zip(cursors) {
            if let Some(node) = slot {
                node.cursor = cursor;
            }
        }
        self.started = started;
    }

    // -------------------------------------------------------------------------
    // Shuffling
    // -------------------------------------------------------------------------

    /// Fisher–Yates shuffle of `node`'s direct children (grandchildren keep
    /// their internal order). Sets the node's shuffled flag. The cursor
    /// follows the child it pointed at, so the current leaf is unchanged.
    pub fn shuffle_children<R: Rng + ?Sized>(&mut self, node: NodeId, rng: &mut R) {
        {
            let n = self.node_mut(node);
            if n.children.len() > 1 {
                let tracked = n.children[n.cursor];
                n.children.shuffle(rng);
                n.cursor = n
                    .children
                    .iter()
                    .position(|&child| child == tracked)
                    .unwrap_or(0);
            }
            n.shuffled = true;
        }
        tracing::debug!(
            node = %self.display_path(node),
            children = self.node(node).children.len(),
            "shuffled children"
        );
    }

    // -------------------------------------------------------------------------
    // Clearing
    // -------------------------------------------------------------------------

    /// Clears both the subtree below `node` and the node's own data.
    pub fn clear(&mut self, node: NodeId) {
        self.clear_subtree(node);
        self.clear_data(node);
    }

    /// Removes every descendant of `node` (their handles become invalid and
    /// their arena slots are reused), zeroes its cursor, and clears its
    /// shuffled flag. The node's own data is kept.
    pub fn clear_subtree(&mut self, node: NodeId) {
        let children = std::mem::take(&mut self.node_mut(node).children);
        for child in children {
            self.release_subtree(child);
        }
        let n = self.node_mut(node);
        n.cursor = 0;
        n.shuffled = false;
    }

    /// Clears the node's own data record only.
    pub fn clear_data(&mut self, node: NodeId) {
        self.node_mut(node).data = StepData::new();
    }

    fn release_subtree(&mut self, node: NodeId) {
        let children = std::mem::take(&mut self.node_mut(node).children);
        for child in children {
            self.release_subtree(child);
        }
        self.nodes[node.index()] = None;
        self.free.push(node.0);
    }

    // -------------------------------------------------------------------------
    // Snapshot restore hooks (validated by the snapshot module before use)
    // -------------------------------------------------------------------------

    pub(crate) fn set_cursor(&mut self, node: NodeId, cursor: usize) {
        self.node_mut(node).cursor = cursor;
    }

    pub(crate) fn set_shuffled(&mut self, node: NodeId, shuffled: bool) {
        self.node_mut(node).shuffled = shuffled;
    }

    pub(crate) fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    pub(crate) fn set_root_id(&mut self, id: String) {
        let root = self.root;
        self.node_mut(root).id = id;
    }

    // -------------------------------------------------------------------------
    // Diagram
    // -------------------------------------------------------------------------

    /// Renders the tree with box-drawing guides. Nodes on the current cursor
    /// chain are marked with `*`.
    ///
    /// ```text
    /// /
    /// ├── block1
    /// │   ├── trial1 *
    /// │   └── trial2
    /// └── block2
    ///     └── trial3
    /// ```
    #[must_use]
    pub fn tree_diagram(&self) -> String {
        let mut out = String::from(ROOT_ID);
        out.push('\n');
        self.diagram_children(self.root, "", true, &mut out);
        out
    }

    fn diagram_children(&self, node: NodeId, prefix: &str, on_chain: bool, out: &mut String) {
        let count = self.node(node).children.len();
        let cursor = self.node(node).cursor;
        for position in 0..count {
            let child = self.node(node).children[position];
            let last = position + 1 == count;
            let child_on_chain = on_chain && position == cursor;
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(&self.node(child).id);
            if child_on_chain {
                out.push_str(" *");
            }
            out.push('\n');
            let deeper = format!("{prefix}{}", if last { "    " } else { "│   " });
            self.diagram_children(child, &deeper, child_on_chain, out);
        }
    }
}

fn splice_position(index: i64, len: usize) -> usize {
    let len = len as i64;
    let position = if index < 0 { len + index + 1 } else { index };
    position.clamp(0, len) as usize
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StepValue;
    use crate::rng::rng_from_seed;

    /// root -> block1 { trial1, trial2 }, block2 { trial3 }
    fn simple_tree() -> StepTree {
        let mut tree = StepTree::new();
        let block1 = tree
            .push(tree.root(), Some("block1"), StepData::new())
            .unwrap();
        tree.push(block1, Some("trial1"), StepData::new()).unwrap();
        tree.push(block1, Some("trial2"), StepData::new()).unwrap();
        let block2 = tree
            .push(tree.root(), Some("block2"), StepData::new())
            .unwrap();
        tree.push(block2, Some("trial3"), StepData::new()).unwrap();
        tree
    }

    #[test]
    fn auto_ids_count_siblings() {
        let mut tree = StepTree::new();
        let a = tree.push(tree.root(), None, StepData::new()).unwrap();
        let b = tree.push(tree.root(), None, StepData::new()).unwrap();
        assert_eq!(tree.id(a), "0");
        assert_eq!(tree.id(b), "1");
    }

    #[test]
    fn auto_ids_skip_taken_names() {
        let mut tree = StepTree::new();
        tree.push(tree.root(), Some("1"), StepData::new()).unwrap();
        let a = tree.push(tree.root(), None, StepData::new()).unwrap();
        assert_eq!(tree.id(a), "2");
        let paths = tree.leaf_paths(tree.root());
        assert_eq!(paths, ["1", "2"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut tree = StepTree::new();
        tree.push(tree.root(), Some("block"), StepData::new())
            .unwrap();
        let err = tree
            .push(tree.root(), Some("block"), StepData::new())
            .unwrap_err();
        assert!(matches!(err, StepError::DuplicateId { .. }));
    }

    #[test]
    fn slash_in_id_is_rejected() {
        let mut tree = StepTree::new();
        let err = tree
            .push(tree.root(), Some("a/b"), StepData::new())
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidId { .. }));
    }

    #[test]
    fn negative_insert_indices_count_from_the_end() {
        let mut tree = StepTree::new();
        tree.push(tree.root(), Some("a"), StepData::new()).unwrap();
        tree.push(tree.root(), Some("c"), StepData::new()).unwrap();
        // -2 inserts before the last child.
        tree.insert(tree.root(), Some("b"), -2, StepData::new())
            .unwrap();
        assert_eq!(tree.leaf_paths(tree.root()), ["a", "b", "c"]);
    }

    #[test]
    fn far_negative_insert_clamps_to_front() {
        let mut tree = StepTree::new();
        tree.push(tree.root(), Some("a"), StepData::new()).unwrap();
        tree.insert(tree.root(), Some("first"), -5, StepData::new())
            .unwrap();
        assert_eq!(tree.leaf_paths(tree.root()), ["first", "a"]);
    }

    #[test]
    fn out_of_range_insert_clamps_to_end() {
        let mut tree = StepTree::new();
        tree.push(tree.root(), Some("a"), StepData::new()).unwrap();
        tree.insert(tree.root(), Some("z"), 99, StepData::new())
            .unwrap();
        assert_eq!(tree.leaf_paths(tree.root()), ["a", "z"]);
    }

    #[test]
    fn paths_join_ids_without_the_root() {
        let tree = simple_tree();
        let trial2 = tree.node_at_path("block1/trial2").unwrap();
        assert_eq!(tree.path(trial2), ["block1", "trial2"]);
        assert_eq!(tree.path_string(trial2), "block1/trial2");
        assert_eq!(tree.path_string(tree.root()), "");
    }

    #[test]
    fn leaf_paths_are_in_traversal_order() {
        let tree = simple_tree();
        assert_eq!(
            tree.leaf_paths(tree.root()),
            ["block1/trial1", "block1/trial2", "block2/trial3"]
        );
        assert_eq!(tree.leaf_count(tree.root()), 3);
    }

    #[test]
    fn existing_paths_exclude_the_node_itself() {
        let tree = StepTree::new();
        assert!(tree.existing_paths(tree.root()).is_empty());
        let tree = simple_tree();
        let paths = tree.existing_paths(tree.root());
        assert_eq!(paths.len(), 3);
        assert!(paths.contains("block2/trial3"));
    }

    #[test]
    fn first_next_enters_the_first_leaf() {
        let mut tree = simple_tree();
        let first = tree.next().unwrap();
        assert_eq!(tree.path_string(first), "block1/trial1");
        assert!(tree.is_started());
    }

    #[test]
    fn next_visits_every_leaf_exactly_once_then_yields_none() {
        let mut tree = simple_tree();
        let mut visited = Vec::new();
        while let Some(leaf) = tree.next() {
            visited.push(tree.path_string(leaf));
        }
        assert_eq!(
            visited,
            ["block1/trial1", "block1/trial2", "block2/trial3"]
        );
        assert_eq!(tree.next(), None);
        // Cursors stay clamped on the last leaf.
        assert_eq!(tree.current_path_string(), "block2/trial3");
    }

    #[test]
    fn prev_walks_back_in_reverse_order() {
        let mut tree = simple_tree();
        while tree.next().is_some() {}
        let mut visited = Vec::new();
        while let Some(leaf) = tree.prev() {
            visited.push(tree.path_string(leaf));
        }
        assert_eq!(visited, ["block1/trial2", "block1/trial1"]);
        assert_eq!(tree.current_path_string(), "block1/trial1");
    }

    #[test]
    fn prev_on_a_fresh_tree_yields_none() {
        let mut tree = simple_tree();
        assert_eq!(tree.prev(), None);
        assert!(!tree.has_prev());
        assert_eq!(tree.current_path_string(), "block1/trial1");
    }

    #[test]
    fn empty_tree_never_starts() {
        let mut tree = StepTree::new();
        assert_eq!(tree.next(), None);
        assert_eq!(tree.prev(), None);
        assert!(!tree.has_next());
        assert!(!tree.has_prev());
    }

    #[test]
    fn has_next_matches_navigation() {
        let mut tree = simple_tree();
        assert!(tree.has_next());
        tree.next();
        tree.next();
        assert!(tree.has_next());
        tree.next();
        assert!(!tree.has_next());
        assert!(tree.has_prev());
    }

    #[test]
    fn peek_has_no_observable_effect() {
        let mut tree = simple_tree();
        tree.next();
        let before = (tree.current_path_string(), tree.is_started());
        let peeked = tree.peek_next().unwrap();
        assert_eq!(tree.path_string(peeked), "block1/trial2");
        assert_eq!((tree.current_path_string(), tree.is_started()), before);
        // Peeking on a fresh tree must not start it either.
        let mut fresh = simple_tree();
        let entered = fresh.peek_next().unwrap();
        assert_eq!(fresh.path_string(entered), "block1/trial1");
        assert!(!fresh.is_started());
        assert_eq!(fresh.peek_prev(), None);
    }

    #[test]
    fn peek_prev_mirrors_prev() {
        let mut tree = simple_tree();
        tree.next();
        tree.next();
        let peeked = tree.peek_prev().unwrap();
        assert_eq!(tree.path_string(peeked), "block1/trial1");
        assert_eq!(tree.current_path_string(), "block1/trial2");
    }

    #[test]
    fn next_then_prev_returns_to_the_same_leaf() {
        let mut tree = simple_tree();
        tree.next();
        tree.next();
        let here = tree.current_path_string();
        tree.next();
        tree.prev();
        assert_eq!(tree.current_path_string(), here);
    }

    #[test]
    fn reset_rewinds_and_unstarts() {
        let mut tree = simple_tree();
        while tree.next().is_some() {}
        tree.reset();
        assert!(!tree.is_started());
        assert!(!tree.has_prev());
        assert_eq!(tree.current_path_string(), "block1/trial1");
        // The walk replays from the top.
        let first = tree.next().unwrap();
        assert_eq!(tree.path_string(first), "block1/trial1");
    }

    #[test]
    fn go_to_lands_on_the_leftmost_leaf_below_the_target() {
        let mut tree = simple_tree();
        let leaf = tree.go_to("block2").unwrap();
        assert_eq!(tree.path_string(leaf), "block2/trial3");
        assert!(tree.is_started());
        // Navigation continues from there.
        assert_eq!(tree.next(), None);
        assert!(tree.has_prev());
    }

    #[test]
    fn go_to_accepts_leading_slash_and_segments() {
        let mut tree = simple_tree();
        let leaf = tree.go_to("/block1/trial2").unwrap();
        assert_eq!(tree.path_string(leaf), "block1/trial2");
        let leaf = tree.go_to_segments(&["block1", "trial1"]).unwrap();
        assert_eq!(tree.path_string(leaf), "block1/trial1");
    }

    #[test]
    fn go_to_unknown_segment_fails_and_resets() {
        let mut tree = simple_tree();
        tree.next();
        tree.next();
        let err = tree.go_to("block1/missing").unwrap_err();
        match err {
            StepError::InvalidPath { segment, .. } => assert_eq!(segment, "missing"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!tree.is_started());
        assert_eq!(tree.current_path_string(), "block1/trial1");
    }

    #[test]
    fn block_index_tracks_the_current_leaf() {
        let mut tree = simple_tree();
        assert_eq!(tree.block_index(), Some(0));
        assert_eq!(tree.block_length(), 2);
        tree.next();
        tree.next(); // block1/trial2
        assert_eq!(tree.block_index(), Some(1));
        assert_eq!(tree.block_length(), 2);
        tree.next(); // block2/trial3
        assert_eq!(tree.block_index(), Some(0));
        assert_eq!(tree.block_length(), 1);
    }

    #[test]
    fn block_index_is_none_for_a_bare_root() {
        let tree = StepTree::new();
        assert_eq!(tree.block_index(), None);
        assert_eq!(tree.block_length(), 0);
    }

    #[test]
    fn insert_keeps_the_cursor_on_the_current_child() {
        let mut tree = simple_tree();
        tree.next();
        tree.next();
        tree.next(); // block2/trial3
        tree.insert(tree.root(), Some("block0"), 0, StepData::new())
            .unwrap();
        assert_eq!(tree.current_path_string(), "block2/trial3");
    }

    #[test]
    fn insert_before_start_leaves_reset_cursors_alone() {
        let mut tree = simple_tree();
        tree.insert(tree.root(), Some("block0"), 0, StepData::new())
            .unwrap();
        // Not started: the chain points at the new leftmost leaf.
        assert_eq!(tree.current_path_string(), "block0");
    }

    #[test]
    fn data_along_path_collects_non_empty_records_top_down() {
        let mut tree = StepTree::new();
        let block = tree
            .push(
                tree.root(),
                Some("block"),
                StepData::new().with("phase", "main"),
            )
            .unwrap();
        let trial = tree
            .push(block, Some("trial"), StepData::new().with("color", "red"))
            .unwrap();
        tree.push(trial, Some("sub"), StepData::new()).unwrap();
        let line = tree.data_along_path(block);
        assert_eq!(line.len(), 2);
        assert_eq!(line[0].get("phase"), Some(&"main".into()));
        assert_eq!(line[1].get("color"), Some(&"red".into()));
    }

    #[test]
    fn set_data_at_path_replaces_data() {
        let mut tree = simple_tree();
        tree.set_data_at_path("block1/trial1", StepData::new().with("n", 3i64))
            .unwrap();
        let trial = tree.node_at_path("block1/trial1").unwrap();
        assert_eq!(tree.data(trial).get("n"), Some(&3i64.into()));
        assert!(matches!(
            tree.set_data_at_path("nope", StepData::new()),
            Err(StepError::InvalidPath { .. })
        ));
    }

    #[test]
    fn clear_subtree_releases_slots_for_reuse() {
        let mut tree = simple_tree();
        let block1 = tree.node_at_path("block1").unwrap();
        let trial1 = tree.node_at_path("block1/trial1").unwrap();
        let before = tree.node_count();
        tree.clear_subtree(block1);
        assert!(!tree.contains(trial1));
        assert!(tree.is_leaf(block1));
        assert_eq!(tree.node_count(), before - 2);
        // A new push reuses a freed slot.
        tree.push(block1, Some("fresh"), StepData::new()).unwrap();
        assert_eq!(tree.node_count(), before - 1);
    }

    #[test]
    fn clear_subtree_resets_cursor_and_shuffled_flag() {
        let mut tree = simple_tree();
        let block1 = tree.node_at_path("block1").unwrap();
        let mut rng = rng_from_seed(Some("seed"));
        tree.shuffle_children(block1, &mut rng);
        assert!(tree.is_shuffled(block1));
        tree.next();
        tree.next();
        tree.clear_subtree(block1);
        assert!(!tree.is_shuffled(block1));
        assert_eq!(tree.cursor(block1), 0);
    }

    #[test]
    fn clear_drops_data_too() {
        let mut tree = StepTree::new();
        let block = tree
            .push(tree.root(), Some("b"), StepData::new().with("k", 1i64))
            .unwrap();
        tree.push(block, Some("t"), StepData::new()).unwrap();
        tree.clear(block);
        assert!(tree.data(block).is_empty());
        assert!(tree.is_leaf(block));
    }

    #[test]
    fn shuffle_permutes_in_place_and_tracks_the_cursor() {
        let mut tree = StepTree::new();
        let block = tree.push(tree.root(), Some("block"), StepData::new()).unwrap();
        for i in 0..10 {
            tree.push(block, Some(&format!("t{i}")), StepData::new())
                .unwrap();
        }
        tree.next(); // enter t0
        let current = tree.current_path_string();
        let before: HashSet<String> = tree.leaf_paths(block).into_iter().collect();
        let mut rng = rng_from_seed(Some("participant-3"));
        tree.shuffle_children(block, &mut rng);
        let after: HashSet<String> = tree.leaf_paths(block).into_iter().collect();
        assert_eq!(before, after);
        assert_eq!(tree.current_path_string(), current);
        assert!(tree.is_shuffled(block));
    }

    #[test]
    fn same_seed_shuffles_identically() {
        let build = || {
            let mut tree = StepTree::new();
            for i in 0..12 {
                tree.push(tree.root(), Some(&format!("t{i}")), StepData::new())
                    .unwrap();
            }
            tree
        };
        let mut a = build();
        let mut b = build();
        let mut rng_a = rng_from_seed(Some("seed-x"));
        let mut rng_b = rng_from_seed(Some("seed-x"));
        a.shuffle_children(a.root(), &mut rng_a);
        b.shuffle_children(b.root(), &mut rng_b);
        assert_eq!(a.leaf_paths(a.root()), b.leaf_paths(b.root()));
    }

    #[test]
    fn tree_depth_reports_the_deepest_leaf() {
        let tree = simple_tree();
        assert_eq!(tree.tree_depth(tree.root()), 2);
        let block2 = tree.node_at_path("block2").unwrap();
        assert_eq!(tree.tree_depth(block2), 2);
        assert_eq!(StepTree::new().tree_depth(NodeId(0)), 0);
    }

    #[test]
    fn is_first_leaf_requires_a_leftmost_line() {
        let tree = simple_tree();
        let trial1 = tree.node_at_path("block1/trial1").unwrap();
        let trial2 = tree.node_at_path("block1/trial2").unwrap();
        let block1 = tree.node_at_path("block1").unwrap();
        assert!(tree.is_first_leaf(trial1));
        assert!(!tree.is_first_leaf(trial2));
        assert!(!tree.is_first_leaf(block1));
    }

    #[test]
    fn tree_diagram_draws_guides_and_marks_the_chain() {
        let mut tree = simple_tree();
        tree.next();
        let diagram = tree.tree_diagram();
        assert!(diagram.starts_with("/\n"));
        assert!(diagram.contains("├── block1 *"));
        assert!(diagram.contains("│   ├── trial1 *"));
        assert!(diagram.contains("└── block2"));
        assert!(diagram.contains("    └── trial3"));
    }

    #[test]
    fn deep_nesting_navigates_depth_first() {
        let mut tree = StepTree::new();
        let a = tree.push(tree.root(), Some("a"), StepData::new()).unwrap();
        let b = tree.push(a, Some("b"), StepData::new()).unwrap();
        tree.push(b, Some("x"), StepData::new()).unwrap();
        tree.push(b, Some("y"), StepData::new()).unwrap();
        let c = tree.push(tree.root(), Some("c"), StepData::new()).unwrap();
        tree.push(c, Some("z"), StepData::new()).unwrap();

        let mut seen = Vec::new();
        while let Some(leaf) = tree.next() {
            seen.push(tree.path_string(leaf));
        }
        assert_eq!(seen, ["a/b/x", "a/b/y", "c/z"]);
    }

    #[test]
    fn rename_updates_paths_below() {
        let mut tree = simple_tree();
        let block1 = tree.node_at_path("block1").unwrap();
        tree.rename(block1, "practice").unwrap();
        assert_eq!(tree.id(block1), "practice");
        assert!(tree.node_at_path("practice/trial1").is_some());
        assert!(tree.node_at_path("block1").is_none());
    }

    #[test]
    fn rename_rejects_separator_and_sibling_collisions() {
        let mut tree = simple_tree();
        let block1 = tree.node_at_path("block1").unwrap();
        assert!(matches!(
            tree.rename(block1, "a/b"),
            Err(StepError::InvalidId { .. })
        ));
        assert!(matches!(
            tree.rename(block1, "block2"),
            Err(StepError::DuplicateId { .. })
        ));
        // Renaming to the current id is a no-op, not a collision.
        tree.rename(block1, "block1").unwrap();
    }

    #[test]
    fn copy_subtree_clones_structure_and_data() {
        let mut tree = StepTree::new();
        let block = tree
            .push(tree.root(), Some("block"), StepData::new().with("kind", "practice"))
            .unwrap();
        tree.push(block, Some("t1"), StepData::new().with("n", 1))
            .unwrap();
        tree.push(block, Some("t2"), StepData::new().with("n", 2))
            .unwrap();
        let mut rng = rng_from_seed(Some("s"));
        tree.shuffle_children(block, &mut rng);

        let copy = tree.copy_subtree(block, tree.root(), None).unwrap();
        assert_eq!(tree.id(copy), "1");
        assert_eq!(tree.child_count(copy), 2);
        assert!(tree.is_shuffled(copy));
        assert_eq!(tree.cursor(copy), 0);
        assert_eq!(
            tree.data(copy).get("kind"),
            Some(&StepValue::from("practice"))
        );
        let copied_ids: Vec<&str> = tree
            .children(copy)
            .iter()
            .map(|&child| tree.id(child))
            .collect();
        let original_ids: Vec<&str> = tree
            .children(block)
            .iter()
            .map(|&child| tree.id(child))
            .collect();
        assert_eq!(copied_ids, original_ids);
    }
}
