//! The stepper: bulk trial population over a step tree.
//!
//! [`Stepper`] wraps a [`StepTree`] with the operators an experiment script
//! uses to lay out its timeline (`append`, `outer`, `zip`, `shuffle`,
//! `for_each`, `range`, `repeat`), a row-capacity guard, and optional state
//! persistence through a [`StateStore`]. Navigation and read access delegate
//! to the tree; every mutation auto-saves when a store is bound.
//!
//! # Example
//!
//! ```
//! use trialtree::{Columns, Stepper};
//!
//! let mut stepper = Stepper::new();
//! stepper.outer(
//!     Columns::new()
//!         .column("color", ["red", "blue"])
//!         .column("size", ["small", "large"]),
//! )?;
//! assert_eq!(stepper.leaf_paths(), ["0", "1", "2", "3"]);
//!
//! while let Some(leaf) = stepper.next() {
//!     let _trial = stepper.tree().data(leaf);
//! }
//! # Ok::<(), trialtree::StepError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use trialtree_core::{
    ChildKey, NodeId, NodeRef, Result, StepData, StepError, StepTree, StepValue, TreeSnapshot,
    rng_from_seed,
};

use crate::store::StateStore;

/// Default cap on the number of direct children one node may hold.
pub const DEFAULT_MAX_ROWS: usize = 5000;

// =============================================================================
// Configuration
// =============================================================================

/// Limits applied by the bulk population operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepperConfig {
    /// Maximum number of direct children any single node may hold. Batches
    /// that would cross this are rejected before anything is inserted.
    pub max_rows: usize,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

impl StepperConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

// =============================================================================
// Operator inputs
// =============================================================================

/// One item handed to [`Stepper::append`]: an optional explicit id plus the
/// new node's data record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Explicit child id. `None` assigns the next free positional id.
    pub path: Option<String>,
    pub data: StepData,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Adds one data field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<StepValue>) -> Self {
        self.data = self.data.with(key, value);
        self
    }
}

impl From<StepData> for Row {
    fn from(data: StepData) -> Self {
        Row { path: None, data }
    }
}

/// Values accepted for one column of a [`Columns`] table.
///
/// A vector or array spreads into its elements; a lone scalar becomes a
/// single-element column, the way scripts write constant factors.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValues(Vec<Value>);

impl<T: Into<Value>> From<Vec<T>> for ColumnValues {
    fn from(values: Vec<T>) -> Self {
        ColumnValues(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for ColumnValues {
    fn from(values: [T; N]) -> Self {
        ColumnValues(values.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for ColumnValues {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => ColumnValues(items),
            scalar => ColumnValues(vec![scalar]),
        }
    }
}

impl From<&str> for ColumnValues {
    fn from(value: &str) -> Self {
        ColumnValues(vec![Value::from(value)])
    }
}

impl From<String> for ColumnValues {
    fn from(value: String) -> Self {
        ColumnValues(vec![Value::from(value)])
    }
}

impl From<bool> for ColumnValues {
    fn from(value: bool) -> Self {
        ColumnValues(vec![Value::from(value)])
    }
}

impl From<i64> for ColumnValues {
    fn from(value: i64) -> Self {
        ColumnValues(vec![Value::from(value)])
    }
}

impl From<f64> for ColumnValues {
    fn from(value: f64) -> Self {
        ColumnValues(vec![Value::from(value)])
    }
}

/// An ordered factor table, column name to values.
///
/// Used by [`Stepper::outer`] and [`Stepper::zip`]. Insertion order is the
/// field order of every generated row; for `outer` the first column varies
/// slowest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Columns {
    columns: IndexMap<String, Vec<Value>>,
}

impl Columns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column. Re-using a name replaces that column's values but
    /// keeps its position.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, values: impl Into<ColumnValues>) -> Self {
        let ColumnValues(values) = values.into();
        self.columns.insert(name.into(), values);
        self
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn entries(&self) -> (Vec<&str>, Vec<&[Value]>) {
        let names = self.columns.keys().map(String::as_str).collect();
        let lists = self.columns.values().map(Vec::as_slice).collect();
        (names, lists)
    }
}

/// How [`Stepper::zip`] reconciles columns of unequal length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipMethod {
    /// Cycle shorter columns from their start.
    Loop,
    /// Extend shorter columns with a caller-supplied pad value.
    Pad,
    /// Repeat each shorter column's final value.
    Last,
}

/// Options for [`Stepper::zip`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZipOptions {
    /// Reconciliation method, required once column lengths differ.
    pub method: Option<ZipMethod>,
    /// Fill value for [`ZipMethod::Pad`].
    pub pad_value: Option<Value>,
}

impl ZipOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_method(mut self, method: ZipMethod) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn with_pad_value(mut self, value: impl Into<Value>) -> Self {
        self.pad_value = Some(value.into());
        self
    }
}

impl From<ZipMethod> for ZipOptions {
    fn from(method: ZipMethod) -> Self {
        ZipOptions::new().with_method(method)
    }
}

/// Options for [`Stepper::shuffle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShuffleOptions {
    /// Seed string for reproducible orders; `None` draws OS entropy.
    pub seed: Option<String>,
    /// Reshuffle even if this node was shuffled before.
    pub always: bool,
}

impl ShuffleOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = Some(seed.into());
        self
    }

    /// Ignore the shuffled flag and reshuffle anyway.
    #[must_use]
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }
}

impl From<&str> for ShuffleOptions {
    fn from(seed: &str) -> Self {
        ShuffleOptions::new().with_seed(seed)
    }
}

// =============================================================================
// Stepper
// =============================================================================

struct Persistence {
    store: Arc<dyn StateStore>,
    key: String,
}

/// A hierarchical stepper: a [`StepTree`] plus bulk population operators,
/// a row-capacity guard, and optional state persistence.
pub struct Stepper {
    tree: StepTree,
    config: StepperConfig,
    persistence: Option<Persistence>,
}

impl fmt::Debug for Stepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stepper")
            .field("tree", &self.tree)
            .field("config", &self.config)
            .field(
                "persisted_as",
                &self.persistence.as_ref().map(|p| p.key.as_str()),
            )
            .finish()
    }
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StepperConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StepperConfig) -> Self {
        Stepper {
            tree: StepTree::new(),
            config,
            persistence: None,
        }
    }

    /// Binds a store: from here on, every mutation saves the serialized
    /// tree under `key` (fire-and-forget, failures are logged).
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        self.persistence = Some(Persistence {
            store,
            key: key.into(),
        });
        self
    }

    /// Rebuilds a stepper from whatever `store` holds under `key`.
    ///
    /// `Ok(None)` means nothing usable was saved; a store read failure is
    /// logged and also yields `Ok(None)` so the session starts fresh.
    ///
    /// # Errors
    ///
    /// A present-but-malformed blob is a [`StepError::Snapshot`].
    pub fn restore_state(
        store: Arc<dyn StateStore>,
        key: impl Into<String>,
        config: StepperConfig,
    ) -> Result<Option<Stepper>> {
        let key = key.into();
        let loaded = match store.load(&key) {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(key = %key, error = %error, "failed to load stepper state");
                return Ok(None);
            }
        };
        let Some(value) = loaded else { return Ok(None) };
        let tree = StepTree::restore_value(&value)?;
        debug!(key = %key, nodes = tree.node_count(), "restored stepper state");
        Ok(Some(Stepper {
            tree,
            config,
            persistence: Some(Persistence { store, key }),
        }))
    }

    /// Builds a stepper from an in-memory snapshot, no store attached.
    ///
    /// # Errors
    ///
    /// [`StepError::Snapshot`] if the snapshot fails validation.
    pub fn from_snapshot(snapshot: &TreeSnapshot, config: StepperConfig) -> Result<Stepper> {
        Ok(Stepper {
            tree: StepTree::restore(snapshot)?,
            config,
            persistence: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> StepperConfig {
        self.config
    }

    /// The underlying tree, for read access beyond the delegated surface.
    #[must_use]
    pub fn tree(&self) -> &StepTree {
        &self.tree
    }

    /// Mutable tree access. Changes made through it bypass auto-save;
    /// call [`save_state`](Self::save_state) afterwards if needed.
    pub fn tree_mut(&mut self) -> &mut StepTree {
        &mut self.tree
    }

    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        self.tree.snapshot()
    }

    // -------------------------------------------------------------------------
    // Navigation (delegated, mutations auto-save)
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Advances to the next leaf. See [`StepTree::next`].
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<NodeId> {
        let leaf = self.tree.next();
        self.autosave();
        leaf
    }

    /// Steps back to the previous leaf. See [`StepTree::prev`].
    pub fn prev(&mut self) -> Option<NodeId> {
        let leaf = self.tree.prev();
        self.autosave();
        leaf
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.tree.has_next()
    }

    #[must_use]
    pub fn has_prev(&self) -> bool {
        self.tree.has_prev()
    }

    /// What [`next`](Self::next) would return, without moving or saving.
    pub fn peek_next(&mut self) -> Option<NodeId> {
        self.tree.peek_next()
    }

    /// What [`prev`](Self::prev) would return, without moving or saving.
    pub fn peek_prev(&mut self) -> Option<NodeId> {
        self.tree.peek_prev()
    }

    /// Rewinds every cursor to the first leaf and marks the tree unstarted.
    pub fn reset(&mut self) {
        self.tree.reset();
        self.autosave();
    }

    /// Jumps to `path`. See [`StepTree::go_to`].
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] when a segment does not resolve; the tree
    /// is left reset.
    pub fn go_to(&mut self, path: &str) -> Result<NodeId> {
        let node = self.tree.go_to(path)?;
        self.autosave();
        Ok(node)
    }

    #[must_use]
    pub fn current_leaf(&self) -> NodeId {
        self.tree.current_leaf()
    }

    #[must_use]
    pub fn current_path(&self) -> Vec<String> {
        self.tree.current_path()
    }

    #[must_use]
    pub fn current_path_string(&self) -> String {
        self.tree.current_path_string()
    }

    #[must_use]
    pub fn current_data(&self) -> &StepData {
        self.tree.current_data()
    }

    #[must_use]
    pub fn block_index(&self) -> Option<usize> {
        self.tree.block_index()
    }

    #[must_use]
    pub fn block_length(&self) -> usize {
        self.tree.block_length()
    }

    // -------------------------------------------------------------------------
    // Structure (delegated, mutations auto-save)
    // -------------------------------------------------------------------------

    /// Appends one child. See [`StepTree::push`].
    ///
    /// # Errors
    ///
    /// See [`StepTree::push`].
    pub fn push(&mut self, parent: NodeId, id: Option<&str>, data: StepData) -> Result<NodeId> {
        let node = self.tree.push(parent, id, data)?;
        self.autosave();
        Ok(node)
    }

    /// Adds a named child of the root, the usual way blocks enter a timeline.
    ///
    /// # Errors
    ///
    /// See [`StepTree::push`].
    pub fn push_root(&mut self, id: &str, data: StepData) -> Result<NodeId> {
        let root = self.tree.root();
        self.push(root, Some(id), data)
    }

    /// Inserts a child at a splice-style position. See [`StepTree::insert`].
    ///
    /// # Errors
    ///
    /// See [`StepTree::insert`].
    pub fn insert(
        &mut self,
        parent: NodeId,
        id: Option<&str>,
        index: i64,
        data: StepData,
    ) -> Result<NodeId> {
        let node = self.tree.insert(parent, id, index, data)?;
        self.autosave();
        Ok(node)
    }

    /// Replaces the data of the node at `path`.
    ///
    /// # Errors
    ///
    /// [`StepError::InvalidPath`] when the path does not resolve.
    pub fn set_data_at_path(&mut self, path: &str, data: StepData) -> Result<NodeId> {
        let node = self.tree.set_data_at_path(path, data)?;
        self.autosave();
        Ok(node)
    }

    /// Clears the subtree below `node` and its data. See [`StepTree::clear`].
    pub fn clear(&mut self, node: NodeId) {
        self.tree.clear(node);
        self.autosave();
    }

    /// Removes every descendant of `node`, keeping its data.
    pub fn clear_subtree(&mut self, node: NodeId) {
        self.tree.clear_subtree(node);
        self.autosave();
    }

    #[must_use]
    pub fn child<'a>(&self, node: NodeId, key: impl Into<ChildKey<'a>>) -> Option<NodeId> {
        self.tree.child(node, key)
    }

    #[must_use]
    pub fn node_at_path(&self, path: &str) -> Option<NodeId> {
        self.tree.node_at_path(path)
    }

    #[must_use]
    pub fn data(&self, node: NodeId) -> &StepData {
        self.tree.data(node)
    }

    #[must_use]
    pub fn path_string(&self, node: NodeId) -> String {
        self.tree.path_string(node)
    }

    /// Paths of every leaf in the tree, in traversal order.
    #[must_use]
    pub fn leaf_paths(&self) -> Vec<String> {
        self.tree.leaf_paths(self.tree.root())
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count(self.tree.root())
    }

    /// ASCII rendering of the tree for logs and debugging.
    #[must_use]
    pub fn tree_diagram(&self) -> String {
        self.tree.tree_diagram()
    }

    // -------------------------------------------------------------------------
    // Bulk population
    // -------------------------------------------------------------------------

    /// Appends `rows` under the root. See [`append_at`](Self::append_at).
    ///
    /// # Errors
    ///
    /// See [`append_at`](Self::append_at).
    pub fn append<I>(&mut self, rows: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = Row>,
    {
        let root = self.tree.root();
        self.append_at(root, rows)
    }

    /// Appends `rows` as children of `node`.
    ///
    /// The whole batch is checked against `max_rows` first. Individual rows
    /// are then skipped with a warning when an explicit id collides with an
    /// existing sibling, or when an id-less row's data equals an existing
    /// child's data; a row with a distinct explicit id is kept even if its
    /// data matches another child.
    ///
    /// # Errors
    ///
    /// [`StepError::CapacityExceeded`] rejects the batch before anything is
    /// inserted; [`StepError::InvalidId`] if an explicit id contains `/`.
    pub fn append_at<I>(&mut self, node: NodeId, rows: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = Row>,
    {
        let rows: Vec<Row> = rows.into_iter().collect();
        self.check_capacity(node, rows.len())?;
        for row in rows {
            if let Some(id) = &row.path {
                if self.child_id_taken(node, id) {
                    warn!(id = %id, "skipping appended row, id already taken");
                    continue;
                }
            } else if self.has_equal_child_data(node, &row.data) {
                warn!("skipping appended row, data equals an existing child");
                continue;
            }
            self.tree.push(node, row.path.as_deref(), row.data)?;
        }
        self.autosave();
        Ok(self)
    }

    /// Builds the full cross product of `columns` and appends one child per
    /// combination, the first column varying slowest.
    ///
    /// # Errors
    ///
    /// See [`outer_at`](Self::outer_at).
    pub fn outer(&mut self, columns: Columns) -> Result<&mut Self> {
        let root = self.tree.root();
        self.outer_at(root, columns)
    }

    /// Cross product under an arbitrary `node`.
    ///
    /// # Errors
    ///
    /// [`StepError::MissingParameter`] without columns;
    /// [`StepError::CapacityExceeded`] when the product would cross
    /// `max_rows` (nothing is inserted).
    pub fn outer_at(&mut self, node: NodeId, columns: Columns) -> Result<&mut Self> {
        if columns.is_empty() {
            return Err(StepError::MissingParameter {
                name: "columns",
                hint: "outer needs at least one column",
            });
        }
        let (names, lists) = columns.entries();
        // Saturate on overflow; the capacity check rejects anything past
        // `max_rows` before a single row is built.
        let total = lists
            .iter()
            .try_fold(1usize, |acc, list| acc.checked_mul(list.len()))
            .unwrap_or(usize::MAX);
        self.check_capacity(node, total)?;
        let mut rows = Vec::with_capacity(total);
        for combination in 0..total {
            let mut remainder = combination;
            let mut data = StepData::new();
            // Build in reverse so the rightmost column cycles fastest, then
            // restore the declared field order.
            let mut picked = vec![Value::Null; names.len()];
            for slot in (0..lists.len()).rev() {
                let list = lists[slot];
                picked[slot] = list[remainder % list.len()].clone();
                remainder /= list.len();
            }
            for (slot, name) in names.iter().enumerate() {
                data.insert(*name, StepValue::from_plain(picked[slot].take()));
            }
            rows.push(Row { path: None, data });
        }
        self.append_at(node, rows)
    }

    /// Reads `columns` in lockstep, row `i` taking the i-th value of every
    /// column. See [`zip_at`](Self::zip_at).
    ///
    /// # Errors
    ///
    /// See [`zip_at`](Self::zip_at).
    pub fn zip(&mut self, columns: Columns, options: impl Into<ZipOptions>) -> Result<&mut Self> {
        let root = self.tree.root();
        self.zip_at(root, columns, options)
    }

    /// Lockstep append under an arbitrary `node`.
    ///
    /// Unequal column lengths need an explicit [`ZipMethod`]; with
    /// [`ZipMethod::Pad`] a pad value must be supplied too.
    ///
    /// # Errors
    ///
    /// [`StepError::MissingParameter`] without columns, on a length
    /// mismatch with no method, or for `Pad` without a pad value;
    /// [`StepError::CapacityExceeded`] as for `append`.
    pub fn zip_at(
        &mut self,
        node: NodeId,
        columns: Columns,
        options: impl Into<ZipOptions>,
    ) -> Result<&mut Self> {
        let options = options.into();
        if columns.is_empty() {
            return Err(StepError::MissingParameter {
                name: "columns",
                hint: "zip needs at least one column",
            });
        }
        let (names, lists) = columns.entries();
        let longest = lists.iter().map(|list| list.len()).max().unwrap_or(0);
        if lists.iter().any(|list| list.len() != longest) {
            match options.method {
                None => {
                    return Err(StepError::MissingParameter {
                        name: "method",
                        hint: "columns differ in length, pick loop, pad or last",
                    });
                }
                Some(ZipMethod::Pad) if options.pad_value.is_none() => {
                    return Err(StepError::MissingParameter {
                        name: "pad_value",
                        hint: "pad needs a fill value",
                    });
                }
                Some(_) => {}
            }
        }
        let mut rows = Vec::with_capacity(longest);
        for index in 0..longest {
            let mut data = StepData::new();
            for (slot, name) in names.iter().enumerate() {
                let list = lists[slot];
                let value = if index < list.len() {
                    list[index].clone()
                } else {
                    match options.method {
                        Some(ZipMethod::Loop) if !list.is_empty() => {
                            list[index % list.len()].clone()
                        }
                        Some(ZipMethod::Last) if !list.is_empty() => list[list.len() - 1].clone(),
                        Some(ZipMethod::Pad) => {
                            options.pad_value.clone().unwrap_or(Value::Null)
                        }
                        // An empty column has nothing to cycle or repeat.
                        _ => Value::Null,
                    }
                };
                data.insert(*name, StepValue::from_plain(value));
            }
            rows.push(Row { path: None, data });
        }
        self.append_at(node, rows)
    }

    /// Shuffles the direct children of the root.
    /// See [`shuffle_at`](Self::shuffle_at).
    pub fn shuffle(&mut self, options: impl Into<ShuffleOptions>) -> &mut Self {
        let root = self.tree.root();
        self.shuffle_at(root, options)
    }

    /// Shuffles the direct children of `node`.
    ///
    /// A node only shuffles once: repeat calls are ignored unless
    /// [`ShuffleOptions::always`] is set, so a participant who reloads the
    /// page keeps the order they started with. The cursor keeps following
    /// the child it pointed at, leaving the current leaf unchanged.
    pub fn shuffle_at(&mut self, node: NodeId, options: impl Into<ShuffleOptions>) -> &mut Self {
        let options = options.into();
        if self.tree.is_shuffled(node) && !options.always {
            debug!(path = %self.tree.path_string(node), "already shuffled, keeping order");
            return self;
        }
        let mut rng = rng_from_seed(options.seed.as_deref());
        self.tree.shuffle_children(node, &mut rng);
        self.autosave();
        self
    }

    /// Visits each direct child of the root.
    /// See [`for_each_at`](Self::for_each_at).
    ///
    /// # Errors
    ///
    /// See [`for_each_at`](Self::for_each_at).
    pub fn for_each<F>(&mut self, f: F) -> Result<&mut Self>
    where
        F: FnMut(NodeRef<'_>, usize) -> Option<Row>,
    {
        let root = self.tree.root();
        self.for_each_at(root, f)
    }

    /// Visits each direct child of `node` in order and merges the returned
    /// patch into the child's data. Returning `None` leaves a child
    /// untouched. A patch with a `path` renames the child.
    ///
    /// # Errors
    ///
    /// [`StepError::DuplicateId`] when a rename collides with a sibling,
    /// [`StepError::InvalidId`] when it contains `/`; patches applied before
    /// the failure stay applied.
    pub fn for_each_at<F>(&mut self, node: NodeId, mut f: F) -> Result<&mut Self>
    where
        F: FnMut(NodeRef<'_>, usize) -> Option<Row>,
    {
        let children: Vec<NodeId> = self.tree.children(node).to_vec();
        for (index, child) in children.into_iter().enumerate() {
            let Some(patch) = f(self.tree.node_ref(child), index) else {
                continue;
            };
            if let Some(id) = &patch.path {
                self.tree.rename(child, id)?;
            }
            self.tree.data_mut(child).merge(patch.data);
        }
        self.autosave();
        Ok(self)
    }

    /// Replaces the root's children with `count` numbered rows.
    /// See [`range_at`](Self::range_at).
    ///
    /// # Errors
    ///
    /// See [`range_at`](Self::range_at).
    pub fn range(&mut self, count: usize) -> Result<&mut Self> {
        let root = self.tree.root();
        self.range_at(root, count, "range")
    }

    /// Replaces the children of `node` with `count` rows, each carrying a
    /// single `field` entry holding its index.
    ///
    /// # Errors
    ///
    /// [`StepError::CapacityExceeded`] when `count` crosses `max_rows`; the
    /// existing children are kept in that case.
    pub fn range_at(&mut self, node: NodeId, count: usize, field: &str) -> Result<&mut Self> {
        if count > self.config.max_rows {
            return Err(StepError::CapacityExceeded {
                requested: count,
                max_rows: self.config.max_rows,
            });
        }
        self.tree.clear_subtree(node);
        for index in 0..count {
            self.tree
                .push(node, None, StepData::new().with(field, index as i64))?;
        }
        self.autosave();
        Ok(self)
    }

    /// Multiplies the root's children. See [`repeat_at`](Self::repeat_at).
    ///
    /// # Errors
    ///
    /// See [`repeat_at`](Self::repeat_at).
    pub fn repeat(&mut self, times: usize) -> Result<&mut Self> {
        let root = self.tree.root();
        self.repeat_at(root, times)
    }

    /// Multiplies the children of `node`: afterwards it holds `times` copies
    /// of its original child list, the extras deep-copied with fresh
    /// top-level ids. `repeat(1)` is a no-op and `repeat(0)` clears the
    /// children.
    ///
    /// # Errors
    ///
    /// [`StepError::CapacityExceeded`] when the multiplied count crosses
    /// `max_rows`; nothing is copied in that case.
    pub fn repeat_at(&mut self, node: NodeId, times: usize) -> Result<&mut Self> {
        let originals: Vec<NodeId> = self.tree.children(node).to_vec();
        let requested = originals.len().checked_mul(times).unwrap_or(usize::MAX);
        if requested > self.config.max_rows {
            return Err(StepError::CapacityExceeded {
                requested,
                max_rows: self.config.max_rows,
            });
        }
        if times == 0 {
            self.tree.clear_subtree(node);
            self.autosave();
            return Ok(self);
        }
        for _ in 1..times {
            for &original in &originals {
                self.tree.copy_subtree(original, node, None)?;
            }
        }
        self.autosave();
        Ok(self)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Serializes the tree and hands it to the bound store, logging
    /// failures. Does nothing when no store is bound.
    pub fn save_state(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let state = self.tree.snapshot().to_value();
        match persistence.store.save(&persistence.key, &state) {
            Ok(()) => debug!(key = %persistence.key, "saved stepper state"),
            Err(error) => {
                warn!(key = %persistence.key, error = %error, "failed to save stepper state");
            }
        }
    }

    /// Key the state is saved under, if a store is bound.
    #[must_use]
    pub fn persistence_key(&self) -> Option<&str> {
        self.persistence.as_ref().map(|p| p.key.as_str())
    }

    fn autosave(&self) {
        if self.persistence.is_some() {
            self.save_state();
        }
    }

    fn check_capacity(&self, node: NodeId, additional: usize) -> Result<()> {
        let requested = self.tree.child_count(node).saturating_add(additional);
        if requested > self.config.max_rows {
            return Err(StepError::CapacityExceeded {
                requested,
                max_rows: self.config.max_rows,
            });
        }
        Ok(())
    }

    // Explicit ids dedupe by name; numeric lookup rules don't apply here.
    fn child_id_taken(&self, node: NodeId, id: &str) -> bool {
        self.tree
            .children(node)
            .iter()
            .any(|&child| self.tree.id(child) == id)
    }

    fn has_equal_child_data(&self, node: NodeId, data: &StepData) -> bool {
        self.tree
            .children(node)
            .iter()
            .any(|&child| self.tree.data(child) == data)
    }
}

// =============================================================================
// Tests
// =============================================================================
