//! Snapshots: the plain persisted form of a tree.
//!
//! A snapshot is a depth-first nesting of `{id, cursor, depth, shuffled,
//! data, children}` records plus a tree-level `started` flag. Restoring
//! validates *everything first* — every missing or mismatched field across
//! the whole blob is collected into one [`StepError::Snapshot`] — and only
//! then rebuilds the arena, re-deriving parent links and depths rather than
//! trusting the stored ones.
//!
//! Round-trip contract: serializing a tree and restoring the output yields a
//! tree with the same ids, the same shape, the same current leaf, and data
//! equal in plain form; navigation proceeds identically afterwards.
//!
//! # Example
//!
//! ```
//! use trialtree_core::{StepData, StepTree};
//!
//! let mut tree = StepTree::new();
//! let block = tree.push(tree.root(), Some("block1"), StepData::new())?;
//! tree.push(block, Some("trial1"), StepData::new())?;
//! tree.next();
//!
//! let text = tree.snapshot().to_json_string()?;
//! let restored = StepTree::restore_json(&text)?;
//! assert_eq!(restored.current_path_string(), tree.current_path_string());
//! # Ok::<(), trialtree_core::StepError>(())
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::StepData;
use crate::error::{Result, StepError};
use crate::node::{NodeId, PATH_SEPARATOR, StepTree};

// =============================================================================
// Snapshot types
// =============================================================================

/// One node in plain form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub cursor: usize,
    pub depth: usize,
    pub shuffled: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

/// A whole tree in plain form: the root node plus the started flag.
///
/// The flag is flattened alongside the root's fields, so the serialized blob
/// is a single nested object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    #[serde(default = "default_started")]
    pub started: bool,
    #[serde(flatten)]
    pub root: NodeSnapshot,
}

// Blobs without the flag predate it or came from outside; a stored tree is
// assumed to be under way.
fn default_started() -> bool {
    true
}

impl TreeSnapshot {
    /// The snapshot as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// The snapshot as a JSON string.
    ///
    /// # Errors
    ///
    /// [`StepError::Json`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a JSON value into a typed snapshot.
    ///
    /// A `started` field is optional and defaults to `true`: a blob without
    /// one came from outside this library, and a stored tree is assumed to
    /// be under way.
    ///
    /// # Errors
    ///
    /// [`StepError::Snapshot`] listing every violation found.
    pub fn from_value(value: &Value) -> Result<TreeSnapshot> {
        let mut violations = Vec::new();
        let started = match value.get("started") {
            None => true,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                violations.push("node `/`: `started` must be a boolean".to_owned());
                true
            }
        };
        let root = node_from_value(value, "/", &mut violations);
        if violations.is_empty() {
            match root {
                Some(root) => Ok(TreeSnapshot { started, root }),
                // Unreachable in practice: a missing root always records a
                // violation above.
                None => Err(StepError::Snapshot {
                    violations: vec!["node `/`: expected an object".to_owned()],
                }),
            }
        } else {
            Err(StepError::Snapshot { violations })
        }
    }

    /// Parses JSON text into a typed snapshot.
    ///
    /// # Errors
    ///
    /// [`StepError::Json`] if the text is not JSON at all, otherwise as
    /// [`from_value`](Self::from_value).
    pub fn from_json_str(text: &str) -> Result<TreeSnapshot> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Semantic validation of an already-typed snapshot: cursor ranges,
    /// separator-free ids, sibling id uniqueness.
    ///
    /// # Errors
    ///
    /// [`StepError::Snapshot`] listing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        validate_node(&self.root, "/", true, &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(StepError::Snapshot { violations })
        }
    }
}

// =============================================================================
// Capture and restore
// =============================================================================

impl StepTree {
    /// Captures the whole tree in plain form.
    #[must_use]
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            started: self.is_started(),
            root: self.subtree_snapshot(self.root()),
        }
    }

    /// Captures the subtree rooted at `node` in plain form.
    #[must_use]
    pub fn subtree_snapshot(&self, node: NodeId) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id(node).to_owned(),
            cursor: self.cursor(node),
            depth: self.depth(node),
            shuffled: self.is_shuffled(node),
            data: self.data(node).to_plain(),
            children: self
                .children(node)
                .iter()
                .map(|&child| self.subtree_snapshot(child))
                .collect(),
        }
    }

    /// Rebuilds a tree from a typed snapshot.
    ///
    /// Parent links and depths are re-derived from the nesting; the stored
    /// `depth` values are not trusted. The snapshot is validated first and
    /// nothing is built if it fails.
    ///
    /// # Errors
    ///
    /// [`StepError::Snapshot`] listing every violation found.
    pub fn restore(snapshot: &TreeSnapshot) -> Result<StepTree> {
        snapshot.validate()?;
        let mut tree = StepTree::new();
        let root = tree.root();
        tree.set_root_id(snapshot.root.id.clone());
        tree.set_data(root, StepData::from_plain(&snapshot.root.data));
        build_children(&mut tree, root, &snapshot.root)?;
        tree.set_cursor(root, snapshot.root.cursor);
        tree.set_shuffled(root, snapshot.root.shuffled);
        tree.set_started(snapshot.started);
        tracing::debug!(
            nodes = tree.node_count(),
            current = %tree.current_path_string(),
            "restored tree from snapshot"
        );
        Ok(tree)
    }

    /// [`restore`](Self::restore) from a raw JSON value.
    ///
    /// # Errors
    ///
    /// [`StepError::Snapshot`] listing every violation found.
    pub fn restore_value(value: &Value) -> Result<StepTree> {
        let snapshot = TreeSnapshot::from_value(value)?;
        Self::restore(&snapshot)
    }

    /// [`restore`](Self::restore) from JSON text.
    ///
    /// # Errors
    ///
    /// [`StepError::Json`] if the text is not JSON at all, otherwise as
    /// [`restore_value`](Self::restore_value).
    pub fn restore_json(text: &str) -> Result<StepTree> {
        let snapshot = TreeSnapshot::from_json_str(text)?;
        Self::restore(&snapshot)
    }
}

fn build_children(tree: &mut StepTree, parent: NodeId, snapshot: &NodeSnapshot) -> Result<()> {
    for child in &snapshot.children {
        let node = tree.push(parent, Some(&child.id), StepData::from_plain(&child.data))?;
        build_children(tree, node, child)?;
        tree.set_cursor(node, child.cursor);
        tree.set_shuffled(node, child.shuffled);
    }
    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn child_label(parent: &str, child: &NodeSnapshot, position: usize) -> String {
    node_label(parent, Some(&child.id), position)
}

fn node_label(parent: &str, id: Option<&str>, position: usize) -> String {
    let segment = match id {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => format!("#{position}"),
    };
    if parent == "/" {
        segment
    } else {
        format!("{parent}/{segment}")
    }
}

fn validate_node(node: &NodeSnapshot, label: &str, is_root: bool, violations: &mut Vec<String>) {
    if !is_root && node.id.contains(PATH_SEPARATOR) {
        violations.push(format!("node `{label}`: id contains '/'"));
    }
    if node.children.is_empty() {
        if node.cursor != 0 {
            violations.push(format!(
                "node `{label}`: cursor {} out of range for a leaf",
                node.cursor
            ));
        }
    } else if node.cursor >= node.children.len() {
        violations.push(format!(
            "node `{label}`: cursor {} out of range for {} children",
            node.cursor,
            node.children.len()
        ));
    }
    let mut seen = HashSet::new();
    for (position, child) in node.children.iter().enumerate() {
        if !seen.insert(child.id.as_str()) {
            violations.push(format!(
                "node `{label}`: duplicate child id {:?}",
                child.id
            ));
        }
        validate_node(child, &child_label(label, child, position), false, violations);
    }
}

/// Field-by-field structural validation of one node value, recording every
/// problem instead of bailing at the first.
fn node_from_value(value: &Value, label: &str, violations: &mut Vec<String>) -> Option<NodeSnapshot> {
    let Some(map) = value.as_object() else {
        violations.push(format!("node `{label}`: expected an object"));
        return None;
    };

    let id = field(map, label, "id", violations, |v| {
        v.as_str().map(str::to_owned)
    }, "a string");
    let cursor = field(map, label, "cursor", violations, |v| {
        v.as_u64().and_then(|n| usize::try_from(n).ok())
    }, "a non-negative integer");
    let depth = field(map, label, "depth", violations, |v| {
        v.as_u64().and_then(|n| usize::try_from(n).ok())
    }, "a non-negative integer");
    let shuffled = field(map, label, "shuffled", violations, Value::as_bool, "a boolean");

    let data = match map.get("data") {
        None => Map::new(),
        Some(Value::Object(data)) => data.clone(),
        Some(_) => {
            violations.push(format!("node `{label}`: `data` must be an object"));
            Map::new()
        }
    };

    let children = match map.get("children") {
        None => {
            violations.push(format!("node `{label}`: missing required field `children`"));
            None
        }
        Some(Value::Array(items)) => {
            let mut children = Vec::with_capacity(items.len());
            let mut complete = true;
            for (position, item) in items.iter().enumerate() {
                let id = item.get("id").and_then(Value::as_str);
                let label = node_label(label, id, position);
                match node_from_value(item, &label, violations) {
                    Some(child) => children.push(child),
                    None => complete = false,
                }
            }
            complete.then_some(children)
        }
        Some(_) => {
            violations.push(format!("node `{label}`: `children` must be an array"));
            None
        }
    };

    // Semantic checks that only make sense once the parts parsed.
    if label != "/" {
        if let Some(id) = &id {
            if id.contains(PATH_SEPARATOR) {
                violations.push(format!("node `{label}`: id contains '/'"));
            }
        }
    }
    if let (Some(cursor), Some(children)) = (&cursor, &children) {
        if children.is_empty() {
            if *cursor != 0 {
                violations.push(format!(
                    "node `{label}`: cursor {cursor} out of range for a leaf"
                ));
            }
        } else if *cursor >= children.len() {
            violations.push(format!(
                "node `{label}`: cursor {cursor} out of range for {} children",
                children.len()
            ));
        }
    }
    if let Some(children) = &children {
        let mut seen = HashSet::new();
        for child in children {
            if !seen.insert(child.id.as_str()) {
                violations.push(format!(
                    "node `{label}`: duplicate child id {:?}",
                    child.id
                ));
            }
        }
    }

    Some(NodeSnapshot {
        id: id?,
        cursor: cursor?,
        depth: depth?,
        shuffled: shuffled?,
        data,
        children: children?,
    })
}

fn field<T>(
    map: &Map<String, Value>,
    label: &str,
    name: &str,
    violations: &mut Vec<String>,
    extract: impl Fn(&Value) -> Option<T>,
    expected: &str,
) -> Option<T> {
    match map.get(name) {
        None => {
            violations.push(format!("node `{label}`: missing required field `{name}`"));
            None
        }
        Some(value) => match extract(value) {
            Some(parsed) => Some(parsed),
            None => {
                violations.push(format!("node `{label}`: `{name}` must be {expected}"));
                None
            }
        },
    }
}
