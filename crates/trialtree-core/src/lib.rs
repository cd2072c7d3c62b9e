#![forbid(unsafe_code)]

//! Core of the trialtree hierarchical stepper.
//!
//! An experiment timeline is a tree: nodes own ordered children plus a cursor
//! selecting one of them, and the chain of cursors from the root designates
//! the **current leaf** — the trial on screen. This crate provides the tree
//! itself ([`StepTree`], arena-backed with copyable [`NodeId`] handles),
//! O(depth) `next`/`prev` navigation over the leaf sequence, per-node data
//! records with deferred-call values ([`StepData`], [`StepValue`]),
//! id/index child lookup, deterministic seeded shuffling, and validated
//! plain-JSON snapshots ([`TreeSnapshot`]) that round-trip the whole tree
//! state.
//!
//! Bulk tabular population (`append`, `outer`, `zip`, ...) and the
//! persistence boundary live in the `trialtree` facade crate.

pub mod access;
pub mod data;
pub mod error;
pub mod node;
pub mod rng;
pub mod snapshot;

pub use access::{ChildKey, NodeRef};
pub use data::{GeneratorRegistry, StepData, StepValue};
pub use error::{Result, StepError};
pub use node::{NodeId, PATH_SEPARATOR, ROOT_ID, StepTree};
pub use rng::rng_from_seed;
pub use snapshot::{NodeSnapshot, TreeSnapshot};
