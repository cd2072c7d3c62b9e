#![forbid(unsafe_code)]

//! Trialtree public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for experiment
//! scripts: the [`Stepper`] with its bulk population operators and
//! persistence, plus re-exports of the tree types from `trialtree-core`.
//!
//! A timeline is a tree. Interior nodes are blocks, leaves are trials, and
//! [`Stepper::next`] walks the leaves in depth-first order, one trial per
//! screen refresh. Populate with [`Stepper::append`], [`Stepper::outer`],
//! [`Stepper::zip`] and friends, then drive the session with
//! `next`/`prev`/`go_to`.

pub mod stepper;
pub mod store;

// --- Core re-exports -------------------------------------------------------

pub use trialtree_core::{
    ChildKey, GeneratorRegistry, NodeId, NodeRef, NodeSnapshot, PATH_SEPARATOR, ROOT_ID, Result,
    StepData, StepError, StepTree, StepValue, TreeSnapshot, rng_from_seed,
};

// --- Stepper re-exports ----------------------------------------------------

pub use crate::stepper::{
    ColumnValues, Columns, DEFAULT_MAX_ROWS, Row, ShuffleOptions, Stepper, StepperConfig,
    ZipMethod, ZipOptions,
};

// --- Store re-exports ------------------------------------------------------

pub use crate::store::{MemoryStore, StateStore, StoreError};

// --- Prelude ---------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        Columns, Row, ShuffleOptions, StepData, StepError, StepTree, StepValue, Stepper,
        StepperConfig, ZipMethod, ZipOptions,
    };
}

pub use trialtree_core as core;
