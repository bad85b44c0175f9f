//! On-disk B+tree engine for Arbor.
//!
//! This crate provides:
//! - The self-describing binary layout (header, node, leaf, ext_data)
//! - Record parsing and root-down navigation
//! - Typed search operators with leaf-walk strategies
//! - In-place mutation with leaf rebuild and split fallbacks
//! - Free-space allocation inside the tree region
//! - An action/rollback transaction engine
//! - In-memory and streaming tree builders, plus full rebuilds

mod alloc;
mod builder;
mod extdata;
mod layout;
mod mutate;
mod node;
mod rebuild;
mod search;
mod tree;
mod txn;

pub use alloc::{FreeSpaceStats, FreeSpaceTable, Region};
pub use builder::TreeBuilder;
pub use layout::{
    LayoutContext, LeafFlags, TreeFlags, TreeHeader, ValueList, EXT_DATA_MARKER,
    LARGE_LEAF_MAX_SECTION, SMALL_LEAF_MAX_SECTION,
};
pub use node::{
    find_leaf, first_leaf, last_leaf, next_leaf, parse_leaf, parse_record, prev_leaf,
    InternalNode, LeafEntry, LeafRecord, NodeRecord, PathItem, Pivot,
};
pub use rebuild::{create_from_entry_stream, rebuild_tree, write_entry_stream, RebuildOptions};
pub use search::{IndexEntry, SearchOp, SearchOptions, SearchParam, SearchResult};
pub use tree::{BTree, FailedTransaction, TreeOp};
pub use txn::{StepState, Transaction, TxStep};
