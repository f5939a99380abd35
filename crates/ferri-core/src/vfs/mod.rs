//! Virtual filesystem tree.
//!
//! Key components:
//!
//! - [`TreeStore`] - Read seam: raw row lookups plus the tree algorithms
//! - [`VfsTree`] - In-memory arena of nodes and everything they own
//!
//! ## Design Decisions
//!
//! - **Arena, not pointers**: nodes are keyed by id with parent
//!   back-references; the children index is derived.
//! - **Names are computed**: a node's effective name comes from its explicit
//!   name, its renamed disk basename or its URL, in that order.
//! - **Literal roots first**: host routing prefers an exact entry, then the
//!   most specific glob.

mod error;
mod store;
mod tree;

pub use error::{VfsError, VfsResult};
pub use store::{MAX_TREE_DEPTH, TreeStore, basename, url_basename};
pub use tree::VfsTree;
