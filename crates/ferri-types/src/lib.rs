//! Shared account, VFS node and permission types for ferri.
//!
//! This crate is the relational foundation: typed IDs and the row types of
//! the account graph and the VFS tree. It has **no internal ferri
//! dependencies**; the engines in `ferri-core` build on it.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Account (AccountId) ← user or group
//!     └── belongs to groups via Membership (account → group)
//!
//! VfsNode (NodeId) ← folder, file or link
//!     └── parent_id forms the tree (root has none)
//!     └── owns NodeRename rows (disk name → display name of its children)
//!     └── owns NodePermission rows (one `who` per Operation)
//!     └── owns NodeMask rows (glob → MaskProps for matching children)
//!
//! Root ← host (literal or glob) → VfsNode
//! ```

pub mod account;
pub mod ids;
pub mod node;
pub mod permission;

pub use account::{Account, Membership};
pub use ids::{AccountId, NodeId};
pub use node::{DefaultChild, MaskProps, NodeMask, NodeRename, Root, VfsNode};
pub use permission::{DescriptorError, NodePermission, Operation, Scope, WhoCan};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
