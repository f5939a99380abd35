//! Error types for writes and permission resolution.
//!
//! ```text
//! write path:      IntegrityError   rejected synchronously, nothing changes
//! resolution path: AclError         collapses to deny + a logged diagnostic
//!                     └── VfsError  (lookups: missing node, no root, broken chain)
//! ```

use ferri_types::{AccountId, DescriptorError, NodeId, Operation};
use thiserror::Error;

use crate::vfs::VfsError;

/// A write that would break a constraint of the account graph or the tree.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("account already exists: {0}")]
    DuplicateAccount(AccountId),

    #[error("username already taken: {0}")]
    DuplicateUsername(String),

    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("membership target '{0}' is not a group")]
    NotAGroup(String),

    #[error("group '{0}' cannot carry credential material")]
    GroupCredential(String),

    #[error("expiry {expire} for '{username}' is beyond the storable range")]
    ExpireOutOfRange { username: String, expire: u64 },

    #[error("account '{0}' still has members and must stay a group")]
    GroupHasMembers(String),

    #[error("node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node {0} has none of name, source_path or url")]
    Nameless(NodeId),

    #[error("unknown mask: {0}")]
    UnknownMask(i64),

    #[error("invalid glob '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("root already defined for host '{0}'")]
    DuplicateRoot(String),

    #[error("no root defined for host '{0}'")]
    UnknownRoot(String),
}

/// A configuration problem found while resolving a permission.
///
/// Every variant fails closed: the caller sees a deny, and the error is
/// reported out of band.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("malformed who for '{operation}' on node {node}: {source}")]
    MalformedWho {
        node: NodeId,
        operation: Operation,
        #[source]
        source: DescriptorError,
    },

    #[error("malformed mask '{pattern}' on node {node}: {source}")]
    MalformedMask {
        node: NodeId,
        pattern: String,
        #[source]
        source: DescriptorError,
    },

    #[error("invalid glob '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("recursion depth exceeded (limit {limit})")]
    DepthExceeded { limit: usize },

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

impl AclError {
    /// Short category for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedWho { .. } => "malformed_who",
            Self::MalformedMask { .. } => "malformed_mask",
            Self::BadPattern { .. } => "bad_pattern",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::Vfs(_) => "vfs",
        }
    }
}
