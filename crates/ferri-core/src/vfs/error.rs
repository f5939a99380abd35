//! VFS lookup error types.

use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Node not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No root entry matches the host.
    #[error("no root for host: {0}")]
    NoRoot(String),

    /// Parent chain is cyclic or too deep.
    #[error("broken parent chain at: {0}")]
    BrokenChain(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a NoRoot error.
    pub fn no_root(host: impl Into<String>) -> Self {
        Self::NoRoot(host.into())
    }

    /// Create a BrokenChain error.
    pub fn broken_chain(what: impl Into<String>) -> Self {
        Self::BrokenChain(what.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
