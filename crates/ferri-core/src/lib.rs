//! # ferri-core
//!
//! Access-control engine for the ferri virtual filesystem.
//!
//! Given an account and a node, the core answers which operations
//! (read, see, upload, list, archive, delete) are allowed. It owns:
//! - The account graph (users, groups, transitive membership)
//! - The VFS tree (nodes, renames, per-host roots)
//! - The mask engine (glob rules overriding properties of children)
//! - The permission resolver that combines all of the above
//! - A versioned catalog with SQLite persistence
//!
//! Resolution is synchronous and in-memory. Configuration errors never
//! grant: they deny and are logged.

pub mod accounts;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod mask;
pub mod resolver;
pub mod vfs;

pub use accounts::{AccountGraph, AccountStore};
pub use catalog::{Catalog, CatalogError, Edit, EditOutcome, Snapshot};
pub use config::{Config, ConfigError, LogRotation};
pub use db::{DbError, DbResult, FerriDb};
pub use error::{AclError, IntegrityError};
pub use mask::{MaskEngine, MaskMatch, MaskRule};
pub use resolver::{
    DEFAULT_MAX_DEPTH, Explanation, PermissionResolver, ResolverOptions, RuleSource,
};
pub use vfs::{TreeStore, VfsError, VfsResult, VfsTree};
