//! Versioned snapshots of the account graph and VFS tree.
//!
//! Readers grab the current `Arc<Snapshot>` and resolve against it without
//! holding any lock, so a resolution always sees one consistent state.
//! Writers serialize on a mutex, clone the snapshot, apply the edit, persist
//! it, and publish the new snapshot only once everything succeeded.
//!
//! ```text
//! reader:  RwLock::read → Arc clone → resolve (lock released)
//! writer:  Mutex::lock → clone → Edit → FerriDb → RwLock::write(publish)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use ferri_types::{
    Account, AccountId, DefaultChild, MaskProps, NodeId, Operation, Root, VfsNode, WhoCan,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::{AccountGraph, AccountStore};
use crate::db::{DbError, FerriDb};
use crate::error::{AclError, IntegrityError};
use crate::resolver::{Explanation, PermissionResolver, ResolverOptions};
use crate::vfs::{TreeStore, VfsResult, VfsTree};

// ============================================================================
// Edits
// ============================================================================

/// One administrative mutation. Serialized as JSON with an `op` tag:
///
/// ```json
/// {"op":"set_permission","node":"0190…","operation":"read","who":["staff"]}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Edit {
    InsertAccount {
        account: Account,
    },
    UpdateAccount {
        account: Account,
    },
    RemoveAccount {
        id: AccountId,
    },
    AddMembership {
        account: AccountId,
        group: AccountId,
    },
    RemoveMembership {
        account: AccountId,
        group: AccountId,
    },
    InsertNode {
        node: VfsNode,
    },
    DeleteNode {
        id: NodeId,
    },
    SetDefaultChild {
        node: NodeId,
        #[serde(default)]
        child: Option<DefaultChild>,
    },
    SetPermission {
        node: NodeId,
        operation: Operation,
        who: WhoCan,
    },
    ClearPermission {
        node: NodeId,
        operation: Operation,
    },
    AddMask {
        node: NodeId,
        pattern: String,
        #[serde(default)]
        props: MaskProps,
        #[serde(default)]
        ord: i64,
    },
    RemoveMask {
        seq: i64,
    },
    SetRename {
        node: NodeId,
        original_name: String,
        display_name: String,
    },
    RemoveRename {
        node: NodeId,
        original_name: String,
    },
    AddRoot {
        host: String,
        node: NodeId,
    },
    RemoveRoot {
        host: String,
    },
}

impl Edit {
    /// The `op` tag, for logs.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// What an applied edit produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    Done,
    /// Sequence assigned to the new mask.
    MaskAdded(i64),
    /// Every node removed by a subtree delete, the target first.
    NodesDeleted(Vec<NodeId>),
}

// ============================================================================
// Snapshot
// ============================================================================

/// A consistent view of accounts and tree at one version.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    version: u64,
    accounts: AccountGraph,
    tree: VfsTree,
}

impl Snapshot {
    pub fn new(accounts: AccountGraph, tree: VfsTree) -> Self {
        Self {
            version: 0,
            accounts,
            tree,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn accounts(&self) -> &AccountGraph {
        &self.accounts
    }

    pub fn tree(&self) -> &VfsTree {
        &self.tree
    }

    pub fn resolver(
        &self,
        options: ResolverOptions,
    ) -> PermissionResolver<'_, AccountGraph, VfsTree> {
        PermissionResolver::new(&self.accounts, &self.tree, options)
    }

    /// Apply one edit in place. On error nothing has changed.
    pub fn apply(&mut self, edit: &Edit) -> Result<EditOutcome, IntegrityError> {
        match edit {
            Edit::InsertAccount { account } => self.accounts.insert(account.clone())?,
            Edit::UpdateAccount { account } => self.accounts.update(account.clone())?,
            Edit::RemoveAccount { id } => {
                self.accounts.remove(*id)?;
            }
            Edit::AddMembership { account, group } => {
                self.accounts.add_membership(*account, *group)?
            }
            Edit::RemoveMembership { account, group } => {
                self.accounts.remove_membership(*account, *group);
            }
            Edit::InsertNode { node } => self.tree.insert_node(node.clone())?,
            Edit::DeleteNode { id } => {
                return Ok(EditOutcome::NodesDeleted(self.tree.delete_node(*id)?));
            }
            Edit::SetDefaultChild { node, child } => {
                self.tree.set_default_child(*node, child.clone())?
            }
            Edit::SetPermission {
                node,
                operation,
                who,
            } => {
                self.tree.set_permission(*node, *operation, who)?;
            }
            Edit::ClearPermission { node, operation } => {
                self.tree.clear_permission(*node, *operation);
            }
            Edit::AddMask {
                node,
                pattern,
                props,
                ord,
            } => {
                let seq = self.tree.add_mask(*node, pattern, props, *ord)?;
                return Ok(EditOutcome::MaskAdded(seq));
            }
            Edit::RemoveMask { seq } => {
                self.tree.remove_mask(*seq)?;
            }
            Edit::SetRename {
                node,
                original_name,
                display_name,
            } => self
                .tree
                .set_rename(*node, original_name.as_str(), display_name.as_str())?,
            Edit::RemoveRename {
                node,
                original_name,
            } => {
                self.tree.remove_rename(*node, original_name);
            }
            Edit::AddRoot { host, node } => self.tree.add_root(Root::new(host.as_str(), *node))?,
            Edit::RemoveRoot { host } => {
                self.tree.remove_root(host)?;
            }
        }
        Ok(EditOutcome::Done)
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Errors from [`Catalog`] writes.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("edit rejected: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("persistence failed: {0}")]
    Db(#[from] DbError),
}

/// Shared, versioned catalog.
pub struct Catalog {
    current: RwLock<Arc<Snapshot>>,
    /// Serializes writers; holds the database when one is attached.
    writer: Mutex<Option<FerriDb>>,
    options: ResolverOptions,
}

impl Catalog {
    /// In-memory catalog starting from `snapshot`.
    pub fn new(snapshot: Snapshot, options: ResolverOptions) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(None),
            options,
        }
    }

    /// Load from `db` and persist every later edit to it.
    pub fn with_db(db: FerriDb, options: ResolverOptions) -> Result<Self, DbError> {
        let snapshot = db.load()?;
        tracing::info!(
            accounts = snapshot.accounts.len(),
            nodes = snapshot.tree.len(),
            "catalog loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(Some(db)),
            options,
        })
    }

    pub fn options(&self) -> ResolverOptions {
        self.options
    }

    /// The current snapshot. Stays valid while edits are published.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Apply and publish one edit.
    pub fn apply(&self, edit: &Edit) -> Result<EditOutcome, CatalogError> {
        let mut outcomes = self.apply_all(std::slice::from_ref(edit))?;
        Ok(outcomes.pop().unwrap_or(EditOutcome::Done))
    }

    /// Apply a batch atomically: all edits are published together, or none.
    pub fn apply_all(&self, edits: &[Edit]) -> Result<Vec<EditOutcome>, CatalogError> {
        let db = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot());

        let mut outcomes = Vec::with_capacity(edits.len());
        for edit in edits {
            match next.apply(edit) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(op = edit.name(), error = %e, "edit rejected");
                    return Err(e.into());
                }
            }
        }
        if let Some(db) = db.as_ref() {
            db.apply_all(edits.iter().zip(&outcomes))?;
        }

        next.version += 1;
        let version = next.version;
        *self.current.write() = Arc::new(next);
        tracing::info!(version, edits = edits.len(), "catalog updated");
        Ok(outcomes)
    }

    // ========================================================================
    // Queries (each against one snapshot)
    // ========================================================================

    pub fn can_do(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> bool {
        self.snapshot()
            .resolver(self.options)
            .can_do(account, node, operation, now)
    }

    pub fn check(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> Result<bool, AclError> {
        self.snapshot()
            .resolver(self.options)
            .check(account, node, operation, now)
    }

    pub fn explain(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> Result<Explanation, AclError> {
        self.snapshot()
            .resolver(self.options)
            .explain(account, node, operation, now)
    }

    pub fn resolve_root(&self, host: &str) -> VfsResult<NodeId> {
        self.snapshot().tree.resolve_root(host)
    }

    pub fn resolve_groups(&self, account: AccountId) -> BTreeSet<AccountId> {
        self.snapshot().accounts.resolve_groups(account)
    }

    pub fn effective_props(&self, node: NodeId) -> Result<MaskProps, AclError> {
        self.snapshot().resolver(self.options).effective_props(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Catalog, NodeId, NodeId) {
        let catalog = Catalog::new(Snapshot::default(), ResolverOptions::default());
        let root = VfsNode::root("");
        let docs = VfsNode::named(root.id, "docs");
        let ids = (root.id, docs.id);
        catalog
            .apply_all(&[
                Edit::InsertNode { node: root },
                Edit::InsertNode { node: docs },
            ])
            .unwrap();
        (catalog, ids.0, ids.1)
    }

    #[test]
    fn test_edit_json_shape() {
        let node = NodeId::new();
        let edit = Edit::SetPermission {
            node,
            operation: Operation::Read,
            who: WhoCan::accounts(["staff"]),
        };
        let json = serde_json::to_string(&edit).unwrap();
        assert!(json.contains(r#""op":"set_permission""#), "got: {json}");
        assert!(json.contains(r#""who":["staff"]"#), "got: {json}");
        assert_eq!(edit.name(), "set_permission");

        let parsed: Edit = serde_json::from_str(&format!(
            r#"{{"op":"add_mask","node":"{node}","pattern":"*.tmp"}}"#
        ))
        .unwrap();
        assert!(matches!(parsed, Edit::AddMask { ord: 0, .. }));
    }

    #[test]
    fn test_versions_advance_per_publish() {
        let (catalog, _, docs) = seeded();
        assert_eq!(catalog.version(), 1);
        catalog
            .apply(&Edit::SetPermission {
                node: docs,
                operation: Operation::List,
                who: WhoCan::Anyone,
            })
            .unwrap();
        assert_eq!(catalog.version(), 2);
        assert!(catalog.can_do(None, docs, Operation::List, 0));
    }

    #[test]
    fn test_failed_batch_publishes_nothing() {
        let (catalog, root, docs) = seeded();
        let before = catalog.snapshot();
        let err = catalog
            .apply_all(&[
                Edit::SetPermission {
                    node: docs,
                    operation: Operation::Read,
                    who: WhoCan::Anyone,
                },
                Edit::AddMask {
                    node: root,
                    pattern: "[".into(),
                    props: MaskProps::default(),
                    ord: 0,
                },
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Integrity(IntegrityError::InvalidPattern { .. })
        ));
        assert_eq!(catalog.version(), before.version());
        assert!(!catalog.can_do(None, docs, Operation::Read, 0));
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let (catalog, _, docs) = seeded();
        let held = catalog.snapshot();
        let outcome = catalog.apply(&Edit::DeleteNode { id: docs }).unwrap();
        assert_eq!(outcome, EditOutcome::NodesDeleted(vec![docs]));

        assert!(held.tree().get_node(docs).is_some());
        assert!(catalog.snapshot().tree().get_node(docs).is_none());
    }

    #[test]
    fn test_mask_outcome_reports_seq() {
        let (catalog, root, _) = seeded();
        let outcome = catalog
            .apply(&Edit::AddMask {
                node: root,
                pattern: "*".into(),
                props: MaskProps::default(),
                ord: 0,
            })
            .unwrap();
        let EditOutcome::MaskAdded(seq) = outcome else {
            panic!("expected MaskAdded, got {outcome:?}");
        };
        catalog.apply(&Edit::RemoveMask { seq }).unwrap();
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let (catalog, root, docs) = seeded();
        catalog
            .apply(&Edit::SetPermission {
                node: root,
                operation: Operation::Read,
                who: WhoCan::Anyone,
            })
            .unwrap();
        let catalog = Arc::new(catalog);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let catalog = Arc::clone(&catalog);
                s.spawn(move || {
                    for _ in 0..200 {
                        let snap = catalog.snapshot();
                        let resolver = snap.resolver(ResolverOptions::default());
                        let path_ok = snap.tree().path(docs).is_ok();
                        let result = resolver.check(None, docs, Operation::Read, 0);
                        // Either the node is there and readable, or gone entirely.
                        match result {
                            Ok(allowed) => assert!(path_ok && allowed),
                            Err(AclError::Vfs(_)) => assert!(!path_ok),
                            Err(e) => panic!("unexpected: {e}"),
                        }
                    }
                });
            }
            s.spawn(|| {
                catalog.apply(&Edit::DeleteNode { id: docs }).unwrap();
            });
        });
        assert!(catalog.snapshot().tree().get_node(docs).is_none());
    }
}
