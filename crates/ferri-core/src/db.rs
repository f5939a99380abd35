//! SQLite persistence for accounts and the VFS tree.
//!
//! The tables mirror the row types one to one. Constraints the in-memory
//! stores enforce are repeated here as CHECKs, foreign keys and triggers so
//! the file stays valid when edited by other tools.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ferri_types::{
    Account, AccountId, DefaultChild, NodeId, NodeMask, NodePermission, Operation, Root, VfsNode,
};
use rusqlite::{Connection, params};
use thiserror::Error;

use crate::accounts::AccountGraph;
use crate::catalog::{Edit, EditOutcome, Snapshot};
use crate::error::IntegrityError;
use crate::vfs::{TreeStore, VfsTree};

/// Errors from loading or persisting.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored data violates an invariant: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("cannot decode {column} value '{value}'")]
    Decode { column: &'static str, value: String },
}

pub type DbResult<T> = Result<T, DbError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
-- Users and groups
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    is_group INTEGER NOT NULL DEFAULT 0 CHECK (is_group IN (0, 1)),
    admin INTEGER NOT NULL DEFAULT 0 CHECK (admin IN (0, 1)),
    ignore_limits INTEGER NOT NULL DEFAULT 0 CHECK (ignore_limits IN (0, 1)),
    disabled INTEGER NOT NULL DEFAULT 0 CHECK (disabled IN (0, 1)),
    expire INTEGER,
    allow_net TEXT,
    redirect TEXT,
    credential TEXT,
    CHECK (is_group = 0 OR credential IS NULL)
);

-- account → group edges
CREATE TABLE IF NOT EXISTS memberships (
    account_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    PRIMARY KEY (account_id, group_id),
    FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
    FOREIGN KEY (group_id) REFERENCES accounts(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_memberships_group ON memberships(group_id);

CREATE TRIGGER IF NOT EXISTS memberships_target_is_group
BEFORE INSERT ON memberships
WHEN (SELECT is_group FROM accounts WHERE id = NEW.group_id) IS NOT 1
BEGIN
    SELECT RAISE(ABORT, 'membership target is not a group');
END;

CREATE TRIGGER IF NOT EXISTS accounts_group_keeps_members
BEFORE UPDATE OF is_group ON accounts
WHEN NEW.is_group = 0 AND EXISTS (SELECT 1 FROM memberships WHERE group_id = NEW.id)
BEGIN
    SELECT RAISE(ABORT, 'group still has members');
END;

-- VFS tree
CREATE TABLE IF NOT EXISTS vfs_nodes (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    name TEXT,
    source_path TEXT,
    url TEXT,
    mime TEXT,
    ord INTEGER NOT NULL DEFAULT 0,
    target TEXT,
    accept TEXT,
    default_child_id TEXT,
    default_child_path TEXT,
    CHECK (name IS NOT NULL OR source_path IS NOT NULL OR url IS NOT NULL),
    CHECK (default_child_id IS NULL OR default_child_path IS NULL),
    FOREIGN KEY (parent_id) REFERENCES vfs_nodes(id) ON DELETE CASCADE,
    FOREIGN KEY (default_child_id) REFERENCES vfs_nodes(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_vfs_nodes_parent ON vfs_nodes(parent_id);

CREATE TABLE IF NOT EXISTS node_renames (
    node_id TEXT NOT NULL,
    original_name TEXT NOT NULL,
    display_name TEXT NOT NULL,
    PRIMARY KEY (node_id, original_name),
    FOREIGN KEY (node_id) REFERENCES vfs_nodes(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS node_permissions (
    node_id TEXT NOT NULL,
    permission TEXT NOT NULL
        CHECK (permission IN ('read', 'see', 'upload', 'list', 'archive', 'delete')),
    who TEXT NOT NULL,
    PRIMARY KEY (node_id, permission),
    FOREIGN KEY (node_id) REFERENCES vfs_nodes(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS node_masks (
    id INTEGER PRIMARY KEY,
    node_id TEXT NOT NULL,
    pattern TEXT NOT NULL,
    props TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (node_id) REFERENCES vfs_nodes(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_node_masks_node ON node_masks(node_id);

-- host → tree entry point
CREATE TABLE IF NOT EXISTS roots (
    host TEXT NOT NULL COLLATE NOCASE PRIMARY KEY,
    node_id TEXT NOT NULL,
    FOREIGN KEY (node_id) REFERENCES vfs_nodes(id) ON DELETE CASCADE
);
"#;

/// Database handle.
pub struct FerriDb {
    conn: Connection,
}

impl FerriDb {
    /// Open or create a database at the given path.
    ///
    /// File databases run in WAL mode with a busy timeout so the CLI and a
    /// server can share them.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Rebuild the in-memory state.
    pub fn load(&self) -> DbResult<Snapshot> {
        let accounts = self.load_accounts()?;
        let tree = self.load_tree()?;
        Ok(Snapshot::new(accounts, tree))
    }

    fn load_accounts(&self) -> DbResult<AccountGraph> {
        let mut graph = AccountGraph::new();

        let mut stmt = self.conn.prepare(
            "SELECT id, username, is_group, admin, ignore_limits, disabled, expire,
                    allow_net, redirect, credential
             FROM accounts ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(6)?,
                Account {
                    id: AccountId::default(),
                    username: row.get(1)?,
                    is_group: row.get(2)?,
                    admin: row.get(3)?,
                    ignore_limits: row.get(4)?,
                    disabled: row.get(5)?,
                    expire: None,
                    allow_net: row.get(7)?,
                    redirect: row.get(8)?,
                    credential: row.get(9)?,
                },
            ))
        })?;
        for row in rows {
            let (id, expire, account) = row?;
            let expire = expire
                .map(|e| {
                    u64::try_from(e).map_err(|_| DbError::Decode {
                        column: "accounts.expire",
                        value: e.to_string(),
                    })
                })
                .transpose()?;
            graph.insert(Account {
                id: parse_id("accounts.id", id)?,
                expire,
                ..account
            })?;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT account_id, group_id FROM memberships")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (account, group) = row?;
            graph.add_membership(
                parse_id("memberships.account_id", account)?,
                parse_id("memberships.group_id", group)?,
            )?;
        }
        Ok(graph)
    }

    fn load_tree(&self) -> DbResult<VfsTree> {
        let mut tree = VfsTree::new();

        // Parents must be inserted before children.
        let mut by_parent: HashMap<Option<NodeId>, Vec<VfsNode>> = HashMap::new();
        let mut total = 0usize;
        for node in self.load_nodes()? {
            by_parent.entry(node.parent_id).or_default().push(node);
            total += 1;
        }
        let mut pending = by_parent.remove(&None).unwrap_or_default();
        let mut inserted = 0usize;
        // Id-form default children usually point below their node.
        let mut pinned = Vec::new();
        while let Some(mut node) = pending.pop() {
            if let Some(kids) = by_parent.remove(&Some(node.id)) {
                pending.extend(kids);
            }
            if let Some(DefaultChild::Node(child)) = node.default_child {
                node.default_child = None;
                pinned.push((node.id, child));
            }
            tree.insert_node(node)?;
            inserted += 1;
        }
        for (id, child) in pinned {
            if tree.get_node(child).is_none() {
                tracing::warn!(node = %id, %child, "dropping default child that was not loaded");
                continue;
            }
            tree.set_default_child(id, Some(DefaultChild::Node(child)))?;
        }
        if inserted != total {
            tracing::warn!(
                skipped = total - inserted,
                "nodes unreachable from any tree root were not loaded"
            );
        }

        let mut stmt = self
            .conn
            .prepare("SELECT node_id, original_name, display_name FROM node_renames")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (node, original, display) = row?;
            tree.set_rename(parse_id("node_renames.node_id", node)?, original, display)?;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT node_id, permission, who FROM node_permissions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (node, permission, who) = row?;
            let operation = Operation::from_str(&permission).ok_or(DbError::Decode {
                column: "node_permissions.permission",
                value: permission,
            })?;
            tree.set_permission_row(NodePermission {
                node_id: parse_id("node_permissions.node_id", node)?,
                operation,
                who,
            })?;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, node_id, pattern, props, ord FROM node_masks ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (seq, node, pattern, props, ord) = row?;
            tree.insert_mask_row(NodeMask {
                seq,
                node_id: parse_id("node_masks.node_id", node)?,
                pattern,
                props,
                ord,
            })?;
        }

        // rowid order is declaration order
        let mut stmt = self
            .conn
            .prepare("SELECT host, node_id FROM roots ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (host, node) = row?;
            tree.add_root(Root::new(host, parse_id("roots.node_id", node)?))?;
        }

        Ok(tree)
    }

    fn load_nodes(&self) -> DbResult<Vec<VfsNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, name, source_path, url, mime, ord, target, accept,
                    default_child_id, default_child_path
             FROM vfs_nodes",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                VfsNode {
                    id: NodeId::default(),
                    parent_id: None,
                    name: row.get(2)?,
                    source_path: row.get(3)?,
                    url: row.get(4)?,
                    mime: row.get(5)?,
                    ord: row.get(6)?,
                    target: row.get(7)?,
                    accept: row.get(8)?,
                    default_child: None,
                },
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, parent, node, child_id, child_path) = row?;
            let default_child = match (child_id, child_path) {
                (Some(id), _) => Some(DefaultChild::Node(parse_id(
                    "vfs_nodes.default_child_id",
                    id,
                )?)),
                (None, Some(path)) => Some(DefaultChild::Path(path)),
                (None, None) => None,
            };
            nodes.push(VfsNode {
                id: parse_id("vfs_nodes.id", id)?,
                parent_id: parent
                    .map(|p| parse_id("vfs_nodes.parent_id", p))
                    .transpose()?,
                default_child,
                ..node
            });
        }
        Ok(nodes)
    }

    // =========================================================================
    // Persist
    // =========================================================================

    /// Persist one applied edit in its own transaction.
    pub fn apply(&self, edit: &Edit, outcome: &EditOutcome) -> DbResult<()> {
        self.apply_all([(edit, outcome)])
    }

    /// Persist a batch of applied edits in one transaction.
    pub fn apply_all<'e>(
        &self,
        edits: impl IntoIterator<Item = (&'e Edit, &'e EditOutcome)>,
    ) -> DbResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (edit, outcome) in edits {
            write_edit(&tx, edit, outcome)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn write_edit(conn: &Connection, edit: &Edit, outcome: &EditOutcome) -> DbResult<()> {
    match edit {
        Edit::InsertAccount { account } => {
            conn.execute(
                "INSERT INTO accounts (id, username, is_group, admin, ignore_limits, disabled,
                                       expire, allow_net, redirect, credential)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    account.id.to_string(),
                    account.username,
                    account.is_group,
                    account.admin,
                    account.ignore_limits,
                    account.disabled,
                    expire_column(account)?,
                    account.allow_net,
                    account.redirect,
                    account.credential,
                ],
            )?;
        }
        Edit::UpdateAccount { account } => {
            conn.execute(
                "UPDATE accounts SET username = ?2, is_group = ?3, admin = ?4,
                        ignore_limits = ?5, disabled = ?6, expire = ?7, allow_net = ?8,
                        redirect = ?9, credential = ?10
                 WHERE id = ?1",
                params![
                    account.id.to_string(),
                    account.username,
                    account.is_group,
                    account.admin,
                    account.ignore_limits,
                    account.disabled,
                    expire_column(account)?,
                    account.allow_net,
                    account.redirect,
                    account.credential,
                ],
            )?;
        }
        Edit::RemoveAccount { id } => {
            conn.execute("DELETE FROM accounts WHERE id = ?1", params![id.to_string()])?;
        }
        Edit::AddMembership { account, group } => {
            conn.execute(
                "INSERT OR IGNORE INTO memberships (account_id, group_id) VALUES (?1, ?2)",
                params![account.to_string(), group.to_string()],
            )?;
        }
        Edit::RemoveMembership { account, group } => {
            conn.execute(
                "DELETE FROM memberships WHERE account_id = ?1 AND group_id = ?2",
                params![account.to_string(), group.to_string()],
            )?;
        }
        Edit::InsertNode { node } => {
            let (child_id, child_path) = default_child_columns(node.default_child.as_ref());
            conn.execute(
                "INSERT INTO vfs_nodes (id, parent_id, name, source_path, url, mime, ord,
                                        target, accept, default_child_id, default_child_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    node.id.to_string(),
                    node.parent_id.map(|p| p.to_string()),
                    node.name,
                    node.source_path,
                    node.url,
                    node.mime,
                    node.ord,
                    node.target,
                    node.accept,
                    child_id,
                    child_path,
                ],
            )?;
        }
        Edit::DeleteNode { id } => {
            // Subtree, renames, permissions, masks and roots cascade.
            let removed =
                conn.execute("DELETE FROM vfs_nodes WHERE id = ?1", params![id.to_string()])?;
            if let EditOutcome::NodesDeleted(ids) = outcome {
                tracing::debug!(node = %id, rows = removed, subtree = ids.len(), "node deleted");
            }
        }
        Edit::SetDefaultChild { node, child } => {
            let (child_id, child_path) = default_child_columns(child.as_ref());
            conn.execute(
                "UPDATE vfs_nodes SET default_child_id = ?2, default_child_path = ?3 WHERE id = ?1",
                params![node.to_string(), child_id, child_path],
            )?;
        }
        Edit::SetPermission {
            node,
            operation,
            who,
        } => {
            conn.execute(
                "INSERT OR REPLACE INTO node_permissions (node_id, permission, who)
                 VALUES (?1, ?2, ?3)",
                params![node.to_string(), operation.as_str(), who.to_json()],
            )?;
        }
        Edit::ClearPermission { node, operation } => {
            conn.execute(
                "DELETE FROM node_permissions WHERE node_id = ?1 AND permission = ?2",
                params![node.to_string(), operation.as_str()],
            )?;
        }
        Edit::AddMask {
            node,
            pattern,
            props,
            ord,
        } => {
            let EditOutcome::MaskAdded(seq) = outcome else {
                return Err(DbError::Decode {
                    column: "node_masks.id",
                    value: format!("{outcome:?}"),
                });
            };
            conn.execute(
                "INSERT INTO node_masks (id, node_id, pattern, props, ord) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![seq, node.to_string(), pattern, props.to_json(), ord],
            )?;
        }
        Edit::RemoveMask { seq } => {
            conn.execute("DELETE FROM node_masks WHERE id = ?1", params![seq])?;
        }
        Edit::SetRename {
            node,
            original_name,
            display_name,
        } => {
            conn.execute(
                "INSERT OR REPLACE INTO node_renames (node_id, original_name, display_name)
                 VALUES (?1, ?2, ?3)",
                params![node.to_string(), original_name, display_name],
            )?;
        }
        Edit::RemoveRename {
            node,
            original_name,
        } => {
            conn.execute(
                "DELETE FROM node_renames WHERE node_id = ?1 AND original_name = ?2",
                params![node.to_string(), original_name],
            )?;
        }
        Edit::AddRoot { host, node } => {
            conn.execute(
                "INSERT INTO roots (host, node_id) VALUES (?1, ?2)",
                params![host, node.to_string()],
            )?;
        }
        Edit::RemoveRoot { host } => {
            conn.execute("DELETE FROM roots WHERE host = ?1", params![host])?;
        }
    }
    Ok(())
}

fn expire_column(account: &Account) -> DbResult<Option<i64>> {
    account
        .expire
        .map(|e| {
            i64::try_from(e).map_err(|_| {
                DbError::Integrity(IntegrityError::ExpireOutOfRange {
                    username: account.username.clone(),
                    expire: e,
                })
            })
        })
        .transpose()
}

fn default_child_columns(child: Option<&DefaultChild>) -> (Option<String>, Option<String>) {
    match child {
        Some(DefaultChild::Node(id)) => (Some(id.to_string()), None),
        Some(DefaultChild::Path(path)) => (None, Some(path.clone())),
        None => (None, None),
    }
}

fn parse_id<T: FromStr>(column: &'static str, value: String) -> DbResult<T> {
    value.parse().map_err(|_| DbError::Decode { column, value })
}
