//! In-memory VFS tree.
//!
//! Nodes live in an arena keyed by [`NodeId`] with parent back-references;
//! the parent → children index is derived. Each node owns its renames,
//! permissions and masks. Deleting a node removes its whole subtree together
//! with everything those nodes own, plus any root entries pointing into it.
//! `default_child` and roots are non-owning references resolved by lookup.

use std::collections::{BTreeMap, HashMap, HashSet};

use ferri_types::{
    DefaultChild, MaskProps, NodeId, NodeMask, NodePermission, NodeRename, Operation, Root,
    VfsNode, WhoCan,
};

use super::error::VfsResult;
use super::store::TreeStore;
use crate::error::IntegrityError;

/// The VFS tree and everything its nodes own.
#[derive(Clone, Debug, Default)]
pub struct VfsTree {
    nodes: HashMap<NodeId, VfsNode>,
    /// parent → children in insertion order
    children: HashMap<NodeId, Vec<NodeId>>,
    renames: HashMap<NodeId, Vec<NodeRename>>,
    permissions: HashMap<NodeId, BTreeMap<Operation, NodePermission>>,
    masks: HashMap<NodeId, Vec<NodeMask>>,
    mask_owner: HashMap<i64, NodeId>,
    roots: Vec<Root>,
    next_mask_seq: i64,
}

impl VfsTree {
    pub fn new() -> Self {
        Self {
            next_mask_seq: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, parents before children.
    pub fn nodes(&self) -> Vec<&VfsNode> {
        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_root())
            .map(|n| n.id)
            .collect();
        stack.sort();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                ordered.push(node);
            }
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        ordered
    }

    /// Sequence the next [`add_mask`](Self::add_mask) will assign.
    pub fn next_mask_seq(&self) -> i64 {
        self.next_mask_seq.max(1)
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Insert a node under an existing parent (or as a new root).
    pub fn insert_node(&mut self, node: VfsNode) -> Result<(), IntegrityError> {
        if self.nodes.contains_key(&node.id) {
            return Err(IntegrityError::DuplicateNode(node.id));
        }
        if !node.is_nameable() {
            return Err(IntegrityError::Nameless(node.id));
        }
        self.require_default_child(node.default_child.as_ref())?;
        if let Some(parent) = node.parent_id {
            if !self.nodes.contains_key(&parent) {
                return Err(IntegrityError::UnknownNode(parent));
            }
            self.children.entry(parent).or_default().push(node.id);
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Delete `id` and its subtree. Returns the removed ids, `id` first.
    pub fn delete_node(&mut self, id: NodeId) -> Result<Vec<NodeId>, IntegrityError> {
        let node = self.nodes.get(&id).ok_or(IntegrityError::UnknownNode(id))?;
        if let Some(parent) = node.parent_id {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != id);
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.remove(&current) {
                stack.extend(kids);
            }
            self.nodes.remove(&current);
            self.renames.remove(&current);
            self.permissions.remove(&current);
            if let Some(masks) = self.masks.remove(&current) {
                for mask in masks {
                    self.mask_owner.remove(&mask.seq);
                }
            }
            removed.push(current);
        }

        let gone: HashSet<NodeId> = removed.iter().copied().collect();
        self.roots.retain(|r| !gone.contains(&r.node_id));
        for node in self.nodes.values_mut() {
            if matches!(node.default_child, Some(DefaultChild::Node(child)) if gone.contains(&child))
            {
                node.default_child = None;
            }
        }

        tracing::debug!(node = %id, removed = removed.len(), "deleted subtree");
        Ok(removed)
    }

    pub fn set_default_child(
        &mut self,
        id: NodeId,
        child: Option<DefaultChild>,
    ) -> Result<(), IntegrityError> {
        self.require_default_child(child.as_ref())?;
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(IntegrityError::UnknownNode(id))?;
        node.default_child = child;
        Ok(())
    }

    /// The node served for a folder request, if any.
    pub fn default_child(&self, id: NodeId) -> VfsResult<Option<NodeId>> {
        let node = self
            .get_node(id)
            .ok_or_else(|| super::VfsError::not_found(id.to_string()))?;
        Ok(match &node.default_child {
            Some(DefaultChild::Node(child)) => self.nodes.contains_key(child).then_some(*child),
            Some(DefaultChild::Path(path)) => self.resolve_path(id, path).ok(),
            None => None,
        })
    }

    /// Pin a path-form default child to the node it now resolves to.
    pub fn settle_default_child(&mut self, id: NodeId) -> VfsResult<Option<NodeId>> {
        let resolved = self.default_child(id)?;
        if let (Some(child), Some(node)) = (resolved, self.nodes.get_mut(&id)) {
            if matches!(node.default_child, Some(DefaultChild::Path(_))) {
                node.default_child = Some(DefaultChild::Node(child));
            }
        }
        Ok(resolved)
    }

    fn require_node(&self, id: NodeId) -> Result<(), IntegrityError> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(IntegrityError::UnknownNode(id))
        }
    }

    /// Id-form default children must name an existing node. Path forms are
    /// resolved lazily and may point at nothing yet.
    fn require_default_child(&self, child: Option<&DefaultChild>) -> Result<(), IntegrityError> {
        match child {
            Some(DefaultChild::Node(id)) => self.require_node(*id),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// Set the `who` for (node, operation), replacing any previous row.
    pub fn set_permission(
        &mut self,
        node: NodeId,
        operation: Operation,
        who: &WhoCan,
    ) -> Result<Option<NodePermission>, IntegrityError> {
        self.set_permission_row(NodePermission::new(node, operation, who))
    }

    /// Store a permission row as-is. The descriptor is decoded at resolution.
    pub fn set_permission_row(
        &mut self,
        row: NodePermission,
    ) -> Result<Option<NodePermission>, IntegrityError> {
        self.require_node(row.node_id)?;
        Ok(self
            .permissions
            .entry(row.node_id)
            .or_default()
            .insert(row.operation, row))
    }

    pub fn clear_permission(&mut self, node: NodeId, operation: Operation) -> bool {
        self.permissions
            .get_mut(&node)
            .and_then(|rows| rows.remove(&operation))
            .is_some()
    }

    // ========================================================================
    // Masks
    // ========================================================================

    /// Attach a mask to `node`. Returns its sequence number.
    pub fn add_mask(
        &mut self,
        node: NodeId,
        pattern: &str,
        props: &MaskProps,
        ord: i64,
    ) -> Result<i64, IntegrityError> {
        check_patterns(pattern, props)?;
        let seq = self.next_mask_seq();
        self.insert_mask_row(NodeMask {
            seq,
            node_id: node,
            pattern: pattern.to_string(),
            props: props.to_json(),
            ord,
        })?;
        Ok(seq)
    }

    /// Store a mask row as-is, keeping its sequence number.
    pub fn insert_mask_row(&mut self, mask: NodeMask) -> Result<(), IntegrityError> {
        self.require_node(mask.node_id)?;
        if self.mask_owner.contains_key(&mask.seq) {
            return Err(IntegrityError::InvalidPattern {
                pattern: mask.pattern,
                reason: format!("sequence {} already in use", mask.seq),
            });
        }
        self.next_mask_seq = self.next_mask_seq().max(mask.seq + 1);
        self.mask_owner.insert(mask.seq, mask.node_id);
        self.masks.entry(mask.node_id).or_default().push(mask);
        Ok(())
    }

    pub fn remove_mask(&mut self, seq: i64) -> Result<NodeMask, IntegrityError> {
        let owner = self
            .mask_owner
            .remove(&seq)
            .ok_or(IntegrityError::UnknownMask(seq))?;
        let masks = self
            .masks
            .get_mut(&owner)
            .ok_or(IntegrityError::UnknownMask(seq))?;
        let index = masks
            .iter()
            .position(|m| m.seq == seq)
            .ok_or(IntegrityError::UnknownMask(seq))?;
        Ok(masks.remove(index))
    }

    // ========================================================================
    // Renames
    // ========================================================================

    /// Show the disk child `original_name` of `node` as `display_name`.
    pub fn set_rename(
        &mut self,
        node: NodeId,
        original_name: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<(), IntegrityError> {
        self.require_node(node)?;
        let original_name = original_name.into();
        let display_name = display_name.into();
        let renames = self.renames.entry(node).or_default();
        match renames.iter_mut().find(|r| r.original_name == original_name) {
            Some(existing) => existing.display_name = display_name,
            None => renames.push(NodeRename {
                node_id: node,
                original_name,
                display_name,
            }),
        }
        Ok(())
    }

    pub fn remove_rename(&mut self, node: NodeId, original_name: &str) -> bool {
        match self.renames.get_mut(&node) {
            Some(renames) => {
                let before = renames.len();
                renames.retain(|r| r.original_name != original_name);
                renames.len() != before
            }
            None => false,
        }
    }

    // ========================================================================
    // Roots
    // ========================================================================

    pub fn add_root(&mut self, root: Root) -> Result<(), IntegrityError> {
        self.require_node(root.node_id)?;
        if self
            .roots
            .iter()
            .any(|r| r.host.eq_ignore_ascii_case(&root.host))
        {
            return Err(IntegrityError::DuplicateRoot(root.host));
        }
        self.roots.push(root);
        Ok(())
    }

    pub fn remove_root(&mut self, host: &str) -> Result<Root, IntegrityError> {
        let index = self
            .roots
            .iter()
            .position(|r| r.host.eq_ignore_ascii_case(host))
            .ok_or_else(|| IntegrityError::UnknownRoot(host.to_string()))?;
        Ok(self.roots.remove(index))
    }
}

impl TreeStore for VfsTree {
    fn get_node(&self, id: NodeId) -> Option<&VfsNode> {
        self.nodes.get(&id)
    }

    fn get_children(&self, parent: NodeId) -> Vec<&VfsNode> {
        self.children
            .get(&parent)
            .map(|kids| kids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    fn get_renames(&self, node: NodeId) -> Vec<&NodeRename> {
        self.renames
            .get(&node)
            .map(|r| r.iter().collect())
            .unwrap_or_default()
    }

    fn get_permissions(&self, node: NodeId) -> Vec<&NodePermission> {
        self.permissions
            .get(&node)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    fn get_masks(&self, node: NodeId) -> Vec<&NodeMask> {
        self.masks
            .get(&node)
            .map(|m| m.iter().collect())
            .unwrap_or_default()
    }

    fn get_roots(&self) -> Vec<&Root> {
        self.roots.iter().collect()
    }
}

/// Compile `pattern` and every pattern nested inside `props`.
fn check_patterns(pattern: &str, props: &MaskProps) -> Result<(), IntegrityError> {
    let mut pending = vec![(pattern, props)];
    while let Some((pattern, props)) = pending.pop() {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(IntegrityError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            });
        }
        pending.extend(props.masks.iter().map(|(p, nested)| (p.as_str(), nested)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VfsError;

    struct Fixture {
        tree: VfsTree,
        root: NodeId,
        docs: NodeId,
        report: NodeId,
    }

    fn fixture() -> Fixture {
        let mut tree = VfsTree::new();
        let root = VfsNode::root("");
        let docs = VfsNode::named(root.id, "docs");
        let report = VfsNode::disk(docs.id, "/srv/share/report-final.pdf");
        let ids = (root.id, docs.id, report.id);
        tree.insert_node(root).unwrap();
        tree.insert_node(docs).unwrap();
        tree.insert_node(report).unwrap();
        Fixture {
            tree,
            root: ids.0,
            docs: ids.1,
            report: ids.2,
        }
    }

    #[test]
    fn test_path_root_to_leaf() {
        let f = fixture();
        let path: Vec<NodeId> = f.tree.path(f.report).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(path, vec![f.root, f.docs, f.report]);
        assert!(matches!(f.tree.path(NodeId::new()), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_effective_name_sources() {
        let mut f = fixture();
        assert_eq!(f.tree.effective_name(f.report).unwrap(), "report-final.pdf");

        f.tree.set_rename(f.docs, "report-final.pdf", "Report.pdf").unwrap();
        assert_eq!(f.tree.effective_name(f.report).unwrap(), "Report.pdf");

        let link = VfsNode::link(f.root, "https://example.com/files/setup.exe?v=2");
        let link_id = link.id;
        f.tree.insert_node(link).unwrap();
        assert_eq!(f.tree.effective_name(link_id).unwrap(), "setup.exe");
    }

    #[test]
    fn test_children_order_by_ord_then_name() {
        let mut f = fixture();
        let b = VfsNode::named(f.root, "beta");
        let a = VfsNode::named(f.root, "alpha");
        let pinned = VfsNode::named(f.root, "zeta").with_ord(10);
        let sunk = VfsNode::named(f.root, "aardvark").with_ord(-1);
        for n in [b, a, pinned, sunk] {
            f.tree.insert_node(n).unwrap();
        }
        let names: Vec<String> = f
            .tree
            .children(f.root)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["zeta", "alpha", "beta", "docs", "aardvark"]);
    }

    #[test]
    fn test_ord_does_not_affect_ancestry() {
        let mut f = fixture();
        let extra = VfsNode::named(f.docs, "extra").with_ord(100);
        let extra_id = extra.id;
        f.tree.insert_node(extra).unwrap();
        let path: Vec<NodeId> = f.tree.path(extra_id).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(path, vec![f.root, f.docs, extra_id]);
    }

    #[test]
    fn test_insert_requires_parent_and_name() {
        let mut f = fixture();
        let orphan = VfsNode::named(NodeId::new(), "orphan");
        assert!(matches!(
            f.tree.insert_node(orphan),
            Err(IntegrityError::UnknownNode(_))
        ));

        let mut nameless = VfsNode::named(f.root, "x");
        nameless.name = None;
        assert!(matches!(
            f.tree.insert_node(nameless),
            Err(IntegrityError::Nameless(_))
        ));
    }

    #[test]
    fn test_delete_cascades() {
        let mut f = fixture();
        f.tree
            .set_permission(f.report, Operation::Read, &WhoCan::Anyone)
            .unwrap();
        f.tree
            .add_mask(f.docs, "*.pdf", &MaskProps::default(), 0)
            .unwrap();
        f.tree.set_rename(f.docs, "report-final.pdf", "Report.pdf").unwrap();
        f.tree.add_root(Root::new("docs.example.com", f.docs)).unwrap();
        f.tree
            .set_default_child(f.root, Some(DefaultChild::Node(f.docs)))
            .unwrap();

        let removed = f.tree.delete_node(f.docs).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(f.tree.len(), 1);
        assert!(f.tree.get_permissions(f.report).is_empty());
        assert!(f.tree.get_masks(f.docs).is_empty());
        assert!(f.tree.get_renames(f.docs).is_empty());
        assert!(f.tree.get_roots().is_empty());
        assert!(f.tree.get_children(f.root).is_empty());
        assert_eq!(f.tree.get_node(f.root).unwrap().default_child, None);
    }

    #[test]
    fn test_permission_replaces() {
        let mut f = fixture();
        f.tree
            .set_permission(f.docs, Operation::List, &WhoCan::Fixed(true))
            .unwrap();
        let previous = f
            .tree
            .set_permission(f.docs, Operation::List, &WhoCan::Fixed(false))
            .unwrap();
        assert!(previous.is_some());
        let rows = f.tree.get_permissions(f.docs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].descriptor().unwrap(), WhoCan::Fixed(false));
        assert!(f.tree.clear_permission(f.docs, Operation::List));
        assert!(!f.tree.clear_permission(f.docs, Operation::List));
    }

    #[test]
    fn test_mask_sequences_and_removal() {
        let mut f = fixture();
        let props = MaskProps::default();
        let first = f.tree.add_mask(f.docs, "*.pdf", &props, 0).unwrap();
        let second = f.tree.add_mask(f.docs, "*.txt", &props, 0).unwrap();
        assert!(second > first);

        assert!(matches!(
            f.tree.add_mask(f.docs, "[unclosed", &props, 0),
            Err(IntegrityError::InvalidPattern { .. })
        ));

        let removed = f.tree.remove_mask(first).unwrap();
        assert_eq!(removed.pattern, "*.pdf");
        assert_eq!(f.tree.get_masks(f.docs).len(), 1);
        assert!(matches!(
            f.tree.remove_mask(first),
            Err(IntegrityError::UnknownMask(_))
        ));
    }

    #[test]
    fn test_default_child_id_must_exist() {
        let mut f = fixture();
        let ghost = NodeId::new();
        assert!(matches!(
            f.tree.set_default_child(f.docs, Some(DefaultChild::Node(ghost))),
            Err(IntegrityError::UnknownNode(id)) if id == ghost
        ));
        assert_eq!(f.tree.get_node(f.docs).unwrap().default_child, None);

        let orphan_pointer =
            VfsNode::named(f.root, "site").with_default_child(DefaultChild::Node(ghost));
        assert!(matches!(
            f.tree.insert_node(orphan_pointer),
            Err(IntegrityError::UnknownNode(_))
        ));

        f.tree
            .set_default_child(f.docs, Some(DefaultChild::Node(f.report)))
            .unwrap();
        assert_eq!(f.tree.default_child(f.docs).unwrap(), Some(f.report));
    }

    #[test]
    fn test_nested_mask_patterns_checked() {
        let mut f = fixture();
        let mut inner = MaskProps::default();
        inner.masks.insert("[".into(), MaskProps::default());
        let mut props = MaskProps::default();
        props.masks.insert("*.txt".into(), inner);

        let err = f.tree.add_mask(f.root, "docs", &props, 0).unwrap_err();
        assert!(
            matches!(&err, IntegrityError::InvalidPattern { pattern, .. } if pattern == "["),
            "got: {err}"
        );
        assert!(f.tree.get_masks(f.root).is_empty());

        props.masks.get_mut("*.txt").unwrap().masks.clear();
        f.tree.add_mask(f.root, "docs", &props, 0).unwrap();
    }

    #[test]
    fn test_default_child_lazy_path() {
        let mut f = fixture();
        f.tree
            .set_default_child(f.docs, Some(DefaultChild::Path("index.html".into())))
            .unwrap();
        assert_eq!(f.tree.default_child(f.docs).unwrap(), None);

        let index = VfsNode::named(f.docs, "index.html");
        let index_id = index.id;
        f.tree.insert_node(index).unwrap();
        assert_eq!(f.tree.settle_default_child(f.docs).unwrap(), Some(index_id));
        assert_eq!(
            f.tree.get_node(f.docs).unwrap().default_child,
            Some(DefaultChild::Node(index_id))
        );
    }

    #[test]
    fn test_resolve_path() {
        let f = fixture();
        assert_eq!(
            f.tree.resolve_path(f.root, "/docs/report-final.pdf").unwrap(),
            f.report
        );
        assert_eq!(f.tree.resolve_path(f.root, "").unwrap(), f.root);
        assert!(matches!(
            f.tree.resolve_path(f.root, "docs/../docs"),
            Err(VfsError::InvalidPath(_))
        ));
        assert!(matches!(
            f.tree.resolve_path(f.root, "nope"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_root_precedence() {
        let mut f = fixture();
        f.tree.add_root(Root::new("*.example.com", f.root)).unwrap();
        f.tree.add_root(Root::new("*.com", f.report)).unwrap();
        assert_eq!(f.tree.resolve_root("sub.example.com").unwrap(), f.root);

        f.tree.add_root(Root::new("sub.example.com", f.docs)).unwrap();
        assert_eq!(f.tree.resolve_root("SUB.example.com:443").unwrap(), f.docs);
        assert_eq!(f.tree.resolve_root("other.com").unwrap(), f.report);
        assert!(matches!(
            f.tree.resolve_root("example.org"),
            Err(VfsError::NoRoot(_))
        ));
    }

    #[test]
    fn test_resolve_root_ipv6_literal() {
        let mut f = fixture();
        f.tree.add_root(Root::new("[::1]", f.docs)).unwrap();
        f.tree.add_root(Root::new("*", f.root)).unwrap();
        assert_eq!(f.tree.resolve_root("[::1]:8080").unwrap(), f.docs);
        assert_eq!(f.tree.resolve_root("[::1]").unwrap(), f.docs);
        assert_eq!(f.tree.resolve_root("[::2]").unwrap(), f.root);
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let mut f = fixture();
        f.tree.add_root(Root::new("example.com", f.root)).unwrap();
        assert!(matches!(
            f.tree.add_root(Root::new("EXAMPLE.com", f.docs)),
            Err(IntegrityError::DuplicateRoot(_))
        ));
        f.tree.remove_root("example.com").unwrap();
        assert!(f.tree.get_roots().is_empty());
    }

    #[test]
    fn test_nodes_parents_first() {
        let f = fixture();
        let order: Vec<NodeId> = f.tree.nodes().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![f.root, f.docs, f.report]);
    }
}
