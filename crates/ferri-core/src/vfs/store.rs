//! The tree read seam.
//!
//! [`TreeStore`] exposes the raw rows (nodes, renames, permissions, masks,
//! roots) and provides the tree algorithms on top of them, so any store that
//! can answer the row lookups gets path walking, ordered listings, naming
//! and root resolution for free.

use std::cmp::Reverse;
use std::collections::HashSet;

use ferri_types::{NodeId, NodeMask, NodePermission, NodeRename, Root, VfsNode};
use glob::{MatchOptions, Pattern};

use super::error::{VfsError, VfsResult};

/// Parent chains longer than this are treated as broken.
pub const MAX_TREE_DEPTH: usize = 4096;

/// Read access to the VFS tree.
pub trait TreeStore {
    fn get_node(&self, id: NodeId) -> Option<&VfsNode>;

    /// Children of `parent`, unordered.
    fn get_children(&self, parent: NodeId) -> Vec<&VfsNode>;

    /// Renames declared on `node` for its children.
    fn get_renames(&self, node: NodeId) -> Vec<&NodeRename>;

    fn get_permissions(&self, node: NodeId) -> Vec<&NodePermission>;

    /// Masks declared on `node`, unordered.
    fn get_masks(&self, node: NodeId) -> Vec<&NodeMask>;

    /// Root entries in declaration order.
    fn get_roots(&self) -> Vec<&Root>;

    /// Ancestors of `id` from the root down to `id` inclusive.
    fn path(&self, id: NodeId) -> VfsResult<Vec<&VfsNode>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if !seen.insert(current) || chain.len() >= MAX_TREE_DEPTH {
                return Err(VfsError::broken_chain(current.to_string()));
            }
            let node = self
                .get_node(current)
                .ok_or_else(|| VfsError::not_found(current.to_string()))?;
            chain.push(node);
            cursor = node.parent_id;
        }

        chain.reverse();
        Ok(chain)
    }

    /// Name shown for `node`: explicit name, else the parent-renamed basename
    /// of its disk path, else the basename of its URL.
    fn display_name(&self, node: &VfsNode) -> String {
        if let Some(name) = &node.name {
            return name.clone();
        }
        if let Some(source) = &node.source_path {
            let base = basename(source);
            if let Some(parent) = node.parent_id {
                if let Some(rename) = self
                    .get_renames(parent)
                    .into_iter()
                    .find(|r| r.original_name == base)
                {
                    return rename.display_name.clone();
                }
            }
            return base.to_string();
        }
        node.url.as_deref().map(url_basename).unwrap_or_default()
    }

    /// [`display_name`](Self::display_name) by id.
    fn effective_name(&self, id: NodeId) -> VfsResult<String> {
        let node = self
            .get_node(id)
            .ok_or_else(|| VfsError::not_found(id.to_string()))?;
        Ok(self.display_name(node))
    }

    /// Children of `id` with their effective names, ordered by `ord`
    /// descending, then name.
    fn children(&self, id: NodeId) -> VfsResult<Vec<(String, &VfsNode)>> {
        if self.get_node(id).is_none() {
            return Err(VfsError::not_found(id.to_string()));
        }
        let mut named: Vec<(String, &VfsNode)> = self
            .get_children(id)
            .into_iter()
            .map(|child| (self.display_name(child), child))
            .collect();
        named.sort_by(|(an, a), (bn, b)| {
            (Reverse(a.ord), an.to_lowercase(), an).cmp(&(Reverse(b.ord), bn.to_lowercase(), bn))
        });
        Ok(named)
    }

    /// Walk a `/`-separated path of effective names down from `from`.
    fn resolve_path(&self, from: NodeId, path: &str) -> VfsResult<NodeId> {
        let mut current = from;
        if self.get_node(current).is_none() {
            return Err(VfsError::not_found(current.to_string()));
        }
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                return Err(VfsError::invalid_path(path));
            }
            current = self
                .get_children(current)
                .into_iter()
                .find(|child| self.display_name(child) == segment)
                .map(|child| child.id)
                .ok_or_else(|| VfsError::not_found(path))?;
        }
        Ok(current)
    }

    /// Map an inbound host to its tree root.
    ///
    /// A literal entry equal to the host wins. Otherwise the most specific
    /// matching glob (most literal characters) wins, earlier declarations
    /// breaking ties. Hosts compare case-insensitively and any `:port` is
    /// ignored. There is no default root.
    fn resolve_root(&self, host: &str) -> VfsResult<NodeId> {
        let wanted = normalize_host(host);
        let roots = self.get_roots();

        if let Some(root) = roots
            .iter()
            .find(|r| !r.is_mask() && normalize_host(&r.host) == wanted)
        {
            return Ok(root.node_id);
        }

        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let mut best: Option<(usize, &Root)> = None;
        for root in roots.iter().filter(|r| r.is_mask()) {
            let pattern = match Pattern::new(&root.host) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(host = %root.host, error = %e, "skipping invalid root mask");
                    continue;
                }
            };
            if !pattern.matches_with(&wanted, options) {
                continue;
            }
            let specificity = literal_len(&root.host);
            if best.is_none_or(|(score, _)| specificity > score) {
                best = Some((specificity, root));
            }
        }

        best.map(|(_, root)| root.node_id)
            .ok_or_else(|| VfsError::no_root(host))
    }
}

/// Last path component of a disk path (either separator).
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        return path;
    }
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

/// Last non-empty path segment of a URL, query and fragment stripped.
pub fn url_basename(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let trimmed = url[..end].trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

fn literal_len(mask: &str) -> usize {
    mask.chars().filter(|c| !matches!(c, '*' | '?' | '[' | ']')).count()
}
