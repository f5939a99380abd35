//! VFS node rows: nodes, renames, masks and host roots.

use std::net::Ipv6Addr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::permission::{DescriptorError, Operation, WhoCan};

/// One entry of the virtual filesystem.
///
/// A node is a folder, a file, or a link. It is named explicitly, or derives
/// its name from the disk path (`source_path`) or external `url` it is
/// bound to. At least one of the three must be set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsNode {
    pub id: NodeId,
    /// `None` for a tree root.
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    /// Sibling ordering: positive ranks above default, negative below.
    #[serde(default)]
    pub ord: i64,
    /// Link target.
    #[serde(default)]
    pub target: Option<String>,
    /// Upload accept filter, e.g. `"*.jpg|*.png"`.
    #[serde(default)]
    pub accept: Option<String>,
    #[serde(default)]
    pub default_child: Option<DefaultChild>,
}

/// The child served when a folder itself is requested.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultChild {
    /// An existing node.
    Node(NodeId),
    /// A relative path of effective names, resolved when first needed.
    Path(String),
}

impl VfsNode {
    fn blank(parent_id: Option<NodeId>) -> Self {
        Self {
            id: NodeId::new(),
            parent_id,
            name: None,
            source_path: None,
            url: None,
            mime: None,
            ord: 0,
            target: None,
            accept: None,
            default_child: None,
        }
    }

    /// A tree root. Roots are named so they satisfy the naming invariant.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::blank(None)
        }
    }

    /// A virtual folder or file with an explicit name.
    pub fn named(parent: NodeId, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::blank(Some(parent))
        }
    }

    /// A node bound to a disk path; its name derives from the basename.
    pub fn disk(parent: NodeId, source_path: impl Into<String>) -> Self {
        Self {
            source_path: Some(source_path.into()),
            ..Self::blank(Some(parent))
        }
    }

    /// A node bound to an external URL.
    pub fn link(parent: NodeId, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::blank(Some(parent))
        }
    }

    pub fn with_ord(mut self, ord: i64) -> Self {
        self.ord = ord;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_default_child(mut self, child: DefaultChild) -> Self {
        self.default_child = Some(child);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// The naming invariant: at least one of name / source / url.
    pub fn is_nameable(&self) -> bool {
        self.name.is_some() || self.source_path.is_some() || self.url.is_some()
    }
}

/// On-disk name of a child of `node_id` shown under a different name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRename {
    pub node_id: NodeId,
    pub original_name: String,
    pub display_name: String,
}

/// One `node_masks` row. `props` is the stored bundle JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMask {
    /// Insertion sequence; breaks `ord` ties (ascending).
    pub seq: i64,
    pub node_id: NodeId,
    pub pattern: String,
    pub props: String,
    /// Priority: higher first.
    pub ord: i64,
}

impl NodeMask {
    /// Decode the stored bundle.
    pub fn bundle(&self) -> Result<MaskProps, DescriptorError> {
        MaskProps::parse(&self.props)
    }
}

/// Properties a mask overrides on matching children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_read: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_see: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_upload: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_list: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_archive: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_delete: Option<WhoCan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
    /// Masks for the children of whatever this bundle matched, in priority order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub masks: IndexMap<String, MaskProps>,
}

impl MaskProps {
    pub fn parse(json: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    fn slot(&self, op: Operation) -> &Option<WhoCan> {
        match op {
            Operation::Read => &self.can_read,
            Operation::See => &self.can_see,
            Operation::Upload => &self.can_upload,
            Operation::List => &self.can_list,
            Operation::Archive => &self.can_archive,
            Operation::Delete => &self.can_delete,
        }
    }

    fn slot_mut(&mut self, op: Operation) -> &mut Option<WhoCan> {
        match op {
            Operation::Read => &mut self.can_read,
            Operation::See => &mut self.can_see,
            Operation::Upload => &mut self.can_upload,
            Operation::List => &mut self.can_list,
            Operation::Archive => &mut self.can_archive,
            Operation::Delete => &mut self.can_delete,
        }
    }

    /// The `can_<op>` override, if this bundle sets one.
    pub fn get(&self, op: Operation) -> Option<&WhoCan> {
        self.slot(op).as_ref()
    }

    /// Builder-style setter for `can_<op>`.
    pub fn with(mut self, op: Operation, who: WhoCan) -> Self {
        *self.slot_mut(op) = Some(who);
        self
    }

    /// Builder-style nested mask.
    pub fn with_mask(mut self, pattern: impl Into<String>, props: MaskProps) -> Self {
        self.masks.insert(pattern.into(), props);
        self
    }

    /// Fill every scalar property that is still unset from `other`.
    ///
    /// Nested masks are not merged here; callers collect them separately.
    pub fn fill_from(&mut self, other: &MaskProps) {
        for op in Operation::ALL {
            if self.slot(op).is_none() {
                *self.slot_mut(op) = other.slot(op).clone();
            }
        }
        if self.mime.is_none() {
            self.mime = other.mime.clone();
        }
        if self.accept.is_none() {
            self.accept = other.accept.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == MaskProps::default()
    }
}

/// Maps an inbound host (literal or glob) to the node its tree starts at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub host: String,
    pub node_id: NodeId,
}

impl Root {
    pub fn new(host: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            host: host.into(),
            node_id,
        }
    }

    /// Whether `host` is a glob rather than a literal.
    ///
    /// A bracketed IPv6 address (`[::1]`, `[::1]:8080`) is a literal.
    pub fn is_mask(&self) -> bool {
        if is_bracketed_ipv6(&self.host) {
            return false;
        }
        self.host.contains(['*', '?', '['])
    }
}

fn is_bracketed_ipv6(host: &str) -> bool {
    host.trim()
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .is_some_and(|(addr, _)| addr.parse::<Ipv6Addr>().is_ok())
}
