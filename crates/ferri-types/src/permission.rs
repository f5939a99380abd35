//! Operations and `who` descriptors.
//!
//! A node permission row names one [`Operation`] and a [`WhoCan`] descriptor
//! stored as JSON text. The descriptor is polymorphic on the wire:
//!
//! ```text
//! true | false                      unconditional grant / deny
//! "*"                               any request, anonymous included
//! ["amy", "staff"]                  these accounts, or members of these groups
//! "can_read"                        whatever `read` resolves to on the same node
//! {"this": <who>, "children": <who>} split between the node and its descendants
//! ```
//!
//! In memory it is a sum type; [`RawWho`] is the untagged serde shape that
//! gets validated into it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::NodeId;

/// Prefix that turns an operation name into a `who` delegation string.
pub const CAN_PREFIX: &str = "can_";

/// An operation that a permission row governs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Operation {
    Read,
    See,
    Upload,
    List,
    Archive,
    Delete,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Operation; 6] = [
        Operation::Read,
        Operation::See,
        Operation::Upload,
        Operation::List,
        Operation::Archive,
        Operation::Delete,
    ];

    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Parse a `can_<op>` key.
    pub fn from_can_key(s: &str) -> Option<Self> {
        s.strip_prefix(CAN_PREFIX).and_then(Self::from_str)
    }

    /// The value stored in the `permission` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::See => "see",
            Operation::Upload => "upload",
            Operation::List => "list",
            Operation::Archive => "archive",
            Operation::Delete => "delete",
        }
    }

    /// The `can_<op>` spelling used in delegation strings and mask bundles.
    pub fn can_key(&self) -> String {
        format!("{CAN_PREFIX}{}", self.as_str())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of a `{this, children}` split applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Resolving for the node that carries the descriptor.
    This,
    /// Resolving for a descendant that inherits the descriptor.
    Children,
}

/// Who satisfies a permission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWho", into = "RawWho")]
pub enum WhoCan {
    /// `true` / `false`.
    Fixed(bool),
    /// `"*"`: any request, including anonymous ones.
    Anyone,
    /// Usernames or group names.
    Accounts(Vec<String>),
    /// `"can_<op>"`: reuse the decision for another operation on the same node.
    Delegate(Operation),
    /// Different answers for the node itself and for its descendants.
    /// A missing branch denies.
    Scoped {
        this: Option<Box<WhoCan>>,
        children: Option<Box<WhoCan>>,
    },
}

impl WhoCan {
    /// Parse descriptor JSON as stored in `node_permissions.who`.
    pub fn parse(json: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to the stored JSON text.
    pub fn to_json(&self) -> String {
        // RawWho only holds strings, bools and nested objects.
        serde_json::to_string(self).unwrap_or_else(|_| "false".to_string())
    }

    /// Convenience for `Accounts`.
    pub fn accounts<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Accounts(names.into_iter().map(Into::into).collect())
    }

    /// Convenience for `Scoped` with both branches present.
    pub fn scoped(this: WhoCan, children: WhoCan) -> Self {
        Self::Scoped {
            this: Some(Box::new(this)),
            children: Some(Box::new(children)),
        }
    }

    /// Pick the branch of a `Scoped` descriptor. Other variants return themselves.
    ///
    /// `None` means the branch is absent.
    pub fn for_scope(&self, scope: Scope) -> Option<&WhoCan> {
        match self {
            WhoCan::Scoped { this, children } => match scope {
                Scope::This => this.as_deref(),
                Scope::Children => children.as_deref(),
            },
            other => Some(other),
        }
    }
}

/// Errors from decoding descriptors and mask bundles.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("unrecognized who string '{0}' (expected \"*\" or \"can_<operation>\")")]
    BadWho(String),
}

/// Untagged wire shape of a `who` descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawWho {
    Bool(bool),
    Text(String),
    List(Vec<String>),
    Scoped(RawScoped),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawScoped {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this: Option<Box<RawWho>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Box<RawWho>>,
}

impl TryFrom<RawWho> for WhoCan {
    type Error = DescriptorError;

    fn try_from(raw: RawWho) -> Result<Self, Self::Error> {
        match raw {
            RawWho::Bool(b) => Ok(WhoCan::Fixed(b)),
            RawWho::List(names) => Ok(WhoCan::Accounts(names)),
            RawWho::Text(s) if s == "*" => Ok(WhoCan::Anyone),
            RawWho::Text(s) => match s.strip_prefix(CAN_PREFIX) {
                Some(op) => Operation::from_str(op)
                    .map(WhoCan::Delegate)
                    .ok_or_else(|| DescriptorError::UnknownOperation(op.to_string())),
                None => Err(DescriptorError::BadWho(s)),
            },
            RawWho::Scoped(RawScoped { this, children }) => {
                let convert = |branch: Option<Box<RawWho>>| -> Result<_, DescriptorError> {
                    branch
                        .map(|b| WhoCan::try_from(*b).map(Box::new))
                        .transpose()
                };
                Ok(WhoCan::Scoped {
                    this: convert(this)?,
                    children: convert(children)?,
                })
            }
        }
    }
}

impl From<WhoCan> for RawWho {
    fn from(who: WhoCan) -> Self {
        match who {
            WhoCan::Fixed(b) => RawWho::Bool(b),
            WhoCan::Anyone => RawWho::Text("*".to_string()),
            WhoCan::Accounts(names) => RawWho::List(names),
            WhoCan::Delegate(op) => RawWho::Text(op.can_key()),
            WhoCan::Scoped { this, children } => RawWho::Scoped(RawScoped {
                this: this.map(|w| Box::new(RawWho::from(*w))),
                children: children.map(|w| Box::new(RawWho::from(*w))),
            }),
        }
    }
}

/// One `node_permissions` row. `who` stays as stored text so a malformed
/// row surfaces as a configuration error when it is consulted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePermission {
    pub node_id: NodeId,
    pub operation: Operation,
    pub who: String,
}

impl NodePermission {
    pub fn new(node_id: NodeId, operation: Operation, who: &WhoCan) -> Self {
        Self {
            node_id,
            operation,
            who: who.to_json(),
        }
    }

    /// Decode the stored descriptor.
    pub fn descriptor(&self) -> Result<WhoCan, DescriptorError> {
        WhoCan::parse(&self.who)
    }
}
