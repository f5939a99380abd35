//! Mask engine: glob rules that override properties of matching children.
//!
//! Masks are declared on a node and describe its children. While walking a
//! path, the rules active for a node's children are the node's own stored
//! masks (priority order) followed by any nested masks carried down from the
//! rules that matched the node itself:
//!
//! ```text
//! /docs            masks: "*.pdf" → {can_read: ["staff"], masks: {"*": {...}}}
//! /docs/a.pdf      matched "*.pdf" → can_read from the bundle
//!                  active for a.pdf's children: own masks ++ {"*": {...}}
//! ```
//!
//! Each property is taken from the first matching rule that sets it.
//! Nesting is capped; going past the cap is a configuration error.

use ferri_types::{MaskProps, NodeId};
use glob::{MatchOptions, Pattern};

use crate::error::AclError;
use crate::vfs::TreeStore;

/// A decoded mask, ready to match.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskRule {
    pub pattern: String,
    pub props: MaskProps,
    /// 0 for stored masks, +1 per nesting level.
    pub depth: usize,
    /// Node the outermost mask is stored on.
    pub origin: NodeId,
}

/// Result of matching one name against an active rule list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaskMatch {
    /// Merged scalar properties (first setter wins).
    pub props: MaskProps,
    /// Nested rules for the matched node's children, in priority order.
    pub nested: Vec<MaskRule>,
    /// Patterns that matched, in priority order.
    pub matched: Vec<String>,
}

/// Glob matcher with a nesting cap.
#[derive(Clone, Copy, Debug)]
pub struct MaskEngine {
    options: MatchOptions,
    max_depth: usize,
}

impl MaskEngine {
    pub fn new(case_sensitive: bool, max_depth: usize) -> Self {
        Self {
            options: MatchOptions {
                case_sensitive,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
            max_depth,
        }
    }

    /// Stored masks of `node` in priority order: `ord` descending, then
    /// insertion sequence ascending.
    pub fn rules_for<T: TreeStore + ?Sized>(
        &self,
        tree: &T,
        node: NodeId,
    ) -> Result<Vec<MaskRule>, AclError> {
        let mut rows = tree.get_masks(node);
        rows.sort_by(|a, b| b.ord.cmp(&a.ord).then(a.seq.cmp(&b.seq)));
        rows.into_iter()
            .map(|row| {
                let props = row.bundle().map_err(|source| AclError::MalformedMask {
                    node,
                    pattern: row.pattern.clone(),
                    source,
                })?;
                Ok(MaskRule {
                    pattern: row.pattern.clone(),
                    props,
                    depth: 0,
                    origin: node,
                })
            })
            .collect()
    }

    /// Glob match with this engine's case sensitivity.
    pub fn is_match(&self, pattern: &str, name: &str) -> Result<bool, AclError> {
        let compiled = Pattern::new(pattern).map_err(|e| AclError::BadPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(compiled.matches_with(name, self.options))
    }

    /// The highest-priority rule matching `name`.
    pub fn first_match<'r>(
        &self,
        rules: &'r [MaskRule],
        name: &str,
    ) -> Result<Option<&'r MaskRule>, AclError> {
        for rule in rules {
            if self.is_match(&rule.pattern, name)? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    /// Match `name` against every rule and merge what matched.
    pub fn apply(&self, rules: &[MaskRule], name: &str) -> Result<MaskMatch, AclError> {
        let mut out = MaskMatch::default();
        for rule in rules {
            if !self.is_match(&rule.pattern, name)? {
                continue;
            }
            out.props.fill_from(&rule.props);
            out.matched.push(rule.pattern.clone());

            if rule.props.masks.is_empty() {
                continue;
            }
            let depth = rule.depth + 1;
            if depth > self.max_depth {
                return Err(AclError::DepthExceeded {
                    limit: self.max_depth,
                });
            }
            out.nested
                .extend(rule.props.masks.iter().map(|(pattern, props)| MaskRule {
                    pattern: pattern.clone(),
                    props: props.clone(),
                    depth,
                    origin: rule.origin,
                }));
        }
        Ok(out)
    }
}

impl Default for MaskEngine {
    fn default() -> Self {
        Self::new(true, crate::resolver::DEFAULT_MAX_DEPTH)
    }
}
