//! Permission resolver.
//!
//! Answers "may this caller perform this operation on this node" over an
//! [`AccountStore`] and a [`TreeStore`].
//!
//! ## Precedence
//!
//! Walking root → leaf, every node has at most one *local* rule per
//! operation: its explicit [`NodePermission`](ferri_types::NodePermission),
//! or failing that the value contributed by the masks that matched it.
//!
//! ```text
//! ancestor local rule  → becomes the inherited rule (read with `children`)
//! leaf local rule      → decides (read with `this`)
//! no leaf rule         → inherited rule decides
//! nothing anywhere     → deny
//! ```
//!
//! Deeper beats shallower, explicit beats mask at the same node, and the
//! first matching mask beats later ones. `can_<op>` delegates to another
//! operation on the same node for the same caller. Delegation and mask
//! nesting share one depth cap; every configuration error fails closed.

use std::collections::HashSet;

use ferri_types::{AccountId, MaskProps, NodeId, Operation, Scope, VfsNode, WhoCan};
use serde::Serialize;

use crate::accounts::AccountStore;
use crate::error::AclError;
use crate::mask::MaskEngine;
use crate::vfs::TreeStore;

/// Default cap on delegation and mask nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Resolver tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Whether mask globs match case-sensitively.
    pub case_sensitive: bool,
    pub max_depth: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Where a decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleSource {
    /// Explicit permission row on the requested node.
    Explicit,
    /// Mask matched on the requested node.
    Mask,
    /// An ancestor's rule, read with its `children` branch.
    Inherited { from_mask: bool },
    /// No rule anywhere on the path.
    Default,
    /// Disabled or expired account.
    Vetoed,
}

/// A decision with its provenance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Explanation {
    pub allowed: bool,
    pub operation: Operation,
    pub source: RuleSource,
    /// Node carrying the deciding rule.
    pub node: Option<NodeId>,
    /// The deciding descriptor, before scope selection.
    pub who: Option<WhoCan>,
}

impl Explanation {
    fn without_rule(operation: Operation, source: RuleSource) -> Self {
        Self {
            allowed: false,
            operation,
            source,
            node: None,
            who: None,
        }
    }
}

/// The caller's identity, resolved once per request.
#[derive(Debug, Default)]
struct Caller {
    /// Own username plus every transitive group name. Empty when anonymous.
    names: HashSet<String>,
}

/// One node on the path with the mask properties it matched.
struct Level<'t> {
    node: &'t VfsNode,
    mask: MaskProps,
}

/// A local rule and where it is declared.
struct Rule {
    who: WhoCan,
    node: NodeId,
    from_mask: bool,
}

/// Stateless resolver over borrowed stores.
pub struct PermissionResolver<'a, A: AccountStore + ?Sized, T: TreeStore + ?Sized> {
    accounts: &'a A,
    tree: &'a T,
    masks: MaskEngine,
    max_depth: usize,
}

impl<'a, A: AccountStore + ?Sized, T: TreeStore + ?Sized> PermissionResolver<'a, A, T> {
    pub fn new(accounts: &'a A, tree: &'a T, options: ResolverOptions) -> Self {
        Self {
            accounts,
            tree,
            masks: MaskEngine::new(options.case_sensitive, options.max_depth),
            max_depth: options.max_depth,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// The decision, or the configuration error that prevents one.
    ///
    /// `account` is `None` for anonymous requests. An unknown id is treated
    /// the same way.
    pub fn check(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> Result<bool, AclError> {
        Ok(self.explain(account, node, operation, now)?.allowed)
    }

    /// Like [`check`](Self::check) with the operation as text.
    pub fn check_str(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: &str,
        now: u64,
    ) -> Result<bool, AclError> {
        let op = Operation::from_str(operation)
            .ok_or_else(|| AclError::UnknownOperation(operation.to_string()))?;
        self.check(account, node, op, now)
    }

    /// Boolean decision. Configuration errors deny and are logged.
    pub fn can_do(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> bool {
        self.check(account, node, operation, now)
            .unwrap_or_else(|e| Self::report(&e, node, operation.as_str()))
    }

    /// [`can_do`](Self::can_do) with the operation as text.
    pub fn can_do_str(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: &str,
        now: u64,
    ) -> bool {
        self.check_str(account, node, operation, now)
            .unwrap_or_else(|e| Self::report(&e, node, operation))
    }

    /// Decision with the rule that produced it.
    pub fn explain(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        operation: Operation,
        now: u64,
    ) -> Result<Explanation, AclError> {
        let caller = match self.identify(account, now) {
            Some(caller) => caller,
            None => {
                tracing::debug!(account = ?account, %node, "account disabled or expired, vetoed");
                return Ok(Explanation::without_rule(operation, RuleSource::Vetoed));
            }
        };

        let levels = self.collect_levels(node)?;
        let decision = self.decide(&levels, &caller, operation, 0)?;
        tracing::debug!(
            %node,
            operation = %operation,
            allowed = decision.allowed,
            source = ?decision.source,
            "permission decided"
        );
        Ok(decision)
    }

    /// Scalar properties of `node`: its own `mime`/`accept`, then whatever
    /// the masks on its path contributed.
    pub fn effective_props(&self, node: NodeId) -> Result<MaskProps, AclError> {
        let levels = self.collect_levels(node)?;
        let Some(leaf) = levels.last() else {
            return Ok(MaskProps::default());
        };
        let mut props = MaskProps {
            mime: leaf.node.mime.clone(),
            accept: leaf.node.accept.clone(),
            ..MaskProps::default()
        };
        props.fill_from(&leaf.mask);
        Ok(props)
    }

    /// Ordered children of `node` the caller may `see`.
    pub fn visible_children(
        &self,
        account: Option<AccountId>,
        node: NodeId,
        now: u64,
    ) -> Result<Vec<(String, NodeId)>, AclError> {
        let mut visible = Vec::new();
        for (name, child) in self.tree.children(node)? {
            if self.can_do(account, child.id, Operation::See, now) {
                visible.push((name, child.id));
            }
        }
        Ok(visible)
    }

    fn report(err: &AclError, node: NodeId, operation: &str) -> bool {
        tracing::warn!(
            %node,
            operation,
            kind = err.kind(),
            error = %err,
            "permission configuration error, denying"
        );
        false
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// `None` when the account exists but is vetoed.
    fn identify(&self, account: Option<AccountId>, now: u64) -> Option<Caller> {
        let Some(id) = account else {
            return Some(Caller::default());
        };
        match self.accounts.get_account(id) {
            None => {
                tracing::debug!(account = %id, "unknown account, treating as anonymous");
                Some(Caller::default())
            }
            Some(found) if !found.is_usable(now) => None,
            Some(_) => Some(Caller {
                names: self.accounts.identity_names(id),
            }),
        }
    }

    /// Path from the root with the mask properties each node matched.
    fn collect_levels(&self, node: NodeId) -> Result<Vec<Level<'a>>, AclError> {
        let tree: &'a T = self.tree;
        let path = tree.path(node)?;
        let last = path.len().saturating_sub(1);
        let mut levels = Vec::with_capacity(path.len());
        let mut active = Vec::new();

        for (i, current) in path.into_iter().enumerate() {
            let mut mask = MaskProps::default();
            let mut nested = Vec::new();
            if i > 0 {
                let matched = self.masks.apply(&active, &tree.display_name(current))?;
                mask = matched.props;
                nested = matched.nested;
            }
            if i < last {
                active = self.masks.rules_for(tree, current.id)?;
                active.extend(nested);
            }
            levels.push(Level { node: current, mask });
        }
        Ok(levels)
    }

    /// Explicit row, else mask value.
    fn local_rule(&self, level: &Level<'_>, operation: Operation) -> Result<Option<Rule>, AclError> {
        let node = level.node.id;
        if let Some(row) = self
            .tree
            .get_permissions(node)
            .into_iter()
            .find(|p| p.operation == operation)
        {
            let who = row.descriptor().map_err(|source| AclError::MalformedWho {
                node,
                operation,
                source,
            })?;
            return Ok(Some(Rule {
                who,
                node,
                from_mask: false,
            }));
        }
        Ok(level.mask.get(operation).map(|who| Rule {
            who: who.clone(),
            node,
            from_mask: true,
        }))
    }

    fn decide(
        &self,
        levels: &[Level<'_>],
        caller: &Caller,
        operation: Operation,
        depth: usize,
    ) -> Result<Explanation, AclError> {
        if depth > self.max_depth {
            return Err(AclError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        let Some((leaf, ancestors)) = levels.split_last() else {
            return Ok(Explanation::without_rule(operation, RuleSource::Default));
        };

        if let Some(rule) = self.local_rule(leaf, operation)? {
            let source = if rule.from_mask {
                RuleSource::Mask
            } else {
                RuleSource::Explicit
            };
            return self.conclude(levels, caller, operation, rule, Scope::This, source, depth);
        }

        let mut inherited = None;
        for level in ancestors {
            if let Some(rule) = self.local_rule(level, operation)? {
                inherited = Some(rule);
            }
        }
        match inherited {
            Some(rule) => {
                let source = RuleSource::Inherited {
                    from_mask: rule.from_mask,
                };
                self.conclude(levels, caller, operation, rule, Scope::Children, source, depth)
            }
            None => Ok(Explanation::without_rule(operation, RuleSource::Default)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn conclude(
        &self,
        levels: &[Level<'_>],
        caller: &Caller,
        operation: Operation,
        rule: Rule,
        scope: Scope,
        source: RuleSource,
        depth: usize,
    ) -> Result<Explanation, AclError> {
        let allowed = self.evaluate(&rule.who, scope, levels, caller, depth)?;
        Ok(Explanation {
            allowed,
            operation,
            source,
            node: Some(rule.node),
            who: Some(rule.who),
        })
    }

    fn evaluate(
        &self,
        who: &WhoCan,
        scope: Scope,
        levels: &[Level<'_>],
        caller: &Caller,
        depth: usize,
    ) -> Result<bool, AclError> {
        let Some(branch) = who.for_scope(scope) else {
            return Ok(false);
        };
        match branch {
            WhoCan::Fixed(allowed) => Ok(*allowed),
            WhoCan::Anyone => Ok(true),
            WhoCan::Accounts(names) => Ok(names.iter().any(|n| caller.names.contains(n))),
            WhoCan::Delegate(other) => {
                Ok(self.decide(levels, caller, *other, depth + 1)?.allowed)
            }
            nested @ WhoCan::Scoped { .. } => {
                if depth + 1 > self.max_depth {
                    return Err(AclError::DepthExceeded {
                        limit: self.max_depth,
                    });
                }
                self.evaluate(nested, scope, levels, caller, depth + 1)
            }
        }
    }
}
