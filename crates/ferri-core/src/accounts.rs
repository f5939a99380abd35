//! Account graph: accounts, groups and membership edges.
//!
//! [`AccountStore`] is the read seam the resolver consumes; [`AccountGraph`]
//! is the in-memory implementation held by every snapshot.
//!
//! Group resolution is a breadth-first walk over account→group edges with a
//! visited set, so membership cycles terminate and yield a finite closure.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use ferri_types::{Account, AccountId, Membership};
use ipnet::IpNet;

use crate::error::IntegrityError;

/// Read access to accounts and memberships.
pub trait AccountStore {
    fn get_account(&self, id: AccountId) -> Option<&Account>;

    fn get_account_by_username(&self, username: &str) -> Option<&Account>;

    /// Direct groups of `id` (one hop).
    fn groups_of(&self, id: AccountId) -> Vec<AccountId>;

    fn membership_edges(&self) -> Vec<Membership>;

    /// Reflexive-transitive closure of `id` over membership edges.
    ///
    /// Returns `id` itself plus every group reachable from it. An unknown
    /// account has no identity and yields an empty set.
    fn resolve_groups(&self, id: AccountId) -> BTreeSet<AccountId> {
        let mut seen = BTreeSet::new();
        if self.get_account(id).is_none() {
            return seen;
        }

        let mut queue = VecDeque::from([id]);
        seen.insert(id);
        while let Some(current) = queue.pop_front() {
            for group in self.groups_of(current) {
                if seen.insert(group) {
                    queue.push_back(group);
                }
            }
        }
        seen
    }

    /// Usernames of `id` and all its groups.
    fn identity_names(&self, id: AccountId) -> HashSet<String> {
        self.resolve_groups(id)
            .into_iter()
            .filter_map(|g| self.get_account(g).map(|a| a.username.clone()))
            .collect()
    }

    /// False for unknown, disabled or expired accounts.
    fn is_usable(&self, id: AccountId, now: u64) -> bool {
        self.get_account(id).is_some_and(|a| a.is_usable(now))
    }
}

/// In-memory account graph.
#[derive(Clone, Debug, Default)]
pub struct AccountGraph {
    accounts: HashMap<AccountId, Account>,
    by_username: HashMap<String, AccountId>,
    /// account → groups it belongs to
    edges: HashMap<AccountId, BTreeSet<AccountId>>,
}

impl AccountGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// All accounts, sorted by username.
    pub fn accounts(&self) -> Vec<&Account> {
        let mut all: Vec<&Account> = self.accounts.values().collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    /// Add a new account.
    pub fn insert(&mut self, account: Account) -> Result<(), IntegrityError> {
        if self.accounts.contains_key(&account.id) {
            return Err(IntegrityError::DuplicateAccount(account.id));
        }
        if self.by_username.contains_key(&account.username) {
            return Err(IntegrityError::DuplicateUsername(account.username));
        }
        check_fields(&account)?;
        self.by_username.insert(account.username.clone(), account.id);
        self.accounts.insert(account.id, account);
        Ok(())
    }

    /// Replace an existing account's fields (matched by id).
    pub fn update(&mut self, account: Account) -> Result<(), IntegrityError> {
        let Some(existing) = self.accounts.get(&account.id) else {
            return Err(IntegrityError::UnknownAccount(account.id));
        };
        check_fields(&account)?;
        if existing.is_group && !account.is_group && self.has_members(account.id) {
            return Err(IntegrityError::GroupHasMembers(existing.username.clone()));
        }
        if existing.username != account.username {
            if self.by_username.contains_key(&account.username) {
                return Err(IntegrityError::DuplicateUsername(account.username));
            }
            self.by_username.remove(&existing.username);
            self.by_username.insert(account.username.clone(), account.id);
        }
        self.accounts.insert(account.id, account);
        Ok(())
    }

    /// Remove an account and every membership edge touching it.
    pub fn remove(&mut self, id: AccountId) -> Result<Account, IntegrityError> {
        let account = self
            .accounts
            .remove(&id)
            .ok_or(IntegrityError::UnknownAccount(id))?;
        self.by_username.remove(&account.username);
        self.edges.remove(&id);
        for groups in self.edges.values_mut() {
            groups.remove(&id);
        }
        Ok(account)
    }

    /// Add `account → group`. The target must be a group.
    pub fn add_membership(
        &mut self,
        account: AccountId,
        group: AccountId,
    ) -> Result<(), IntegrityError> {
        if !self.accounts.contains_key(&account) {
            return Err(IntegrityError::UnknownAccount(account));
        }
        let target = self
            .accounts
            .get(&group)
            .ok_or(IntegrityError::UnknownAccount(group))?;
        if !target.is_group {
            return Err(IntegrityError::NotAGroup(target.username.clone()));
        }
        self.edges.entry(account).or_default().insert(group);
        Ok(())
    }

    /// Returns `true` if the edge existed.
    pub fn remove_membership(&mut self, account: AccountId, group: AccountId) -> bool {
        match self.edges.get_mut(&account) {
            Some(groups) => groups.remove(&group),
            None => false,
        }
    }

    fn has_members(&self, group: AccountId) -> bool {
        self.edges.values().any(|groups| groups.contains(&group))
    }

    /// Whether `addr` satisfies the account's `allow_net` restriction.
    ///
    /// Entries are separated by `|` or `,` and may be CIDR networks, bare
    /// addresses or address globs (`192.168.*`). No restriction allows all.
    pub fn allows_address(&self, id: AccountId, addr: IpAddr) -> bool {
        let Some(account) = self.accounts.get(&id) else {
            return false;
        };
        match account.allow_net.as_deref() {
            None => true,
            Some(masks) if masks.trim().is_empty() => true,
            Some(masks) => net_matches(masks, addr),
        }
    }
}

/// Row-level rules shared by insert and update.
fn check_fields(account: &Account) -> Result<(), IntegrityError> {
    if account.is_group && account.credential.is_some() {
        return Err(IntegrityError::GroupCredential(account.username.clone()));
    }
    // Stored as a signed 64-bit SQLite integer.
    if let Some(expire) = account.expire.filter(|e| i64::try_from(*e).is_err()) {
        return Err(IntegrityError::ExpireOutOfRange {
            username: account.username.clone(),
            expire,
        });
    }
    Ok(())
}

fn net_matches(masks: &str, addr: IpAddr) -> bool {
    masks.split(['|', ','])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => net.contains(&addr),
                    Err(e) => {
                        tracing::warn!(entry, error = %e, "ignoring invalid allow_net network");
                        false
                    }
                }
            } else if let Ok(exact) = entry.parse::<IpAddr>() {
                exact == addr
            } else {
                match glob::Pattern::new(entry) {
                    Ok(pattern) => pattern.matches(&addr.to_string()),
                    Err(e) => {
                        tracing::warn!(entry, error = %e, "ignoring invalid allow_net mask");
                        false
                    }
                }
            }
        })
}

impl AccountStore for AccountGraph {
    fn get_account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    fn get_account_by_username(&self, username: &str) -> Option<&Account> {
        self.by_username
            .get(username)
            .and_then(|id| self.accounts.get(id))
    }

    fn groups_of(&self, id: AccountId) -> Vec<AccountId> {
        self.edges
            .get(&id)
            .map(|groups| groups.iter().copied().collect())
            .unwrap_or_default()
    }

    fn membership_edges(&self) -> Vec<Membership> {
        let mut edges: Vec<Membership> = self
            .edges
            .iter()
            .flat_map(|(&account, groups)| {
                groups.iter().map(move |&group| Membership { account, group })
            })
            .collect();
        edges.sort_by_key(|m| (m.account, m.group));
        edges
    }
}
