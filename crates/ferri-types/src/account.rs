//! Account and membership types.
//!
//! An `Account` is either a user that can log in or a group that other
//! accounts belong to. Groups are accounts with `is_group` set; they carry
//! no credential material. A `Membership` is a directed edge from an account
//! (user or group) to a group.

use serde::{Deserialize, Serialize};

use crate::ids::AccountId;

/// A user or group account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Unique login / group name. This is what `who` lists refer to.
    pub username: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub ignore_limits: bool,
    #[serde(default)]
    pub disabled: bool,
    /// Expiry as Unix millis. Expired accounts are vetoed at resolution time.
    #[serde(default)]
    pub expire: Option<u64>,
    /// Network restriction, e.g. `"10.0.0.0/8|192.168.*"`.
    #[serde(default)]
    pub allow_net: Option<String>,
    /// Where to send the account after login.
    #[serde(default)]
    pub redirect: Option<String>,
    /// Opaque credential hash. Always `None` for groups.
    #[serde(default)]
    pub credential: Option<String>,
}

impl Account {
    /// A plain user account with a fresh ID.
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(),
            username: username.into(),
            is_group: false,
            admin: false,
            ignore_limits: false,
            disabled: false,
            expire: None,
            allow_net: None,
            redirect: None,
            credential: None,
        }
    }

    /// A group account with a fresh ID.
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            is_group: true,
            ..Self::user(name)
        }
    }

    /// Whether the account may act at time `now` (Unix millis).
    ///
    /// False when disabled or when `expire` lies strictly before `now`.
    pub fn is_usable(&self, now: u64) -> bool {
        if self.disabled {
            return false;
        }
        match self.expire {
            Some(expire) => expire >= now,
            None => true,
        }
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_group {
            write!(f, "{} (group)", self.username)
        } else {
            write!(f, "{}", self.username)
        }
    }
}

/// Directed membership edge: `account` belongs to `group`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub account: AccountId,
    pub group: AccountId,
}
