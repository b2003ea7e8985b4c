//! Who is calling. The scheduler only needs a username and whether it may approve runs.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::Deserialize;

use crate::scheduler::Caller;

pub trait Authenticator: Send + Sync {
    /// `None` when the credentials are not accepted.
    fn authenticate(&self, username: &str, password: &str) -> Option<Caller>;
}

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    password: String,
    #[serde(default)]
    approver: bool,
    #[serde(default)]
    blocked: bool,
}

/// Users read from a TOML table:
///
/// ```toml
/// [users.alice]
/// password = "secret"
/// approver = true
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserTable {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, username: &str, password: &str, approver: bool) -> Self {
        self.users.insert(
            username.to_string(),
            UserEntry {
                password: password.to_string(),
                approver,
                blocked: false,
            },
        );
        self
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid user table")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read user table {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for UserTable {
    fn authenticate(&self, username: &str, password: &str) -> Option<Caller> {
        let entry = self.users.get(username)?;
        (!entry.blocked && entry.password == password).then(|| Caller {
            username: username.to_string(),
            can_approve: entry.approver,
        })
    }
}

/// Accepts any non-empty credentials and grants no approval rights. For local fleets without
/// a user table.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl Authenticator for OpenAccess {
    fn authenticate(&self, username: &str, password: &str) -> Option<Caller> {
        (!username.is_empty() && !password.is_empty()).then(|| Caller::user(username))
    }
}
