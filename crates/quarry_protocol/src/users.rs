//! Read-only user lookup.
//!
//! Authentication and the user directory live outside the core; the core
//! only resolves user ids to check rights and bundle references.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl User {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email: None,
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(user_id, name)
        }
    }
}

/// Read-only lookup into the external user directory.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, user_id: &str) -> Option<User>;

    fn exists(&self, user_id: &str) -> bool {
        self.lookup(user_id).is_some()
    }
}

/// In-memory directory used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let directory = Self::new();
        for user in users {
            directory.insert(user);
        }
        directory
    }

    pub fn insert(&self, user: User) {
        self.users
            .write()
            .expect("user directory lock poisoned")
            .insert(user.user_id.clone(), user);
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn lookup(&self, user_id: &str) -> Option<User> {
        self.users
            .read()
            .expect("user directory lock poisoned")
            .get(user_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let directory = MemoryUserDirectory::with_users([
            User::new("u1", "Some User"),
            User::admin("root", "Admin"),
        ]);
        assert!(directory.exists("u1"));
        assert!(directory.lookup("root").unwrap().is_admin);
        assert!(directory.lookup("nobody").is_none());
    }
}
