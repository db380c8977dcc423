// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the tree engine

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Internal node ID, the arena address of a node in the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier for type safety in the filesystem API.
/// Every operation resolves relative paths and user identity against a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The type of a stored node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Directory,
    File,
    SymbolicLink,
    HardLink,
}

/// A single access right on a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    Delete,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Read => f.write_str("READ"),
            Permission::Write => f.write_str("WRITE"),
            Permission::Delete => f.write_str("DELETE"),
        }
    }
}

/// A set of access rights, stored per user and per role on each node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl PermissionSet {
    pub const fn empty() -> Self {
        Self {
            read: false,
            write: false,
            delete: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            delete: false,
        }
    }

    pub fn contains(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Delete => self.delete,
        }
    }

    pub fn insert(&mut self, permission: Permission) {
        match permission {
            Permission::Read => self.read = true,
            Permission::Write => self.write = true,
            Permission::Delete => self.delete = true,
        }
    }

    pub fn remove(&mut self, permission: Permission) {
        match permission {
            Permission::Read => self.read = false,
            Permission::Write => self.write = false,
            Permission::Delete => self.delete = false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write && !self.delete
    }
}

/// Coarse-grained identity category used for default permission grants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Root,
    Admin,
    User,
    Guest,
}

/// User identity, keys the per-user permission map on every node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of an acting user, as supplied by the user-identity capability
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub role: Role,
}

impl User {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(name),
            role,
        }
    }
}

/// Node attribute snapshot, the data behind an `ls`-style rendering
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub name: String,
    pub node_type: NodeType,
    pub owner: UserId,
    pub created_at: i64,
    pub updated_at: i64,
    /// Byte length for files, `None` for other node types
    pub len: Option<u64>,
}

/// Milliseconds since the epoch
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
