// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Arena node storage and structural tree discipline
//!
//! Nodes live in a flat table addressed by [`NodeId`]; parent links are ids,
//! children are an insertion-ordered, name-keyed map. All structural edits go
//! through [`attach_child`] / [`detach_child`], which enforce the tree
//! invariants: unique sibling names, no cycles, the root never reparented.
//!
//! Each node carries a reentrant transaction lock. Multi-step operations
//! (merges, copy-with-rename) hold it across their table critical sections so
//! concurrent structural operations on the same directory serialize.

use indexmap::IndexMap;
use parking_lot::ReentrantMutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::content::FileContent;
use crate::error::{FsError, FsResult};
use crate::types::{now_millis, NodeId, NodeType, Permission, PermissionSet, Role, UserId};

pub(crate) type NodeTable = HashMap<NodeId, Node>;

/// Node payload: directories own children, files own content
#[derive(Debug)]
pub(crate) enum NodeKind {
    Directory {
        children: IndexMap<String, NodeId>,
    },
    File {
        content: Arc<FileContent>,
    },
}

impl NodeKind {
    pub(crate) fn directory() -> Self {
        NodeKind::Directory {
            children: IndexMap::new(),
        }
    }

    pub(crate) fn file(chunk_size: usize) -> Self {
        NodeKind::File {
            content: Arc::new(FileContent::new(chunk_size)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) owner: UserId,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) user_perms: HashMap<UserId, PermissionSet>,
    pub(crate) role_perms: HashMap<Role, PermissionSet>,
    /// Exclusive lock bracketing multi-step structural operations.
    /// Reentrant: a thread inside a transaction may run single-step
    /// mutations without self-deadlocking.
    pub(crate) tx_lock: Arc<ReentrantMutex<()>>,
}

impl Node {
    pub(crate) fn new(id: NodeId, name: String, kind: NodeKind, owner: UserId) -> Self {
        let now = now_millis();
        Self {
            id,
            name,
            kind,
            parent: None,
            owner,
            created_at: now,
            updated_at: now,
            user_perms: HashMap::new(),
            role_perms: HashMap::new(),
            tx_lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    pub(crate) fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Directory { .. } => NodeType::Directory,
            NodeKind::File { .. } => NodeType::File,
        }
    }

    pub(crate) fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub(crate) fn children(&self) -> FsResult<&IndexMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Ok(children),
            NodeKind::File { .. } => Err(FsError::NotADirectory),
        }
    }

    pub(crate) fn child_id(&self, name: &str) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Directory { children } => children.get(name).copied(),
            NodeKind::File { .. } => None,
        }
    }

    pub(crate) fn content(&self) -> FsResult<Arc<FileContent>> {
        match &self.kind {
            NodeKind::File { content } => Ok(Arc::clone(content)),
            NodeKind::Directory { .. } => Err(FsError::NotAFile),
        }
    }

    /// Refresh the last-updated timestamp; monotonic non-decreasing
    pub(crate) fn touch(&mut self) {
        self.updated_at = self.updated_at.max(now_millis());
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
        self.touch();
    }

    pub(crate) fn user_permissions(&self, user: &UserId) -> PermissionSet {
        self.user_perms.get(user).copied().unwrap_or_default()
    }

    pub(crate) fn role_permissions(&self, role: Role) -> PermissionSet {
        self.role_perms.get(&role).copied().unwrap_or_default()
    }

    pub(crate) fn grant_user(&mut self, user: UserId, permission: Permission) {
        self.user_perms.entry(user).or_default().insert(permission);
    }

    pub(crate) fn grant_role(&mut self, role: Role, permission: Permission) {
        self.role_perms.entry(role).or_default().insert(permission);
    }

    pub(crate) fn clear_user(&mut self, user: &UserId) {
        self.user_perms.remove(user);
    }

    pub(crate) fn clear_role(&mut self, role: Role) {
        self.role_perms.remove(&role);
    }
}

/// True if `candidate` is `node` itself or lies on `node`'s parent chain
pub(crate) fn is_ancestor(nodes: &NodeTable, candidate: NodeId, node: NodeId) -> bool {
    if candidate == node {
        return true;
    }
    let mut current = nodes.get(&node).and_then(|n| n.parent);
    while let Some(id) = current {
        if id == candidate {
            return true;
        }
        current = nodes.get(&id).and_then(|n| n.parent);
    }
    false
}

/// Walk `segments` from `start`. `..` steps to the parent (the root maps it
/// to itself); anything else is an exact child lookup. Returns `None` on the
/// first segment that does not resolve.
pub(crate) fn walk_path(
    nodes: &NodeTable,
    root_id: NodeId,
    start: NodeId,
    segments: &[&str],
) -> Option<NodeId> {
    let mut current = start;
    for segment in segments {
        let node = nodes.get(&current)?;
        current = if *segment == ".." {
            if current == root_id {
                current
            } else {
                node.parent?
            }
        } else {
            node.child_id(segment)?
        };
    }
    Some(current)
}

/// Names from just below the root down to `id`; empty for the root itself
pub(crate) fn path_segments(nodes: &NodeTable, id: NodeId) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = nodes.get(&id);
    while let Some(node) = current {
        match node.parent {
            Some(parent) => {
                segments.push(node.name.clone());
                current = nodes.get(&parent);
            }
            None => break,
        }
    }
    segments.reverse();
    segments
}

/// Slash-joined absolute path; `/` for the root
pub(crate) fn path_string(nodes: &NodeTable, id: NodeId) -> String {
    let segments = path_segments(nodes, id);
    if segments.is_empty() {
        "/".to_string()
    } else {
        segments.join("/")
    }
}

/// Count of nodes in the subtree rooted at `id`, including `id`
pub(crate) fn subtree_size(nodes: &NodeTable, id: NodeId) -> usize {
    let Some(node) = nodes.get(&id) else {
        return 0;
    };
    match &node.kind {
        NodeKind::Directory { children } => {
            1 + children.values().map(|child| subtree_size(nodes, *child)).sum::<usize>()
        }
        NodeKind::File { .. } => 1,
    }
}

/// Collect `id` and every descendant, parents before children
pub(crate) fn collect_subtree(nodes: &NodeTable, id: NodeId, out: &mut Vec<NodeId>) {
    out.push(id);
    if let Some(node) = nodes.get(&id) {
        if let NodeKind::Directory { children } = &node.kind {
            for child in children.values() {
                collect_subtree(nodes, *child, out);
            }
        }
    }
}

/// Drop `id` and its whole subtree from the arena
pub(crate) fn remove_subtree(nodes: &mut NodeTable, id: NodeId) {
    let mut ids = Vec::new();
    collect_subtree(nodes, id, &mut ids);
    for node_id in ids {
        nodes.remove(&node_id);
    }
}

/// Attach `child_id` under `parent_id`, detaching it from any previous
/// parent first. This is the unit of structural atomicity for reparenting:
/// callers run it under one exclusive table section.
pub(crate) fn attach_child(
    nodes: &mut NodeTable,
    parent_id: NodeId,
    child_id: NodeId,
    root_id: NodeId,
) -> FsResult<()> {
    if child_id == root_id {
        return Err(FsError::IllegalOperation(
            "cannot move the root node '/' under any other node".to_string(),
        ));
    }
    match nodes.get(&parent_id) {
        Some(parent) if parent.is_directory() => {}
        Some(_) => return Err(FsError::NotADirectory),
        None => return Err(FsError::NotFound),
    }
    if is_ancestor(nodes, child_id, parent_id) {
        return Err(FsError::IllegalOperation(
            "cannot add a node that is in the parent path as a child".to_string(),
        ));
    }

    let (child_name, old_parent) = {
        let child = nodes.get(&child_id).ok_or(FsError::NotFound)?;
        (child.name.clone(), child.parent)
    };

    if let Some(parent) = nodes.get(&parent_id) {
        if let Some(existing) = parent.child_id(&child_name) {
            if existing != child_id {
                return Err(FsError::AlreadyExists);
            }
        }
    }

    // detach from the previous parent by identity, so a rename done just
    // before re-attachment cannot leave a stale entry behind
    if let Some(old_id) = old_parent {
        if let Some(NodeKind::Directory { children }) =
            nodes.get_mut(&old_id).map(|n| &mut n.kind)
        {
            children.retain(|_, id| *id != child_id);
        }
    }

    if let Some(child) = nodes.get_mut(&child_id) {
        child.parent = Some(parent_id);
    }
    if let Some(NodeKind::Directory { children }) = nodes.get_mut(&parent_id).map(|n| &mut n.kind)
    {
        children.insert(child_name, child_id);
    }
    Ok(())
}

/// Detach `child_id` from `parent_id`. Returns the id if it was a child,
/// `None` otherwise (silent not-found, matching the removal contract).
pub(crate) fn detach_child(
    nodes: &mut NodeTable,
    parent_id: NodeId,
    child_id: NodeId,
) -> Option<NodeId> {
    let removed = match nodes.get_mut(&parent_id).map(|n| &mut n.kind) {
        Some(NodeKind::Directory { children }) => {
            let before = children.len();
            children.retain(|_, id| *id != child_id);
            children.len() != before
        }
        _ => false,
    };
    if !removed {
        return None;
    }
    if let Some(child) = nodes.get_mut(&child_id) {
        child.parent = None;
    }
    Some(child_id)
}
