// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The tree filesystem engine
//!
//! [`TreeFs`] owns the node arena and exposes every session-scoped
//! operation: path resolution against per-session working nodes, create,
//! move, copy, remove, regex search, streamed content I/O and the
//! permission surface.
//!
//! Locking protocol: the arena sits behind one `RwLock`, so a single write
//! section makes each structural mutation atomic. Around that, compound
//! operations take the reentrant transaction locks of the affected top-level
//! nodes in ascending `NodeId` order before entering the write section, so
//! two racing transfers over the same nodes serialize instead of
//! interleaving their validate-then-mutate phases. File content has its own
//! lock per node; streamed reads run with the arena lock released.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collision::NameCollisionResolver;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::node::{
    attach_child, collect_subtree, detach_child, is_ancestor, path_string, remove_subtree,
    subtree_size, walk_path, Node, NodeKind, NodeTable,
};
use crate::ops::{Operation, Relationship};
use crate::types::{
    NodeId, NodeInfo, NodeType, Permission, PermissionSet, Role, SessionId, User, UserId,
};
use crate::user::{require_user, UserSource};

/// What to do when a transferred node's name is already taken at the
/// destination: pick a fresh suffixed name, or discard the blocking node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnCollision {
    Rename,
    Overwrite,
}

/// In-memory hierarchical filesystem with per-node permissions
pub struct TreeFs {
    config: FsConfig,
    users: Arc<dyn UserSource>,
    nodes: RwLock<NodeTable>,
    root_id: NodeId,
    next_node_id: AtomicU64,
    working_nodes: RwLock<HashMap<SessionId, NodeId>>,
    collisions: NameCollisionResolver,
}

fn split_path(path: &str) -> (bool, Vec<&str>) {
    let absolute = path.starts_with('/');
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    (absolute, segments)
}

/// Root and Admin bypass per-node checks, owners hold every permission on
/// their own nodes, everyone else needs an explicit role or user grant.
fn user_can(node: &Node, user: &User, permission: Permission) -> bool {
    user.role == Role::Root
        || user.role == Role::Admin
        || node.owner == user.id
        || node.role_permissions(user.role).contains(permission)
        || node.user_permissions(&user.id).contains(permission)
}

/// Lock two transaction locks in ascending `NodeId` order. Reentrant, so
/// passing the same lock twice is harmless.
fn lock_pair<'a>(
    a: &'a ReentrantMutex<()>,
    a_id: NodeId,
    b: &'a ReentrantMutex<()>,
    b_id: NodeId,
) -> (ReentrantMutexGuard<'a, ()>, ReentrantMutexGuard<'a, ()>) {
    if a_id <= b_id {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let first = b.lock();
        let second = a.lock();
        (first, second)
    }
}

impl TreeFs {
    pub fn new(config: FsConfig, users: Arc<dyn UserSource>) -> Self {
        let root_id = NodeId(0);
        let mut root = Node::new(
            root_id,
            "/".to_string(),
            NodeKind::directory(),
            UserId::new("root"),
        );
        root.role_perms = config.role_defaults.clone();
        let mut nodes = NodeTable::new();
        nodes.insert(root_id, root);
        Self {
            config,
            users,
            nodes: RwLock::new(nodes),
            root_id,
            next_node_id: AtomicU64::new(1),
            working_nodes: RwLock::new(HashMap::new()),
            collisions: NameCollisionResolver::new(),
        }
    }

    /// Total node count, including the root
    pub fn size(&self) -> usize {
        subtree_size(&self.nodes.read(), self.root_id)
    }

    // --- path resolution ---

    fn working_id(&self, session: SessionId) -> NodeId {
        self.working_nodes
            .read()
            .get(&session)
            .copied()
            .unwrap_or(self.root_id)
    }

    fn resolve(&self, nodes: &NodeTable, working: NodeId, path: &str) -> Option<NodeId> {
        let (absolute, segments) = split_path(path);
        let start = if absolute { self.root_id } else { working };
        walk_path(nodes, self.root_id, start, &segments)
    }

    fn resolve_required(
        &self,
        nodes: &NodeTable,
        working: NodeId,
        path: &str,
    ) -> FsResult<NodeId> {
        self.resolve(nodes, working, path).ok_or(FsError::NotFound)
    }

    /// Resolve everything but the last path segment to an existing
    /// directory; returns the directory and the leaf name.
    fn resolve_parent<'a>(
        &self,
        nodes: &NodeTable,
        working: NodeId,
        path: &'a str,
    ) -> FsResult<(NodeId, &'a str)> {
        let (absolute, segments) = split_path(path);
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(FsError::InvalidArgument);
        };
        if *leaf == ".." {
            return Err(FsError::InvalidArgument);
        }
        let start = if absolute { self.root_id } else { working };
        let parent = walk_path(nodes, self.root_id, start, parents).ok_or(FsError::NotFound)?;
        match nodes.get(&parent) {
            Some(node) if node.is_directory() => Ok((parent, leaf)),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    // --- permission checks ---

    fn require_permission(
        &self,
        nodes: &NodeTable,
        id: NodeId,
        user: &User,
        permission: Permission,
    ) -> FsResult<()> {
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        if user_can(node, user, permission) {
            Ok(())
        } else {
            Err(FsError::InsufficientPermission {
                user: user.id.to_string(),
                permission,
                node: path_string(nodes, id),
            })
        }
    }

    fn require_subtree_permission(
        &self,
        nodes: &NodeTable,
        id: NodeId,
        user: &User,
        permission: Permission,
    ) -> FsResult<()> {
        let mut ids = Vec::new();
        collect_subtree(nodes, id, &mut ids);
        for node_id in ids {
            self.require_permission(nodes, node_id, user, permission)?;
        }
        Ok(())
    }

    // --- working node ---

    /// Re-anchor the session's working node. Requires READ on the target.
    pub fn select_working_node(&self, session: SessionId, path: &str) -> FsResult<String> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        self.require_permission(&nodes, id, &user, Permission::Read)?;
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory);
        }
        self.working_nodes.write().insert(session, id);
        Ok(path_string(&nodes, id))
    }

    pub fn working_node_path(&self, session: SessionId) -> FsResult<String> {
        require_user(&*self.users, session)?;
        let nodes = self.nodes.read();
        Ok(path_string(&nodes, self.working_id(session)))
    }

    // --- lookup and search ---

    pub fn node_exists(&self, session: SessionId, path: &str) -> FsResult<bool> {
        require_user(&*self.users, session)?;
        let working = self.working_id(session);
        Ok(self.resolve(&self.nodes.read(), working, path).is_some())
    }

    pub fn node_info(&self, session: SessionId, path: &str) -> FsResult<NodeInfo> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        self.require_permission(&nodes, id, &user, Permission::Read)?;
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        Ok(Self::info_of(node))
    }

    pub fn list_children(&self, session: SessionId, path: &str) -> FsResult<Vec<NodeInfo>> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        self.require_permission(&nodes, id, &user, Permission::Read)?;
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        let mut entries = Vec::new();
        for child_id in node.children()?.values() {
            if let Some(child) = nodes.get(child_id) {
                entries.push(Self::info_of(child));
            }
        }
        Ok(entries)
    }

    fn info_of(node: &Node) -> NodeInfo {
        let len = match &node.kind {
            NodeKind::File { content } => Some(content.len()),
            NodeKind::Directory { .. } => None,
        };
        NodeInfo {
            name: node.name.clone(),
            node_type: node.node_type(),
            owner: node.owner.clone(),
            created_at: node.created_at,
            updated_at: node.updated_at,
            len,
        }
    }

    /// First node under the session's working node whose path matches
    /// `pattern`, in depth-first order
    pub fn find_first_matching(
        &self,
        session: SessionId,
        pattern: &str,
    ) -> FsResult<Option<String>> {
        let user = require_user(&*self.users, session)?;
        let regex = Self::compile_pattern(pattern)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let mut matches = Vec::new();
        Self::search(&nodes, &user, working, &regex, &mut matches, true)?;
        Ok(matches.into_iter().next())
    }

    /// Every node under the session's working node whose path matches
    /// `pattern`. A node the user cannot read aborts the traversal with
    /// the permission error.
    pub fn find_all_matching(&self, session: SessionId, pattern: &str) -> FsResult<Vec<String>> {
        let user = require_user(&*self.users, session)?;
        let regex = Self::compile_pattern(pattern)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let mut matches = Vec::new();
        Self::search(&nodes, &user, working, &regex, &mut matches, false)?;
        Ok(matches)
    }

    /// A search pattern must match the whole path, not a substring of it
    fn compile_pattern(pattern: &str) -> FsResult<Regex> {
        Regex::new(&format!("^(?:{pattern})$")).map_err(|_| FsError::InvalidArgument)
    }

    fn search(
        nodes: &NodeTable,
        user: &User,
        id: NodeId,
        regex: &Regex,
        out: &mut Vec<String>,
        first_only: bool,
    ) -> FsResult<bool> {
        let Some(node) = nodes.get(&id) else {
            return Ok(false);
        };
        if !user_can(node, user, Permission::Read) {
            return Err(FsError::InsufficientPermission {
                user: user.id.to_string(),
                permission: Permission::Read,
                node: path_string(nodes, id),
            });
        }
        let path = path_string(nodes, id);
        if regex.is_match(&path) {
            out.push(path);
            if first_only {
                return Ok(true);
            }
        }
        if let NodeKind::Directory { children } = &node.kind {
            for child in children.values() {
                if Self::search(nodes, user, *child, regex, out, first_only)? && first_only {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // --- create ---

    /// Create a node at `path`. Missing intermediate directories are
    /// materialized only when `create_missing_dirs` is set; WRITE is
    /// required on every directory walked through, a taken leaf name
    /// fails, and the created node inherits the parent's permission
    /// grants. Returns the created path.
    pub fn create_node_at_path(
        &self,
        session: SessionId,
        path: &str,
        node_type: NodeType,
        create_missing_dirs: bool,
    ) -> FsResult<String> {
        let user = require_user(&*self.users, session)?;
        Relationship::ensure_legal(Some(node_type), None, Operation::Create)?;
        let working = self.working_id(session);
        let (absolute, segments) = split_path(path);
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(FsError::InvalidArgument);
        };
        if *leaf == ".." {
            return Err(FsError::InvalidArgument);
        }

        let mut nodes = self.nodes.write();
        let mut current = if absolute { self.root_id } else { working };
        for segment in parents {
            self.require_permission(&nodes, current, &user, Permission::Write)?;
            if *segment == ".." {
                current = if current == self.root_id {
                    current
                } else {
                    nodes
                        .get(&current)
                        .and_then(|n| n.parent)
                        .ok_or(FsError::NotFound)?
                };
                continue;
            }
            current = match nodes.get(&current).and_then(|n| n.child_id(segment)) {
                Some(child) => {
                    if !nodes.get(&child).is_some_and(Node::is_directory) {
                        return Err(FsError::NotADirectory);
                    }
                    child
                }
                None => {
                    if !create_missing_dirs {
                        return Err(FsError::NotFound);
                    }
                    self.insert_child(
                        &mut nodes,
                        current,
                        segment.to_string(),
                        NodeKind::directory(),
                        &user,
                    )?
                }
            };
        }

        self.require_permission(&nodes, current, &user, Permission::Write)?;
        if nodes.get(&current).and_then(|n| n.child_id(leaf)).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let kind = match node_type {
            NodeType::Directory => NodeKind::directory(),
            NodeType::File => NodeKind::file(self.config.chunk_size),
            other => {
                return Err(FsError::IllegalOperation(format!(
                    "cannot create a node of type {other:?}"
                )))
            }
        };
        let id = self.insert_child(&mut nodes, current, leaf.to_string(), kind, &user)?;
        let created = path_string(&nodes, id);
        debug!(path = created.as_str(), "created node");
        Ok(created)
    }

    /// Allocate a node owned by `user`, copy the parent's permission
    /// grants onto it, and attach it.
    fn insert_child(
        &self,
        nodes: &mut NodeTable,
        parent_id: NodeId,
        name: String,
        kind: NodeKind,
        user: &User,
    ) -> FsResult<NodeId> {
        let (user_perms, role_perms) = {
            let parent = nodes.get(&parent_id).ok_or(FsError::NotFound)?;
            (parent.user_perms.clone(), parent.role_perms.clone())
        };
        let id = self.alloc_id();
        let mut node = Node::new(id, name, kind, user.id.clone());
        node.user_perms = user_perms;
        node.role_perms = role_perms;
        nodes.insert(id, node);
        attach_child(nodes, parent_id, id, self.root_id)?;
        Ok(id)
    }

    fn alloc_id(&self) -> NodeId {
        NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed))
    }

    // --- remove ---

    /// Detach and destroy the subtree at `path`. Requires WRITE on the
    /// parent and DELETE on every node in the subtree; the root is
    /// irremovable. Sessions whose working node is destroyed fall back to
    /// the removed node's parent.
    pub fn remove_node_at_path(&self, session: SessionId, path: &str) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);

        let (node_lock, parent_lock) = {
            let nodes = self.nodes.read();
            let id = self.resolve_required(&nodes, working, path)?;
            if id == self.root_id {
                return Err(FsError::IllegalOperation(
                    "cannot remove the root node '/'".to_string(),
                ));
            }
            let parent = nodes
                .get(&id)
                .and_then(|n| n.parent)
                .ok_or(FsError::NotFound)?;
            (self.tx_lock_of(&nodes, id)?, self.tx_lock_of(&nodes, parent)?)
        };
        let _guards = lock_pair(&node_lock.0, node_lock.1, &parent_lock.0, parent_lock.1);

        let (removed, parent) = {
            let mut nodes = self.nodes.write();
            let id = self.resolve_required(&nodes, working, path)?;
            if id == self.root_id {
                return Err(FsError::IllegalOperation(
                    "cannot remove the root node '/'".to_string(),
                ));
            }
            Relationship::ensure_legal(
                nodes.get(&id).map(Node::node_type),
                None,
                Operation::Delete,
            )?;
            let parent = nodes
                .get(&id)
                .and_then(|n| n.parent)
                .ok_or(FsError::NotFound)?;
            self.require_permission(&nodes, parent, &user, Permission::Write)?;
            self.require_subtree_permission(&nodes, id, &user, Permission::Delete)?;

            detach_child(&mut nodes, parent, id);
            let mut removed = Vec::new();
            collect_subtree(&nodes, id, &mut removed);
            remove_subtree(&mut nodes, id);
            (removed, parent)
        };

        let removed: HashSet<NodeId> = removed.into_iter().collect();
        let displaced: Vec<SessionId> = {
            let working = self.working_nodes.read();
            working
                .iter()
                .filter(|(_, wid)| removed.contains(wid))
                .map(|(sid, _)| *sid)
                .collect()
        };
        // re-anchor each displaced session on the removed node's parent, or
        // on the root when its user may not read the parent
        let mut fallback = HashMap::new();
        {
            let nodes = self.nodes.read();
            for sid in displaced {
                let target = self
                    .users
                    .current_user(sid)
                    .filter(|u| {
                        self.require_permission(&nodes, parent, u, Permission::Read)
                            .is_ok()
                    })
                    .map_or(self.root_id, |_| parent);
                fallback.insert(sid, target);
            }
        }
        let mut working = self.working_nodes.write();
        for (sid, target) in fallback {
            if working.get(&sid).is_some_and(|wid| removed.contains(wid)) {
                working.insert(sid, target);
            }
        }
        drop(working);

        debug!(path, count = removed.len(), "removed subtree");
        Ok(())
    }

    // --- move and copy ---

    /// Transaction lock of a node plus its id, the lock-ordering key
    fn tx_lock_of(
        &self,
        nodes: &NodeTable,
        id: NodeId,
    ) -> FsResult<(Arc<ReentrantMutex<()>>, NodeId)> {
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        Ok((Arc::clone(&node.tx_lock), node.id))
    }

    /// Resolve both endpoints of a transfer and classify it. The anchor is
    /// the destination node when it exists, otherwise the destination's
    /// parent directory; it is what the caller takes a transaction lock on.
    fn plan_transfer(
        &self,
        nodes: &NodeTable,
        working: NodeId,
        source_path: &str,
        dest_path: &str,
        operation: Operation,
    ) -> FsResult<(NodeId, Option<NodeId>, Relationship, NodeId)> {
        let source = self.resolve(nodes, working, source_path);
        let dest = self.resolve(nodes, working, dest_path);
        let relationship = Relationship::ensure_legal(
            source.and_then(|id| nodes.get(&id)).map(Node::node_type),
            dest.and_then(|id| nodes.get(&id)).map(Node::node_type),
            operation,
        )?;
        let source = source.ok_or(FsError::NotFound)?;
        let anchor = match dest {
            Some(id) => id,
            None => self.resolve_parent(nodes, working, dest_path)?.0,
        };
        Ok((source, dest, relationship, anchor))
    }

    pub fn move_node(
        &self,
        session: SessionId,
        source_path: &str,
        dest_path: &str,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        require_user(&*self.users, session)?;
        let working = self.working_id(session);

        let (source_lock, anchor_lock) = {
            let nodes = self.nodes.read();
            let (source, dest, _, anchor) =
                self.plan_transfer(&nodes, working, source_path, dest_path, Operation::Move)?;
            if dest == Some(source) {
                warn!(source = source_path, "move onto itself is a no-op");
                return Ok(());
            }
            (self.tx_lock_of(&nodes, source)?, self.tx_lock_of(&nodes, anchor)?)
        };
        let _guards = lock_pair(&source_lock.0, source_lock.1, &anchor_lock.0, anchor_lock.1);

        let mut nodes = self.nodes.write();
        self.execute_move(&mut nodes, working, source_path, dest_path, on_collision)?;
        debug!(source = source_path, dest = dest_path, "moved node");
        Ok(())
    }

    fn execute_move(
        &self,
        nodes: &mut NodeTable,
        working: NodeId,
        source_path: &str,
        dest_path: &str,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        // revalidated under the write lock, the tree may have changed since
        // the caller planned the transfer
        let (source_id, dest_id, relationship, _) =
            self.plan_transfer(nodes, working, source_path, dest_path, Operation::Move)?;
        if dest_id == Some(source_id) {
            warn!(source = source_path, "move onto itself is a no-op");
            return Ok(());
        }
        if nodes.get(&source_id).is_some_and(|n| n.parent.is_none()) {
            return Err(FsError::IllegalOperation(
                "cannot move the root node '/'".to_string(),
            ));
        }

        match relationship {
            Relationship::FileToFile => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                let dest_parent = nodes
                    .get(&dest)
                    .and_then(|n| n.parent)
                    .ok_or(FsError::NotFound)?;
                self.place_child(nodes, dest_parent, source_id, on_collision)?;
            }
            Relationship::FileToDir => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                self.place_child(nodes, dest, source_id, on_collision)?;
            }
            Relationship::FileToNone => {
                let (parent, leaf) = self.resolve_parent(nodes, working, dest_path)?;
                if let Some(node) = nodes.get_mut(&source_id) {
                    node.rename(leaf.to_string());
                }
                self.place_child(nodes, parent, source_id, on_collision)?;
            }
            Relationship::DirToDir => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                if is_ancestor(nodes, source_id, dest) {
                    return Err(FsError::IllegalOperation(
                        "cannot move a directory into its own subtree".to_string(),
                    ));
                }
                let source_name = nodes
                    .get(&source_id)
                    .ok_or(FsError::NotFound)?
                    .name
                    .clone();
                match nodes.get(&dest).and_then(|n| n.child_id(&source_name)) {
                    Some(existing)
                        if existing != source_id
                            && nodes.get(&existing).is_some_and(Node::is_directory) =>
                    {
                        self.merge_move(nodes, source_id, existing, on_collision)?;
                    }
                    _ => {
                        self.place_child(nodes, dest, source_id, on_collision)?;
                    }
                }
            }
            other => {
                return Err(FsError::OperationNotSupported {
                    relationship: other,
                    operation: Operation::Move,
                })
            }
        }
        Ok(())
    }

    /// Merge every child of `source_id` into `dest_id`, recursing where a
    /// directory of the same name already exists, then drop the emptied
    /// source shell.
    fn merge_move(
        &self,
        nodes: &mut NodeTable,
        source_id: NodeId,
        dest_id: NodeId,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        let child_ids: Vec<NodeId> = nodes
            .get(&source_id)
            .ok_or(FsError::NotFound)?
            .children()?
            .values()
            .copied()
            .collect();
        for child in child_ids {
            let name = nodes.get(&child).ok_or(FsError::NotFound)?.name.clone();
            let existing = nodes.get(&dest_id).and_then(|n| n.child_id(&name));
            match existing {
                Some(e)
                    if nodes.get(&e).is_some_and(Node::is_directory)
                        && nodes.get(&child).is_some_and(Node::is_directory) =>
                {
                    self.merge_move(nodes, child, e, on_collision)?;
                }
                _ => {
                    self.place_child(nodes, dest_id, child, on_collision)?;
                }
            }
        }
        if let Some(parent) = nodes.get(&source_id).and_then(|n| n.parent) {
            detach_child(nodes, parent, source_id);
        }
        remove_subtree(nodes, source_id);
        Ok(())
    }

    /// Attach `child_id` under `parent_id`, resolving a name collision per
    /// policy. Overwrite discards the blocking sibling's whole subtree; a
    /// directory can never land on a file of the same name in either mode.
    fn place_child(
        &self,
        nodes: &mut NodeTable,
        parent_id: NodeId,
        child_id: NodeId,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        loop {
            let name = nodes.get(&child_id).ok_or(FsError::NotFound)?.name.clone();
            match nodes.get(&parent_id).and_then(|n| n.child_id(&name)) {
                Some(existing)
                    if existing != child_id
                        && nodes.get(&child_id).is_some_and(Node::is_directory)
                        && !nodes.get(&existing).is_some_and(Node::is_directory) =>
                {
                    return Err(FsError::IllegalOperation(format!(
                        "cannot place directory {name} over a file of the same name"
                    )));
                }
                Some(existing) if existing != child_id => match on_collision {
                    OnCollision::Rename => {
                        let fresh = self.collisions.resolve(&name);
                        if let Some(node) = nodes.get_mut(&child_id) {
                            node.rename(fresh);
                        }
                    }
                    OnCollision::Overwrite => {
                        detach_child(nodes, parent_id, existing);
                        remove_subtree(nodes, existing);
                    }
                },
                _ => return attach_child(nodes, parent_id, child_id, self.root_id),
            }
        }
    }

    pub fn copy_node(
        &self,
        session: SessionId,
        source_path: &str,
        dest_path: &str,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);

        let (source_lock, anchor_lock) = {
            let nodes = self.nodes.read();
            let (source, _, _, anchor) =
                self.plan_transfer(&nodes, working, source_path, dest_path, Operation::Copy)?;
            (self.tx_lock_of(&nodes, source)?, self.tx_lock_of(&nodes, anchor)?)
        };
        let _guards = lock_pair(&source_lock.0, source_lock.1, &anchor_lock.0, anchor_lock.1);

        let mut nodes = self.nodes.write();
        self.execute_copy(&mut nodes, working, &user, source_path, dest_path, on_collision)?;
        debug!(source = source_path, dest = dest_path, "copied node");
        Ok(())
    }

    fn execute_copy(
        &self,
        nodes: &mut NodeTable,
        working: NodeId,
        user: &User,
        source_path: &str,
        dest_path: &str,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        let (source_id, dest_id, relationship, _) =
            self.plan_transfer(nodes, working, source_path, dest_path, Operation::Copy)?;
        self.require_permission(nodes, source_id, user, Permission::Read)?;
        if let Some(dest) = dest_id {
            self.require_permission(nodes, dest, user, Permission::Write)?;
        }

        match relationship {
            Relationship::FileToFile => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                let dest_parent = nodes
                    .get(&dest)
                    .and_then(|n| n.parent)
                    .ok_or(FsError::NotFound)?;
                self.require_permission(nodes, dest_parent, user, Permission::Write)?;
                let leaf = nodes.get(&dest).ok_or(FsError::NotFound)?.name.clone();
                let copy = self.clone_subtree(nodes, source_id, &user.id)?;
                if let Some(node) = nodes.get_mut(&copy) {
                    node.rename(leaf);
                }
                self.place_or_discard(nodes, dest_parent, copy, on_collision)?;
            }
            Relationship::FileToDir => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                let copy = self.clone_subtree(nodes, source_id, &user.id)?;
                self.place_or_discard(nodes, dest, copy, on_collision)?;
            }
            Relationship::FileToNone | Relationship::DirToNone => {
                let (parent, leaf) = self.resolve_parent(nodes, working, dest_path)?;
                let copy = self.clone_subtree(nodes, source_id, &user.id)?;
                if let Some(node) = nodes.get_mut(&copy) {
                    node.rename(leaf.to_string());
                }
                self.place_or_discard(nodes, parent, copy, on_collision)?;
            }
            Relationship::DirToDir => {
                let dest = dest_id.ok_or(FsError::NotFound)?;
                let source_name = nodes
                    .get(&source_id)
                    .ok_or(FsError::NotFound)?
                    .name
                    .clone();
                match nodes.get(&dest).and_then(|n| n.child_id(&source_name)) {
                    Some(existing) if nodes.get(&existing).is_some_and(Node::is_directory) => {
                        self.merge_copy(nodes, source_id, existing, on_collision, user)?;
                    }
                    _ => {
                        let copy = self.clone_subtree(nodes, source_id, &user.id)?;
                        self.place_or_discard(nodes, dest, copy, on_collision)?;
                    }
                }
            }
            other => {
                return Err(FsError::OperationNotSupported {
                    relationship: other,
                    operation: Operation::Copy,
                })
            }
        }
        Ok(())
    }

    /// Copy counterpart of [`merge_move`]: the source subtree is left
    /// untouched, colliding files follow the collision policy.
    fn merge_copy(
        &self,
        nodes: &mut NodeTable,
        source_id: NodeId,
        dest_id: NodeId,
        on_collision: OnCollision,
        user: &User,
    ) -> FsResult<()> {
        let child_ids: Vec<NodeId> = nodes
            .get(&source_id)
            .ok_or(FsError::NotFound)?
            .children()?
            .values()
            .copied()
            .collect();
        for child in child_ids {
            let name = nodes.get(&child).ok_or(FsError::NotFound)?.name.clone();
            let existing = nodes.get(&dest_id).and_then(|n| n.child_id(&name));
            match existing {
                Some(e)
                    if nodes.get(&e).is_some_and(Node::is_directory)
                        && nodes.get(&child).is_some_and(Node::is_directory) =>
                {
                    self.merge_copy(nodes, child, e, on_collision, user)?;
                }
                _ => {
                    let copy = self.clone_subtree(nodes, child, &user.id)?;
                    self.place_or_discard(nodes, dest_id, copy, on_collision)?;
                }
            }
        }
        Ok(())
    }

    fn place_or_discard(
        &self,
        nodes: &mut NodeTable,
        parent_id: NodeId,
        copy_id: NodeId,
        on_collision: OnCollision,
    ) -> FsResult<()> {
        if let Err(err) = self.place_child(nodes, parent_id, copy_id, on_collision) {
            remove_subtree(nodes, copy_id);
            return Err(err);
        }
        Ok(())
    }

    /// Deep copy of a subtree: fresh ids, copied bytes, the acting user
    /// becomes owner of every copied node. Explicit permission grants are
    /// carried over.
    fn clone_subtree(
        &self,
        nodes: &mut NodeTable,
        id: NodeId,
        owner: &UserId,
    ) -> FsResult<NodeId> {
        let (name, kind, user_perms, role_perms, child_ids) = {
            let node = nodes.get(&id).ok_or(FsError::NotFound)?;
            let kind = match &node.kind {
                NodeKind::File { content } => NodeKind::File {
                    content: Arc::new(content.deep_copy()),
                },
                NodeKind::Directory { .. } => NodeKind::directory(),
            };
            let child_ids: Vec<NodeId> = match &node.kind {
                NodeKind::Directory { children } => children.values().copied().collect(),
                NodeKind::File { .. } => Vec::new(),
            };
            (
                node.name.clone(),
                kind,
                node.user_perms.clone(),
                node.role_perms.clone(),
                child_ids,
            )
        };
        let copy_id = self.alloc_id();
        let mut copy = Node::new(copy_id, name, kind, owner.clone());
        copy.user_perms = user_perms;
        copy.role_perms = role_perms;
        nodes.insert(copy_id, copy);
        for child in child_ids {
            let child_copy = self.clone_subtree(nodes, child, owner)?;
            let child_name = nodes
                .get(&child_copy)
                .ok_or(FsError::NotFound)?
                .name
                .clone();
            if let Some(node) = nodes.get_mut(&child_copy) {
                node.parent = Some(copy_id);
            }
            if let Some(NodeKind::Directory { children }) =
                nodes.get_mut(&copy_id).map(|n| &mut n.kind)
            {
                children.insert(child_name, child_copy);
            }
        }
        Ok(copy_id)
    }

    // --- rename ---

    /// Rename the node at `path` in place. A taken sibling name is resolved
    /// to a suffixed one; the resulting path is returned.
    pub fn rename_node(
        &self,
        session: SessionId,
        path: &str,
        new_name: &str,
    ) -> FsResult<String> {
        let user = require_user(&*self.users, session)?;
        if new_name.is_empty() || new_name.contains('/') || new_name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let working = self.working_id(session);
        let mut nodes = self.nodes.write();
        let id = self.resolve_required(&nodes, working, path)?;
        Relationship::ensure_legal(nodes.get(&id).map(Node::node_type), None, Operation::Modify)?;
        let parent = nodes.get(&id).and_then(|n| n.parent).ok_or_else(|| {
            FsError::IllegalOperation("cannot rename the root node '/'".to_string())
        })?;
        self.require_permission(&nodes, id, &user, Permission::Write)?;

        let mut name = new_name.to_string();
        loop {
            match nodes.get(&parent).and_then(|n| n.child_id(&name)) {
                Some(existing) if existing != id => name = self.collisions.resolve(&name),
                _ => break,
            }
        }
        if let Some(NodeKind::Directory { children }) =
            nodes.get_mut(&parent).map(|n| &mut n.kind)
        {
            children.retain(|_, cid| *cid != id);
            children.insert(name.clone(), id);
        }
        if let Some(node) = nodes.get_mut(&id) {
            node.rename(name);
        }
        Ok(path_string(&nodes, id))
    }

    // --- content I/O ---

    /// Stream the file's contents into `sink`. The arena lock is released
    /// before streaming, so structural operations proceed concurrently.
    pub fn read_file(
        &self,
        session: SessionId,
        path: &str,
        sink: &mut dyn Write,
    ) -> FsResult<u64> {
        let content = self.content_for(session, path, Permission::Read)?;
        content.read_to(sink)
    }

    pub fn read_file_range(
        &self,
        session: SessionId,
        path: &str,
        offset: usize,
        len: usize,
        sink: &mut dyn Write,
    ) -> FsResult<u64> {
        let content = self.content_for(session, path, Permission::Read)?;
        content.read_range_to(offset, len, sink)
    }

    /// Splice bytes drained from `source` into the file starting at `start`
    pub fn write_file(
        &self,
        session: SessionId,
        path: &str,
        source: &mut dyn Read,
        start: usize,
    ) -> FsResult<u64> {
        let (id, content) = self.content_and_id_for(session, path, Permission::Write)?;
        let written = content.write_from(source, start)?;
        if let Some(node) = self.nodes.write().get_mut(&id) {
            node.touch();
        }
        Ok(written)
    }

    pub fn file_contents(&self, session: SessionId, path: &str) -> FsResult<Vec<u8>> {
        let content = self.content_for(session, path, Permission::Read)?;
        Ok(content.contents())
    }

    pub fn set_file_contents(
        &self,
        session: SessionId,
        path: &str,
        bytes: Vec<u8>,
    ) -> FsResult<()> {
        let (id, content) = self.content_and_id_for(session, path, Permission::Write)?;
        content.set_contents(bytes);
        if let Some(node) = self.nodes.write().get_mut(&id) {
            node.touch();
        }
        Ok(())
    }

    pub fn file_len(&self, session: SessionId, path: &str) -> FsResult<u64> {
        let content = self.content_for(session, path, Permission::Read)?;
        Ok(content.len())
    }

    fn content_for(
        &self,
        session: SessionId,
        path: &str,
        permission: Permission,
    ) -> FsResult<Arc<crate::content::FileContent>> {
        Ok(self.content_and_id_for(session, path, permission)?.1)
    }

    fn content_and_id_for(
        &self,
        session: SessionId,
        path: &str,
        permission: Permission,
    ) -> FsResult<(NodeId, Arc<crate::content::FileContent>)> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        self.require_permission(&nodes, id, &user, permission)?;
        let content = nodes.get(&id).ok_or(FsError::NotFound)?.content()?;
        Ok((id, content))
    }

    // --- permissions surface ---

    /// Does the session's user hold `permission` on the node at `path`?
    /// Surfaced for outer layers that gate their own rendering.
    pub fn check_permission(
        &self,
        session: SessionId,
        path: &str,
        permission: Permission,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        self.require_permission(&nodes, id, &user, permission)
    }

    fn permission_targets(
        &self,
        nodes: &NodeTable,
        working: NodeId,
        user: &User,
        path: &str,
        recursive: bool,
    ) -> FsResult<Vec<NodeId>> {
        let id = self.resolve_required(nodes, working, path)?;
        let node = nodes.get(&id).ok_or(FsError::NotFound)?;
        let authorized =
            user.role == Role::Root || user.role == Role::Admin || node.owner == user.id;
        if !authorized {
            return Err(FsError::IllegalOperation(format!(
                "user {} may not change permissions on {}",
                user.id,
                path_string(nodes, id)
            )));
        }
        let mut ids = Vec::new();
        if recursive {
            collect_subtree(nodes, id, &mut ids);
        } else {
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn grant_user_permission(
        &self,
        session: SessionId,
        path: &str,
        target: UserId,
        permission: Permission,
        recursive: bool,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let mut nodes = self.nodes.write();
        let ids = self.permission_targets(&nodes, working, &user, path, recursive)?;
        for id in ids {
            if let Some(node) = nodes.get_mut(&id) {
                node.grant_user(target.clone(), permission);
            }
        }
        Ok(())
    }

    /// Drop every explicit grant `target` holds on the node(s)
    pub fn revoke_user_permissions(
        &self,
        session: SessionId,
        path: &str,
        target: &UserId,
        recursive: bool,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let mut nodes = self.nodes.write();
        let ids = self.permission_targets(&nodes, working, &user, path, recursive)?;
        for id in ids {
            if let Some(node) = nodes.get_mut(&id) {
                node.clear_user(target);
            }
        }
        Ok(())
    }

    pub fn grant_role_permission(
        &self,
        session: SessionId,
        path: &str,
        role: Role,
        permission: Permission,
        recursive: bool,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let mut nodes = self.nodes.write();
        let ids = self.permission_targets(&nodes, working, &user, path, recursive)?;
        for id in ids {
            if let Some(node) = nodes.get_mut(&id) {
                node.grant_role(role, permission);
            }
        }
        Ok(())
    }

    pub fn revoke_role_permissions(
        &self,
        session: SessionId,
        path: &str,
        role: Role,
        recursive: bool,
    ) -> FsResult<()> {
        let user = require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let mut nodes = self.nodes.write();
        let ids = self.permission_targets(&nodes, working, &user, path, recursive)?;
        for id in ids {
            if let Some(node) = nodes.get_mut(&id) {
                node.clear_role(role);
            }
        }
        Ok(())
    }

    pub fn user_permissions(
        &self,
        session: SessionId,
        path: &str,
        target: &UserId,
    ) -> FsResult<PermissionSet> {
        require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        Ok(nodes
            .get(&id)
            .ok_or(FsError::NotFound)?
            .user_permissions(target))
    }

    pub fn role_permissions(
        &self,
        session: SessionId,
        path: &str,
        role: Role,
    ) -> FsResult<PermissionSet> {
        require_user(&*self.users, session)?;
        let working = self.working_id(session);
        let nodes = self.nodes.read();
        let id = self.resolve_required(&nodes, working, path)?;
        Ok(nodes
            .get(&id)
            .ok_or(FsError::NotFound)?
            .role_permissions(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{MockUserSource, SessionUsers};
    use std::io::{self, Cursor};
    use std::thread;
    use std::time::Duration;

    fn engine() -> (Arc<TreeFs>, Arc<SessionUsers>, SessionId) {
        let users = Arc::new(SessionUsers::new());
        let fs = Arc::new(TreeFs::new(FsConfig::default(), users.clone()));
        let session = users.login(User::new("root", Role::Root));
        (fs, users, session)
    }

    /// root
    /// └── apple/
    ///     ├── apple.txt
    ///     └── banana/
    ///         ├── banana.txt
    ///         └── carrot/
    ///             └── carrot.txt
    fn seed_orchard(fs: &TreeFs, session: SessionId) {
        fs.create_node_at_path(session, "apple/banana/carrot", NodeType::Directory, true)
            .unwrap();
        fs.create_node_at_path(session, "apple/apple.txt", NodeType::File, true)
            .unwrap();
        fs.create_node_at_path(session, "apple/banana/banana.txt", NodeType::File, true)
            .unwrap();
        fs.create_node_at_path(session, "apple/banana/carrot/carrot.txt", NodeType::File, true)
            .unwrap();
    }

    #[test]
    fn create_builds_intermediate_directories() {
        let (fs, _, session) = engine();
        seed_orchard(&fs, session);
        assert_eq!(fs.size(), 7);
        assert!(fs.node_exists(session, "apple/banana/carrot/carrot.txt").unwrap());
        assert!(fs.node_exists(session, "/apple/banana").unwrap());
        assert!(!fs.node_exists(session, "apple/durian").unwrap());
    }

    #[test]
    fn create_fails_when_the_name_is_taken() {
        let (fs, _, session) = engine();
        assert_eq!(
            fs.create_node_at_path(session, "carrot.txt", NodeType::File, true).unwrap(),
            "carrot.txt"
        );
        assert!(matches!(
            fs.create_node_at_path(session, "carrot.txt", NodeType::File, true),
            Err(FsError::AlreadyExists)
        ));
        assert_eq!(fs.size(), 2);
    }

    #[test]
    fn create_without_the_flag_requires_existing_directories() {
        let (fs, _, session) = engine();
        assert!(matches!(
            fs.create_node_at_path(session, "a/b.txt", NodeType::File, false),
            Err(FsError::NotFound)
        ));
        assert_eq!(fs.size(), 1);
        fs.create_node_at_path(session, "a", NodeType::Directory, false).unwrap();
        fs.create_node_at_path(session, "a/b.txt", NodeType::File, false).unwrap();
    }

    #[test]
    fn copy_over_self_builds_a_collision_chain() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "carrot.txt", NodeType::File, true).unwrap();
        fs.copy_node(session, "carrot.txt", "/", OnCollision::Rename).unwrap();
        fs.copy_node(session, "carrot.txt", "/", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "carrot__1.txt").unwrap());
        assert!(fs.node_exists(session, "carrot__2.txt").unwrap());
        assert_eq!(fs.size(), 4);
    }

    #[test]
    fn create_rejects_link_types() {
        let (fs, _, session) = engine();
        assert!(matches!(
            fs.create_node_at_path(session, "link", NodeType::SymbolicLink, true),
            Err(FsError::OperationNotSupported { .. })
        ));
        assert!(matches!(
            fs.create_node_at_path(session, "link", NodeType::HardLink, true),
            Err(FsError::OperationNotSupported { .. })
        ));
    }

    #[test]
    fn operations_require_login() {
        let (fs, _, _) = engine();
        let ghost = SessionId::new(999);
        assert!(matches!(
            fs.create_node_at_path(ghost, "x", NodeType::File, true),
            Err(FsError::NotLoggedIn)
        ));
        assert!(matches!(
            fs.find_all_matching(ghost, ".*"),
            Err(FsError::NotLoggedIn)
        ));
    }

    #[test]
    fn find_matches_paths_depth_first() {
        let (fs, _, session) = engine();
        seed_orchard(&fs, session);
        let all = fs.find_all_matching(session, ".*apple.*").unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(
            fs.find_first_matching(session, ".*apple.*").unwrap().as_deref(),
            Some("apple")
        );
        let txt = fs.find_all_matching(session, r".*\.txt$").unwrap();
        assert_eq!(txt.len(), 3);
        assert!(fs.find_first_matching(session, "durian").unwrap().is_none());

        // the pattern covers the whole path, a bare name is not a substring
        // search
        assert_eq!(fs.find_all_matching(session, "apple").unwrap(), vec!["apple"]);
        assert!(fs.find_all_matching(session, "banana").unwrap().is_empty());
    }

    #[test]
    fn find_rejects_invalid_patterns() {
        let (fs, _, session) = engine();
        assert!(matches!(
            fs.find_all_matching(session, "("),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn find_aborts_on_an_unreadable_node() {
        let (fs, users, root_session) = engine();
        seed_orchard(&fs, root_session);
        let alice = users.login(User::new("alice", Role::User));

        // created nodes inherit root's role grants, so alice sees everything
        assert_eq!(fs.find_all_matching(alice, ".*apple.*").unwrap().len(), 6);

        // stripping her role from the apple subtree turns the same search
        // into a permission error rather than a silent skip
        fs.revoke_role_permissions(root_session, "apple", Role::User, true).unwrap();
        assert!(matches!(
            fs.find_all_matching(alice, ".*apple.*"),
            Err(FsError::InsufficientPermission { .. })
        ));

        fs.grant_role_permission(root_session, "apple", Role::User, Permission::Read, true)
            .unwrap();
        assert_eq!(fs.find_all_matching(alice, ".*apple.*").unwrap().len(), 6);
    }

    #[test]
    fn working_node_scopes_relative_paths() {
        let (fs, _, session) = engine();
        seed_orchard(&fs, session);
        assert_eq!(fs.working_node_path(session).unwrap(), "/");

        assert_eq!(
            fs.select_working_node(session, "apple/banana").unwrap(),
            "apple/banana"
        );
        fs.create_node_at_path(session, "date.txt", NodeType::File, true).unwrap();
        assert!(fs.node_exists(session, "/apple/banana/date.txt").unwrap());

        assert_eq!(fs.select_working_node(session, "..").unwrap(), "apple");
        assert_eq!(fs.working_node_path(session).unwrap(), "apple");
    }

    #[test]
    fn working_node_must_be_a_readable_directory() {
        let (fs, users, session) = engine();
        seed_orchard(&fs, session);
        assert!(matches!(
            fs.select_working_node(session, "apple/apple.txt"),
            Err(FsError::NotADirectory)
        ));

        let alice = users.login(User::new("alice", Role::User));
        fs.revoke_role_permissions(session, "apple", Role::User, false).unwrap();
        assert!(matches!(
            fs.select_working_node(alice, "apple"),
            Err(FsError::InsufficientPermission { .. })
        ));
    }

    #[test]
    fn working_nodes_are_session_local() {
        let (fs, users, a) = engine();
        seed_orchard(&fs, a);
        let b = users.login(User::new("root", Role::Root));

        fs.select_working_node(a, "apple/banana").unwrap();
        assert_eq!(fs.working_node_path(a).unwrap(), "apple/banana");
        assert_eq!(fs.working_node_path(b).unwrap(), "/");
    }

    #[test]
    fn remove_resets_working_nodes_in_subtree() {
        let (fs, users, a) = engine();
        seed_orchard(&fs, a);
        let b = users.login(User::new("root", Role::Root));
        fs.select_working_node(b, "apple/banana").unwrap();

        fs.remove_node_at_path(a, "apple").unwrap();
        assert_eq!(fs.size(), 1);
        assert_eq!(fs.working_node_path(b).unwrap(), "/");
    }

    #[test]
    fn removal_fallback_needs_read_on_the_parent() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "outer/inner/deep", NodeType::Directory, true)
            .unwrap();
        let alice = users.login(User::new("alice", Role::User));
        fs.select_working_node(alice, "outer/inner/deep").unwrap();

        // a readable parent picks up the displaced session
        fs.remove_node_at_path(root_session, "/outer/inner/deep").unwrap();
        assert_eq!(fs.working_node_path(alice).unwrap(), "outer/inner");

        fs.create_node_at_path(root_session, "/outer/inner/deep", NodeType::Directory, true)
            .unwrap();
        fs.select_working_node(alice, "/outer/inner/deep").unwrap();
        fs.revoke_role_permissions(root_session, "outer", Role::User, true).unwrap();

        // an unreadable one sends the session back to the root
        fs.remove_node_at_path(root_session, "/outer/inner/deep").unwrap();
        assert_eq!(fs.working_node_path(alice).unwrap(), "/");
    }

    #[test]
    fn remove_requires_delete_on_whole_subtree() {
        let (fs, users, root_session) = engine();
        seed_orchard(&fs, root_session);
        let alice = users.login(User::new("alice", Role::User));
        fs.grant_role_permission(root_session, "/", Role::User, Permission::Write, false)
            .unwrap();

        assert!(matches!(
            fs.remove_node_at_path(alice, "apple"),
            Err(FsError::InsufficientPermission { .. })
        ));
        assert_eq!(fs.size(), 7);
    }

    #[test]
    fn root_is_undeletable_and_immovable() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "apple", NodeType::Directory, true).unwrap();
        assert!(matches!(
            fs.remove_node_at_path(session, "/"),
            Err(FsError::IllegalOperation(_))
        ));
        assert!(matches!(
            fs.move_node(session, "/", "apple", OnCollision::Rename),
            Err(FsError::IllegalOperation(_))
        ));
        assert_eq!(fs.size(), 2);
    }

    #[test]
    fn remove_missing_node_is_not_found() {
        let (fs, _, session) = engine();
        assert!(matches!(
            fs.remove_node_at_path(session, "ghost"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn move_to_empty_target_renames() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b", NodeType::Directory, true).unwrap();
        fs.set_file_contents(session, "a/x.txt", b"payload".to_vec()).unwrap();

        fs.move_node(session, "a/x.txt", "b/y.txt", OnCollision::Rename).unwrap();
        assert!(!fs.node_exists(session, "a/x.txt").unwrap());
        assert_eq!(fs.file_contents(session, "b/y.txt").unwrap(), b"payload");
    }

    #[test]
    fn move_into_directory_resolves_collisions() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b/x.txt", NodeType::File, true).unwrap();

        fs.move_node(session, "a/x.txt", "b", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "b/x.txt").unwrap());
        assert!(fs.node_exists(session, "b/x__1.txt").unwrap());
        assert!(!fs.node_exists(session, "a/x.txt").unwrap());
    }

    #[test]
    fn move_onto_file_lands_in_its_parent() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b/y.txt", NodeType::File, true).unwrap();

        fs.move_node(session, "a/x.txt", "b/y.txt", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "b/x.txt").unwrap());
        assert!(fs.node_exists(session, "b/y.txt").unwrap());
    }

    #[test]
    fn move_onto_itself_is_a_noop() {
        let (fs, _, session) = engine();
        seed_orchard(&fs, session);
        fs.move_node(session, "apple", "apple", OnCollision::Rename).unwrap();
        assert_eq!(fs.size(), 7);
        assert!(fs.node_exists(session, "apple/banana").unwrap());
    }

    #[test]
    fn move_directory_onto_file_is_illegal() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a", NodeType::Directory, true).unwrap();
        fs.create_node_at_path(session, "x.txt", NodeType::File, true).unwrap();
        match fs.move_node(session, "a", "x.txt", OnCollision::Rename) {
            Err(FsError::OperationNotSupported { relationship, operation }) => {
                assert_eq!(relationship, Relationship::DirToFile);
                assert_eq!(operation, Operation::Move);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn move_of_missing_source_reports_relationship() {
        let (fs, _, session) = engine();
        assert!(matches!(
            fs.move_node(session, "ghost", "also-ghost", OnCollision::Rename),
            Err(FsError::OperationNotSupported {
                relationship: Relationship::None,
                ..
            })
        ));
    }

    #[test]
    fn move_directory_into_own_subtree_is_illegal() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/b", NodeType::Directory, true).unwrap();
        assert!(matches!(
            fs.move_node(session, "a", "a/b", OnCollision::Rename),
            Err(FsError::IllegalOperation(_))
        ));
    }

    fn seed_merge_fixture(fs: &TreeFs, session: SessionId) {
        // left/f.txt, left/sub/s.txt and a same-shaped tree under right/left
        fs.create_node_at_path(session, "left/sub/s.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "left/f.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "right/left/sub/s.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "right/left/f.txt", NodeType::File, true).unwrap();
        fs.set_file_contents(session, "left/f.txt", b"new".to_vec()).unwrap();
        fs.set_file_contents(session, "right/left/f.txt", b"old".to_vec()).unwrap();
        assert_eq!(fs.size(), 10);
    }

    #[test]
    fn directory_merge_with_rename_keeps_both_files() {
        let (fs, _, session) = engine();
        seed_merge_fixture(&fs, session);

        fs.move_node(session, "left", "right", OnCollision::Rename).unwrap();
        // both file versions survive, the two source shells are gone
        assert_eq!(fs.size(), 8);
        assert!(!fs.node_exists(session, "left").unwrap());
        assert_eq!(fs.file_contents(session, "right/left/f.txt").unwrap(), b"old");
        assert_eq!(fs.file_contents(session, "right/left/f__1.txt").unwrap(), b"new");
        assert!(fs.node_exists(session, "right/left/sub/s__1.txt").unwrap());
    }

    #[test]
    fn directory_merge_with_overwrite_replaces_files() {
        let (fs, _, session) = engine();
        seed_merge_fixture(&fs, session);

        fs.move_node(session, "left", "right", OnCollision::Overwrite).unwrap();
        assert_eq!(fs.size(), 6);
        assert_eq!(fs.file_contents(session, "right/left/f.txt").unwrap(), b"new");
        assert!(fs.node_exists(session, "right/left/sub/s.txt").unwrap());
        assert!(!fs.node_exists(session, "right/left/f__1.txt").unwrap());
    }

    #[test]
    fn directory_merge_never_lands_a_directory_on_a_file() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "left/conflict/inner.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "right/left/conflict", NodeType::File, true).unwrap();

        // the same-named destination child is a file, both modes refuse
        assert!(matches!(
            fs.move_node(session, "left", "right", OnCollision::Overwrite),
            Err(FsError::IllegalOperation(_))
        ));
        assert!(matches!(
            fs.move_node(session, "left", "right", OnCollision::Rename),
            Err(FsError::IllegalOperation(_))
        ));
        assert_eq!(
            fs.node_info(session, "right/left/conflict").unwrap().node_type,
            NodeType::File
        );
        assert!(fs.node_exists(session, "left/conflict/inner.txt").unwrap());
    }

    #[test]
    fn copy_to_empty_target_takes_leaf_name() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.set_file_contents(session, "a/x.txt", b"bytes".to_vec()).unwrap();

        fs.copy_node(session, "a/x.txt", "a/y.txt", OnCollision::Rename).unwrap();
        assert_eq!(fs.file_contents(session, "a/y.txt").unwrap(), b"bytes");

        // the copy is independent of the original
        fs.set_file_contents(session, "a/x.txt", b"changed".to_vec()).unwrap();
        assert_eq!(fs.file_contents(session, "a/y.txt").unwrap(), b"bytes");
    }

    #[test]
    fn copy_onto_a_file_takes_its_name() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b/y.txt", NodeType::File, true).unwrap();
        fs.set_file_contents(session, "a/x.txt", b"fresh".to_vec()).unwrap();
        fs.set_file_contents(session, "b/y.txt", b"stale".to_vec()).unwrap();

        fs.copy_node(session, "a/x.txt", "b/y.txt", OnCollision::Overwrite).unwrap();
        assert_eq!(fs.file_contents(session, "b/y.txt").unwrap(), b"fresh");
        assert!(!fs.node_exists(session, "b/x.txt").unwrap());
        assert!(fs.node_exists(session, "a/x.txt").unwrap());

        fs.copy_node(session, "a/x.txt", "b/y.txt", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "b/y__1.txt").unwrap());
    }

    #[test]
    fn copy_directory_merge_leaves_source_intact() {
        let (fs, _, session) = engine();
        seed_merge_fixture(&fs, session);

        fs.copy_node(session, "left", "right", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "left/f.txt").unwrap());
        assert!(fs.node_exists(session, "right/left/f__1.txt").unwrap());
        assert!(fs.node_exists(session, "right/left/sub/s__1.txt").unwrap());
        // source tree (4) unchanged, two file copies added to the ten
        assert_eq!(fs.size(), 12);
    }

    #[test]
    fn copy_assigns_ownership_to_the_acting_user() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "shared/data.txt", NodeType::File, true).unwrap();
        let alice = users.login(User::new("alice", Role::User));

        // the inherited role grant on the file is enough to read it
        fs.copy_node(alice, "shared/data.txt", "shared/mine.txt", OnCollision::Rename)
            .unwrap();
        let info = fs.node_info(alice, "shared/mine.txt").unwrap();
        assert_eq!(info.owner.as_str(), "alice");
        assert_eq!(
            fs.node_info(root_session, "shared/data.txt").unwrap().owner.as_str(),
            "root"
        );
    }

    #[test]
    fn copy_requires_read_on_the_source() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "secret/data.txt", NodeType::File, true).unwrap();
        fs.revoke_role_permissions(root_session, "secret", Role::User, true).unwrap();
        let alice = users.login(User::new("alice", Role::User));

        assert!(matches!(
            fs.copy_node(alice, "secret/data.txt", "/stolen.txt", OnCollision::Rename),
            Err(FsError::InsufficientPermission { .. })
        ));
    }

    #[test]
    fn content_round_trip_with_offsets() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "notes.txt", NodeType::File, true).unwrap();

        let n = fs
            .write_file(session, "notes.txt", &mut Cursor::new(b"0123456789".to_vec()), 0)
            .unwrap();
        assert_eq!(n, 10);
        fs.write_file(session, "notes.txt", &mut Cursor::new(b"abc".to_vec()), 3).unwrap();

        let mut out = Vec::new();
        fs.read_file(session, "notes.txt", &mut out).unwrap();
        assert_eq!(out, b"012abc6789");

        let mut range = Vec::new();
        fs.read_file_range(session, "notes.txt", 3, 3, &mut range).unwrap();
        assert_eq!(range, b"abc");
        assert_eq!(fs.file_len(session, "notes.txt").unwrap(), 10);
    }

    #[test]
    fn content_access_on_directory_is_not_a_file() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "dir", NodeType::Directory, true).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            fs.read_file(session, "dir", &mut out),
            Err(FsError::NotAFile)
        ));
        assert!(matches!(
            fs.read_file(session, "ghost.txt", &mut out),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn write_refreshes_the_update_timestamp() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "stamp.txt", NodeType::File, true).unwrap();
        let before = fs.node_info(session, "stamp.txt").unwrap();
        fs.set_file_contents(session, "stamp.txt", b"x".to_vec()).unwrap();
        let after = fs.node_info(session, "stamp.txt").unwrap();
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.len, Some(1));
    }

    #[test]
    fn grants_open_access_and_revokes_close_it() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "shared/data.txt", NodeType::File, true).unwrap();
        let guest = users.login(User::new("visitor", Role::Guest));

        assert!(matches!(
            fs.set_file_contents(guest, "shared/data.txt", b"hi".to_vec()),
            Err(FsError::InsufficientPermission { .. })
        ));

        fs.grant_user_permission(
            root_session,
            "shared/data.txt",
            UserId::new("visitor"),
            Permission::Write,
            false,
        )
        .unwrap();
        fs.set_file_contents(guest, "shared/data.txt", b"hi".to_vec()).unwrap();

        fs.revoke_user_permissions(root_session, "shared/data.txt", &UserId::new("visitor"), false)
            .unwrap();
        assert!(matches!(
            fs.set_file_contents(guest, "shared/data.txt", b"again".to_vec()),
            Err(FsError::InsufficientPermission { .. })
        ));
    }

    #[test]
    fn owners_need_no_explicit_grants() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "home", NodeType::Directory, true).unwrap();
        let alice = users.login(User::new("alice", Role::User));
        fs.grant_user_permission(
            root_session,
            "home",
            UserId::new("alice"),
            Permission::Write,
            false,
        )
        .unwrap();

        // creating from inside the granted directory, everything after that
        // rides on ownership alone
        fs.select_working_node(alice, "home").unwrap();
        fs.create_node_at_path(alice, "diary.txt", NodeType::File, false).unwrap();
        fs.set_file_contents(alice, "diary.txt", b"dear diary".to_vec()).unwrap();
        assert_eq!(fs.file_contents(alice, "diary.txt").unwrap(), b"dear diary");
        fs.remove_node_at_path(alice, "diary.txt").unwrap();
    }

    #[test]
    fn only_owner_or_admin_may_change_permissions() {
        let (fs, users, root_session) = engine();
        fs.create_node_at_path(root_session, "shared", NodeType::Directory, true).unwrap();
        let alice = users.login(User::new("alice", Role::User));
        assert!(matches!(
            fs.grant_role_permission(alice, "shared", Role::Guest, Permission::Read, false),
            Err(FsError::IllegalOperation(_))
        ));

        let admin = users.login(User::new("ops", Role::Admin));
        fs.grant_role_permission(admin, "shared", Role::Guest, Permission::Read, false).unwrap();
        assert!(fs
            .role_permissions(root_session, "shared", Role::Guest)
            .unwrap()
            .contains(Permission::Read));
    }

    #[test]
    fn rename_resolves_sibling_collisions() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/x.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "a/y.txt", NodeType::File, true).unwrap();

        assert_eq!(fs.rename_node(session, "a/y.txt", "x.txt").unwrap(), "a/x__1.txt");
        assert!(fs.node_exists(session, "a/x.txt").unwrap());
        assert!(fs.node_exists(session, "a/x__1.txt").unwrap());

        assert!(matches!(
            fs.rename_node(session, "/", "anything"),
            Err(FsError::IllegalOperation(_))
        ));
        assert!(matches!(
            fs.rename_node(session, "a/x.txt", "no/slashes"),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn engine_accepts_any_user_source() {
        let mut mock = MockUserSource::new();
        mock.expect_current_user()
            .returning(|_| Some(User::new("probe", Role::Root)));
        let fs = TreeFs::new(FsConfig::default(), Arc::new(mock));
        let session = SessionId::new(7);
        fs.create_node_at_path(session, "probe-dir", NodeType::Directory, true).unwrap();
        assert!(fs.node_exists(session, "probe-dir").unwrap());
    }

    /// Sink that reports its first write, then drags its feet
    struct SlowSink {
        bytes: Vec<u8>,
        started: Option<std::sync::mpsc::Sender<()>>,
    }

    impl io::Write for SlowSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(started) = self.started.take() {
                let _ = started.send(());
            }
            thread::sleep(Duration::from_millis(2));
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn slow_read_survives_a_concurrent_move() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/big.bin", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b", NodeType::Directory, true).unwrap();
        let payload: Vec<u8> = (0..64u8).collect();
        fs.set_file_contents(session, "a/big.bin", payload.clone()).unwrap();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let reader_fs = Arc::clone(&fs);
        let reader = thread::spawn(move || {
            let mut sink = SlowSink {
                bytes: Vec::new(),
                started: Some(started_tx),
            };
            reader_fs.read_file(session, "a/big.bin", &mut sink).unwrap();
            sink.bytes
        });

        // wait until the stream is underway, then relocate the file under it
        started_rx.recv().unwrap();
        fs.move_node(session, "a/big.bin", "b", OnCollision::Rename).unwrap();
        assert!(fs.node_exists(session, "b/big.bin").unwrap());

        let streamed = reader.join().unwrap();
        assert_eq!(streamed, payload);
        assert_eq!(fs.file_contents(session, "b/big.bin").unwrap(), payload);
    }

    #[test]
    fn opposing_moves_do_not_deadlock() {
        let (fs, _, session) = engine();
        fs.create_node_at_path(session, "a/ping.txt", NodeType::File, true).unwrap();
        fs.create_node_at_path(session, "b", NodeType::Directory, true).unwrap();

        let forward = Arc::clone(&fs);
        let t1 = thread::spawn(move || {
            for _ in 0..50 {
                let _ = forward.move_node(session, "/a/ping.txt", "/b", OnCollision::Rename);
            }
        });
        let backward = Arc::clone(&fs);
        let t2 = thread::spawn(move || {
            for _ in 0..50 {
                let _ = backward.move_node(session, "/b/ping.txt", "/a", OnCollision::Rename);
            }
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(fs.size(), 4);
        let in_a = fs.node_exists(session, "/a/ping.txt").unwrap();
        let in_b = fs.node_exists(session, "/b/ping.txt").unwrap();
        assert!(in_a ^ in_b);
    }
}
