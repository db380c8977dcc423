// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! treefs-core: an in-memory hierarchical filesystem engine
//!
//! The crate models a permissioned tree of directories and files held
//! entirely in memory. Sessions resolve relative paths against their own
//! working node, every mutation is classified against an operation
//! legality table before it runs, and move/copy collisions are resolved
//! with numeric name suffixes or by overwriting. File content is streamed in
//! configurable chunks under a lock of its own, so long reads coexist with
//! concurrent structural changes.
//!
//! [`TreeFs`] is the engine; plug in a [`UserSource`] (or the bundled
//! [`SessionUsers`] registry) to tell it who is acting on each session.

pub mod collision;
pub mod config;
pub mod content;
pub mod error;
mod node;
pub mod ops;
pub mod tree;
pub mod types;
pub mod user;

pub use collision::NameCollisionResolver;
pub use config::FsConfig;
pub use content::FileContent;
pub use error::{FsError, FsResult};
pub use ops::{Operation, Relationship};
pub use tree::{OnCollision, TreeFs};
pub use types::{
    NodeId, NodeInfo, NodeType, Permission, PermissionSet, Role, SessionId, User, UserId,
};
pub use user::{SessionUsers, UserSource};
