// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the tree engine

use std::io;

use crate::ops::{Operation, Relationship};
use crate::types::Permission;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a file")]
    NotAFile,
    #[error("{operation} is not supported for {relationship}")]
    OperationNotSupported {
        relationship: Relationship,
        operation: Operation,
    },
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
    #[error("user {user} does not have {permission} permission on {node}")]
    InsufficientPermission {
        user: String,
        permission: Permission,
        node: String,
    },
    #[error("no user logged in")]
    NotLoggedIn,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;
