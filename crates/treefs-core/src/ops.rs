// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation legality classification
//!
//! Every engine mutation is classified as a relationship between the source
//! and target node types before any state changes. The table below is the
//! single authority on which operations are legal for which relationship.

use crate::error::{FsError, FsResult};
use crate::types::NodeType;

/// The kind of mutation being attempted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Copy,
    Move,
    Delete,
    Modify,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => f.write_str("CREATE"),
            Operation::Copy => f.write_str("COPY"),
            Operation::Move => f.write_str("MOVE"),
            Operation::Delete => f.write_str("DELETE"),
            Operation::Modify => f.write_str("MODIFY"),
        }
    }
}

/// Ordered (source, target) node type classification. `None` on either side
/// means "no such node"; `Relationship::None` means neither side exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relationship {
    FileToFile,
    FileToDir,
    FileToSymlink,
    FileToHardlink,
    FileToNone,
    DirToDir,
    DirToSymlink,
    DirToHardlink,
    DirToFile,
    DirToNone,
    SymlinkToSymlink,
    SymlinkToHardlink,
    SymlinkToFile,
    SymlinkToDir,
    SymlinkToNone,
    HardlinkToFile,
    HardlinkToDir,
    HardlinkToSymlink,
    HardlinkToHardlink,
    HardlinkToNone,
    None,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Relationship {
    /// Classify an ordered pair of (possibly absent) node types
    pub fn classify(source: Option<NodeType>, target: Option<NodeType>) -> Self {
        use NodeType::*;
        match source {
            Some(File) => match target {
                Some(File) => Relationship::FileToFile,
                Some(Directory) => Relationship::FileToDir,
                Some(SymbolicLink) => Relationship::FileToSymlink,
                Some(HardLink) => Relationship::FileToHardlink,
                None => Relationship::FileToNone,
            },
            Some(Directory) => match target {
                Some(File) => Relationship::DirToFile,
                Some(Directory) => Relationship::DirToDir,
                Some(SymbolicLink) => Relationship::DirToSymlink,
                Some(HardLink) => Relationship::DirToHardlink,
                None => Relationship::DirToNone,
            },
            Some(SymbolicLink) => match target {
                Some(File) => Relationship::SymlinkToFile,
                Some(Directory) => Relationship::SymlinkToDir,
                Some(SymbolicLink) => Relationship::SymlinkToSymlink,
                Some(HardLink) => Relationship::SymlinkToHardlink,
                None => Relationship::SymlinkToNone,
            },
            Some(HardLink) => match target {
                Some(File) => Relationship::HardlinkToFile,
                Some(Directory) => Relationship::HardlinkToDir,
                Some(SymbolicLink) => Relationship::HardlinkToSymlink,
                Some(HardLink) => Relationship::HardlinkToHardlink,
                None => Relationship::HardlinkToNone,
            },
            None => Relationship::None,
        }
    }

    /// True if `operation` is legal for this relationship.
    ///
    /// Only File/Directory pairs support binary operations; a lone existing
    /// file supports every unary operation, a lone directory everything but
    /// MOVE. Links are inert in this version.
    pub fn allows(self, operation: Operation) -> bool {
        use Operation::*;
        match self {
            Relationship::FileToFile | Relationship::FileToDir | Relationship::DirToDir => {
                matches!(operation, Move | Copy)
            }
            Relationship::FileToNone => true,
            Relationship::DirToNone => matches!(operation, Create | Copy | Delete | Modify),
            _ => false,
        }
    }

    /// Classify and reject the operation if it is not in the legal set
    pub fn ensure_legal(
        source: Option<NodeType>,
        target: Option<NodeType>,
        operation: Operation,
    ) -> FsResult<Self> {
        let relationship = Self::classify(source, target);
        if relationship.allows(operation) {
            Ok(relationship)
        } else {
            Err(FsError::OperationNotSupported {
                relationship,
                operation,
            })
        }
    }
}
