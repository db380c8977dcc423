// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{PermissionSet, Role};

/// Filesystem configuration, applied once at engine construction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    /// Chunk size used for streamed content reads and writes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Role-based permission sets stamped onto the root node at construction
    #[serde(default = "default_role_permissions")]
    pub role_defaults: HashMap<Role, PermissionSet>,
}

fn default_chunk_size() -> usize {
    4
}

fn default_role_permissions() -> HashMap<Role, PermissionSet> {
    let mut defaults = HashMap::new();
    defaults.insert(Role::Root, PermissionSet::all());
    defaults.insert(Role::Admin, PermissionSet::all());
    defaults.insert(Role::User, PermissionSet::read_only());
    defaults.insert(Role::Guest, PermissionSet::read_only());
    defaults
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            role_defaults: default_role_permissions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: FsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.role_defaults[&Role::Guest], PermissionSet::read_only());

        let config: FsConfig = serde_json::from_str(r#"{"chunk_size": 16}"#).unwrap();
        assert_eq!(config.chunk_size, 16);
    }

    #[test]
    fn default_config_grants_admin_roles_full_access() {
        let config = FsConfig::default();
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.role_defaults[&Role::Root], PermissionSet::all());
        assert_eq!(config.role_defaults[&Role::Admin], PermissionSet::all());
        assert_eq!(config.role_defaults[&Role::User], PermissionSet::read_only());
        assert_eq!(config.role_defaults[&Role::Guest], PermissionSet::read_only());
    }
}
