// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sibling name collision resolution

use regex::Regex;

const SUFFIX_SEPARATOR: &str = "__";

/// Produces a non-colliding name from an existing name by appending a
/// numeric suffix before the extension, or bumping a suffix already present.
pub struct NameCollisionResolver {
    separator: String,
    /// Matches a previously collided name, with or without an extension
    collided: Regex,
}

impl NameCollisionResolver {
    pub fn new() -> Self {
        Self::with_separator(SUFFIX_SEPARATOR)
    }

    pub fn with_separator(separator: &str) -> Self {
        let pattern = format!(
            "^(?P<stem>.+){}(?P<seq>[0-9]+)(?P<ext>\\.[a-z]+)?$",
            regex::escape(separator)
        );
        Self {
            separator: separator.to_string(),
            collided: Regex::new(&pattern).expect("collision pattern is valid"),
        }
    }

    /// Resolve a colliding name: `carrot.txt` becomes `carrot__1.txt`,
    /// `carrot__1.txt` becomes `carrot__2.txt`.
    pub fn resolve(&self, name: &str) -> String {
        if let Some(caps) = self.collided.captures(name) {
            // previously collided, bump the sequence number
            let stem = &caps["stem"];
            let seq: u64 = caps["seq"].parse().unwrap_or(0);
            let extension = caps.name("ext").map(|m| m.as_str()).unwrap_or("");
            format!("{}{}{}{}", stem, self.separator, seq + 1, extension)
        } else if let Some(ext_idx) = name.rfind('.') {
            let (stem, extension) = name.split_at(ext_idx);
            format!("{}{}1{}", stem, self.separator, extension)
        } else {
            format!("{}{}1", name, self.separator)
        }
    }
}

impl Default for NameCollisionResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_collision_appends_suffix_before_extension() {
        let resolver = NameCollisionResolver::new();
        assert_eq!(resolver.resolve("carrot.txt"), "carrot__1.txt");
    }

    #[test]
    fn collision_chain_is_monotonic() {
        let resolver = NameCollisionResolver::new();
        let mut name = "carrot.txt".to_string();
        name = resolver.resolve(&name);
        assert_eq!(name, "carrot__1.txt");
        name = resolver.resolve(&name);
        assert_eq!(name, "carrot__2.txt");
        name = resolver.resolve(&name);
        assert_eq!(name, "carrot__3.txt");
    }

    #[test]
    fn name_without_extension() {
        let resolver = NameCollisionResolver::new();
        assert_eq!(resolver.resolve("notes"), "notes__1");
        assert_eq!(resolver.resolve("notes__1"), "notes__2");
    }

    #[test]
    fn multi_digit_sequence() {
        let resolver = NameCollisionResolver::new();
        assert_eq!(resolver.resolve("carrot__9.txt"), "carrot__10.txt");
        assert_eq!(resolver.resolve("carrot__10.txt"), "carrot__11.txt");
    }

    #[test]
    fn custom_separator() {
        let resolver = NameCollisionResolver::with_separator("--");
        assert_eq!(resolver.resolve("carrot.txt"), "carrot--1.txt");
        assert_eq!(resolver.resolve("carrot--1.txt"), "carrot--2.txt");
    }

    #[test]
    fn suffix_in_stem_bumps_last_occurrence() {
        let resolver = NameCollisionResolver::new();
        assert_eq!(resolver.resolve("a__1__2"), "a__1__3");
    }
}
