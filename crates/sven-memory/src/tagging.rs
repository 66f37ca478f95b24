// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Auto-tag extraction for memory and error-pattern content: file paths,
//! function declarations, and package/module declarations.
use std::sync::OnceLock;

use regex::Regex;

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\.{0,2}/)?[\w.-]+(?:/[\w.-]+)+\.[A-Za-z0-9]{1,8}\b").unwrap()
    })
}

fn func_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:func|fn|def)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:package|mod|module)\s+([A-Za-z_][A-Za-z0-9_:]*)").unwrap())
}

/// Extract tags from free-form content: bare file paths, `func X`/`fn X`/
/// `def X` names, and `package X`/`mod X`/`module X` names. Deduplicated,
/// insertion order preserved.
pub fn extract_tags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut push = |s: String| {
        if !tags.contains(&s) {
            tags.push(s);
        }
    };

    for m in path_re().find_iter(content) {
        push(m.as_str().to_string());
    }
    for c in func_re().captures_iter(content) {
        push(c[1].to_string());
    }
    for c in package_re().captures_iter(content) {
        push(c[1].to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_file_paths() {
        let tags = extract_tags("the bug is in src/runner.rs near the top");
        assert!(tags.contains(&"src/runner.rs".to_string()));
    }

    #[test]
    fn extracts_function_names_across_styles() {
        let tags = extract_tags("see func SpawnAsync, fn wait_all, and def flush");
        assert!(tags.contains(&"SpawnAsync".to_string()));
        assert!(tags.contains(&"wait_all".to_string()));
        assert!(tags.contains(&"flush".to_string()));
    }

    #[test]
    fn extracts_package_and_module_names() {
        let tags = extract_tags("package sven_team and mod runner both apply");
        assert!(tags.contains(&"sven_team".to_string()));
        assert!(tags.contains(&"runner".to_string()));
    }

    #[test]
    fn deduplicates_and_preserves_order() {
        let tags = extract_tags("fn foo does X; fn foo does it twice");
        assert_eq!(tags.iter().filter(|t| *t == "foo").count(), 1);
    }

    #[test]
    fn empty_content_yields_no_tags() {
        assert!(extract_tags("nothing interesting here").is_empty());
    }
}
