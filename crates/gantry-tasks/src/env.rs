//! Environment variable resolution
//!
//! Patterns are either literal names, wildcards (`NEXT_PUBLIC_*`) or
//! negations (`!SECRET_*`). Negations win over any inclusion.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use gantry_core::config::defaults::default_pass_through_env;

use crate::error::EnvError;

/// Sorted snapshot of environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(BTreeMap<String, String>);

/// Resolved variables split by how they were requested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BySource {
    /// Named literally
    pub explicit: EnvironmentVariableMap,
    /// Matched by a wildcard
    pub matching: EnvironmentVariableMap,
}

impl EnvironmentVariableMap {
    /// Snapshot of the current process environment
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Add every entry of `other`, overwriting existing keys
    pub fn union(&mut self, other: &EnvironmentVariableMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Remove every key present in `other`
    pub fn difference(&mut self, other: &EnvironmentVariableMap) {
        for k in other.0.keys() {
            self.0.remove(k);
        }
    }

    /// Variables matching any inclusion pattern and no `!` exclusion
    pub fn wildcard_matches(&self, patterns: &[String]) -> Result<Self, EnvError> {
        let (include, exclude) = compile_patterns(patterns)?;
        let Some(include) = include else {
            return Ok(Self::default());
        };
        Ok(Self(
            self.0
                .iter()
                .filter(|(k, _)| include.is_match(k))
                .filter(|(k, _)| exclude.as_ref().map_or(true, |ex| !ex.is_match(k)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
    }

    /// Resolve declared names and wildcards, recording provenance
    pub fn hashable_env(&self, patterns: &[String]) -> Result<DetailedMap, EnvError> {
        let mut explicit = Self::default();
        let mut wildcards = Vec::new();
        for pattern in patterns {
            if pattern.starts_with('!') || pattern.contains('*') {
                wildcards.push(pattern.clone());
            } else if let Some(value) = self.get(pattern) {
                explicit.insert(pattern.as_str(), value);
            }
        }

        let exclusions: Vec<String> = patterns.iter().filter(|p| p.starts_with('!')).cloned().collect();
        if !exclusions.is_empty() {
            // `!FOO` also removes an explicitly named FOO
            let mut matched = explicit.clone();
            matched.difference(&self.excluded_by(&exclusions)?);
            explicit = matched;
        }

        let mut matching = self.wildcard_matches(&wildcards)?;
        matching.difference(&explicit);

        let mut all = explicit.clone();
        all.union(&matching);
        Ok(DetailedMap {
            all,
            by_source: BySource { explicit, matching },
        })
    }

    fn excluded_by(&self, exclusions: &[String]) -> Result<Self, EnvError> {
        let positive: Vec<String> = exclusions
            .iter()
            .map(|p| p.trim_start_matches('!').to_string())
            .collect();
        self.wildcard_matches(&positive)
    }

    /// `KEY=value` pairs, sorted by key
    pub fn to_hashable(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// `KEY=sha256(value)` pairs, safe to show in summaries
    pub fn to_secret_hashable(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("{}=", k)
                } else {
                    format!("{}={:x}", k, Sha256::digest(v.as_bytes()))
                }
            })
            .collect()
    }

    /// Environment visible to a child process in strict mode: the declared
    /// variables, the pass-through patterns and a small default allow-list.
    pub fn strict_child_env(
        &self,
        declared: &[String],
        pass_through: &[String],
    ) -> Result<Self, EnvError> {
        let mut allowed = self.hashable_env(declared)?.all;
        allowed.union(&self.wildcard_matches(pass_through)?);
        for name in default_pass_through_env() {
            if let Some(value) = self.get(name) {
                allowed.insert(*name, value);
            }
        }
        Ok(allowed)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Build anchored alternations for inclusion and exclusion patterns
fn compile_patterns(patterns: &[String]) -> Result<(Option<Regex>, Option<Regex>), EnvError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(p) => exclude.push(wildcard_to_regex(p)),
            None => include.push(wildcard_to_regex(pattern)),
        }
    }

    let compile = |parts: Vec<String>| -> Result<Option<Regex>, EnvError> {
        if parts.is_empty() {
            return Ok(None);
        }
        let source = format!("^(?:{})$", parts.join("|"));
        Regex::new(&source)
            .map(Some)
            .map_err(|source_err| EnvError::InvalidPattern {
                pattern: patterns.join(","),
                source: source_err,
            })
    };
    Ok((compile(include)?, compile(exclude)?))
}

fn wildcard_to_regex(pattern: &str) -> String {
    pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvironmentVariableMap {
        [
            ("API_URL", "https://example.com"),
            ("NEXT_PUBLIC_A", "a"),
            ("NEXT_PUBLIC_SECRET", "s"),
            ("PATH", "/usr/bin"),
            ("HOME", "/home/dev"),
            ("TOKEN", "hunter2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcards_with_exclusion() {
        let matched = env()
            .wildcard_matches(&patterns(&["NEXT_PUBLIC_*", "!NEXT_PUBLIC_SECRET"]))
            .unwrap();
        assert_eq!(matched.names(), vec!["NEXT_PUBLIC_A"]);
    }

    #[test]
    fn test_literal_pattern_is_exact() {
        let matched = env().wildcard_matches(&patterns(&["API"])).unwrap();
        assert!(matched.is_empty());
        let matched = env().wildcard_matches(&patterns(&["API_URL"])).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_regex_metacharacters_are_escaped() {
        let mut env = EnvironmentVariableMap::default();
        env.insert("A.B", "1");
        env.insert("AXB", "2");
        let matched = env.wildcard_matches(&patterns(&["A.B"])).unwrap();
        assert_eq!(matched.names(), vec!["A.B"]);
    }

    #[test]
    fn test_hashable_env_provenance() {
        let detailed = env()
            .hashable_env(&patterns(&["API_URL", "NEXT_PUBLIC_*", "MISSING"]))
            .unwrap();
        assert_eq!(detailed.by_source.explicit.names(), vec!["API_URL"]);
        assert_eq!(
            detailed.by_source.matching.names(),
            vec!["NEXT_PUBLIC_A", "NEXT_PUBLIC_SECRET"]
        );
        assert_eq!(detailed.all.len(), 3);
    }

    #[test]
    fn test_negation_removes_explicit() {
        let detailed = env()
            .hashable_env(&patterns(&["TOKEN", "API_URL", "!TOKEN"]))
            .unwrap();
        assert_eq!(detailed.all.names(), vec!["API_URL"]);
    }

    #[test]
    fn test_hashable_forms() {
        let mut env = EnvironmentVariableMap::default();
        env.insert("B", "2");
        env.insert("A", "");
        assert_eq!(env.to_hashable(), vec!["A=", "B=2"]);

        let secret = env.to_secret_hashable();
        assert_eq!(secret[0], "A=");
        assert!(secret[1].starts_with("B="));
        assert_eq!(secret[1].len(), 2 + 64);
        assert!(!secret[1].ends_with("=2"));
    }

    #[test]
    fn test_strict_child_env() {
        let child = env()
            .strict_child_env(&patterns(&["API_URL"]), &patterns(&["NEXT_PUBLIC_A"]))
            .unwrap();
        assert_eq!(child.names(), vec!["API_URL", "HOME", "NEXT_PUBLIC_A", "PATH"]);
        assert!(child.get("TOKEN").is_none());
    }

    #[test]
    fn test_union_and_difference() {
        let mut a = env();
        let mut b = EnvironmentVariableMap::default();
        b.insert("TOKEN", "x");
        b.insert("EXTRA", "y");
        a.union(&b);
        assert_eq!(a.get("TOKEN"), Some("x"));
        a.difference(&b);
        assert!(a.get("TOKEN").is_none());
        assert!(a.get("EXTRA").is_none());
    }
}
