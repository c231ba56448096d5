//! Environment resolution
//!
//! Entries are either `NAME=value` pairs or a bare `NAME`. A bare name is a
//! reference that must be filled in from one of the supplied sources before a
//! container can be created with it.

use std::fmt;
use thiserror::Error;

/// Where an environment list comes from, used in error messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Service(String),
    Step(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global environment"),
            Scope::Service(name) => write!(f, "service <{}>", name),
            Scope::Step(name) => write!(f, "build step <{}>", name),
        }
    }
}

/// A bare variable that none of the sources define
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unable to find match for environment variable <{name}> in {scope}")]
pub struct UnresolvedVariable {
    pub name: String,
    pub scope: Scope,
}

/// One parsed environment entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvEntry<'a> {
    Pair { name: &'a str, value: &'a str },
    Bare(&'a str),
}

impl<'a> EnvEntry<'a> {
    pub fn parse(entry: &'a str) -> Self {
        match entry.split_once('=') {
            Some((name, value)) => EnvEntry::Pair { name, value },
            None => EnvEntry::Bare(entry),
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            EnvEntry::Pair { name, .. } => name,
            EnvEntry::Bare(name) => name,
        }
    }
}

/// Looks up the value of `name` in `source`. Bare entries never match.
pub fn lookup<'a>(source: &'a [String], name: &str) -> Option<&'a str> {
    source.iter().find_map(|entry| match EnvEntry::parse(entry) {
        EnvEntry::Pair { name: key, value } if key == name => Some(value),
        _ => None,
    })
}

/// Replaces every bare name in `entries` with `NAME=value`, taking the value
/// from the first source that defines it. Pairs are kept as they are.
pub fn expand(
    entries: &[String],
    sources: &[&[String]],
    scope: &Scope,
) -> Result<Vec<String>, UnresolvedVariable> {
    entries
        .iter()
        .map(|entry| match EnvEntry::parse(entry) {
            EnvEntry::Pair { .. } => Ok(entry.clone()),
            EnvEntry::Bare(name) => sources
                .iter()
                .find_map(|source| lookup(source, name))
                .map(|value| format!("{}={}", name, value))
                .ok_or_else(|| UnresolvedVariable {
                    name: name.to_string(),
                    scope: scope.clone(),
                }),
        })
        .collect()
}

/// Merges `global` into `local`. Local entries come first and win; global
/// entries are appended only when their name is not already present.
pub fn merge(global: &[String], local: &[String]) -> Vec<String> {
    let mut merged = local.to_vec();
    for entry in global {
        let name = EnvEntry::parse(entry).name();
        let present = local
            .iter()
            .any(|existing| EnvEntry::parse(existing).name() == name);
        if !present {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Snapshot of the host process environment as `NAME=value` entries
pub fn process_environment() -> Vec<String> {
    std::env::vars_os()
        .map(|(name, value)| format!("{}={}", name.to_string_lossy(), value.to_string_lossy()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_expand_keeps_pairs() {
        let result = expand(&env(&["A=1"]), &[], &Scope::Global).unwrap();
        assert_eq!(result, env(&["A=1"]));
    }

    #[test]
    fn test_expand_resolves_bare_name_from_first_matching_source() {
        let first = env(&["OTHER=x"]);
        let second = env(&["TOKEN=secret"]);
        let third = env(&["TOKEN=ignored"]);
        let result = expand(
            &env(&["TOKEN", "A=1"]),
            &[&first, &second, &third],
            &Scope::Global,
        )
        .unwrap();
        assert_eq!(result, env(&["TOKEN=secret", "A=1"]));
    }

    #[test]
    fn test_expand_keeps_empty_values() {
        let source = env(&["EMPTY="]);
        let result = expand(&env(&["EMPTY"]), &[&source], &Scope::Global).unwrap();
        assert_eq!(result, env(&["EMPTY="]));
    }

    #[test]
    fn test_expand_reports_unresolved_name_with_scope() {
        let source = env(&["B=2"]);
        let err = expand(
            &env(&["MISSING"]),
            &[&source],
            &Scope::Step("build".to_string()),
        )
        .unwrap_err();
        assert_eq!(err.name, "MISSING");
        assert_eq!(
            err.to_string(),
            "unable to find match for environment variable <MISSING> in build step <build>"
        );
    }

    #[test]
    fn test_bare_entries_in_sources_do_not_resolve() {
        let source = env(&["NAME"]);
        assert!(expand(&env(&["NAME"]), &[&source], &Scope::Global).is_err());
    }

    #[test]
    fn test_merge_local_wins() {
        let merged = merge(&env(&["A=1", "B=2"]), &env(&["A=9"]));
        assert_eq!(merged, env(&["A=9", "B=2"]));
    }

    #[test]
    fn test_merge_bare_local_name_shadows_global() {
        let merged = merge(&env(&["A=1"]), &env(&["A"]));
        assert_eq!(merged, env(&["A"]));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let entry = EnvEntry::parse("OPTS=a=b");
        assert_eq!(entry, EnvEntry::Pair { name: "OPTS", value: "a=b" });
    }

    #[test]
    fn test_lookup() {
        let source = env(&["SSH_AUTH_SOCK=/tmp/agent.sock", "HOME=/root"]);
        assert_eq!(lookup(&source, "SSH_AUTH_SOCK"), Some("/tmp/agent.sock"));
        assert_eq!(lookup(&source, "PATH"), None);
    }
}
