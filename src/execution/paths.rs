//! Lexical helpers for `/`-separated paths
//!
//! Copy rules depend on whether a path ends in `/` or `/.`, which
//! `std::path` normalizes away, so container and host copy paths are handled
//! as strings here.

use std::io;

/// Collapse repeated separators, drop `.` components and resolve `..`
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Last element of the path, ignoring trailing separators
pub fn base(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(pos) => trimmed[pos + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Everything but the last element, cleaned
pub fn dir(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => clean(&path[..=pos]),
        None => ".".to_string(),
    }
}

/// Join two paths and clean the result. Empty elements are ignored.
pub fn join(first: &str, second: &str) -> String {
    match (first.is_empty(), second.is_empty()) {
        (true, true) => String::new(),
        (true, false) => clean(second),
        (false, true) => clean(first),
        (false, false) => clean(&format!("{}/{}", first, second)),
    }
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Whether the last element is `.`
pub fn specifies_current_dir(path: &str) -> bool {
    base(path) == "."
}

pub fn has_trailing_separator(path: &str) -> bool {
    path.ends_with('/')
}

/// A path ending in `/` or `/.` must name a directory
pub fn asserts_directory(path: &str) -> bool {
    has_trailing_separator(path) || specifies_current_dir(path)
}

/// Split into parent directory and last element, keeping a trailing `.`
pub fn split_dir_entry(path: &str) -> (String, String) {
    let mut cleaned = clean(path);
    if specifies_current_dir(path) {
        cleaned.push_str("/.");
    }
    (dir(&cleaned), base(&cleaned))
}

/// Re-append the trailing `/` or `/.` that cleaning removed from `original`
pub fn preserve_trailing_dot_or_separator(cleaned: &str, original: &str) -> String {
    let mut path = cleaned.to_string();
    if !specifies_current_dir(&path) && specifies_current_dir(original) {
        if !has_trailing_separator(&path) {
            path.push('/');
        }
        path.push('.');
    }
    if !has_trailing_separator(&path) && has_trailing_separator(original) {
        path.push('/');
    }
    path
}

/// When symlink resolution changed the last element of `path`, returns the
/// resolved path with its trailing form preserved and the original last
/// element as the name the archive's top entry should carry.
pub fn rebase_name(path: &str, resolved: &str) -> (String, Option<String>) {
    let mut resolved = resolved.to_string();
    if specifies_current_dir(path) && !specifies_current_dir(&resolved) {
        resolved.push_str("/.");
    }
    if has_trailing_separator(path) && !has_trailing_separator(&resolved) {
        resolved.push('/');
    }
    let original_base = base(path);
    if original_base != base(&resolved) {
        (resolved, Some(original_base))
    } else {
        (resolved, None)
    }
}

/// Where a symbolic link at `path` points, as a path
pub fn resolve_link(path: &str, target: &str) -> String {
    if is_absolute(target) {
        clean(target)
    } else {
        let (parent, _) = split_dir_entry(path);
        join(&parent, target)
    }
}

/// Host path made absolute against the current directory
pub fn absolute(path: &str) -> io::Result<String> {
    if is_absolute(path) {
        return Ok(clean(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(join(&cwd.to_string_lossy(), path))
}
