//! Absolute path handling
//!
//! All paths in the cache are clean absolute strings (`/`, `/a/b`).
//! Clients may send sloppy forms (`/a//b/./c`, trailing slashes); they
//! are normalized on entry and anything that cannot be made absolute is
//! rejected.

use crate::error::FsError;

/// Normalize a path into its clean absolute form.
///
/// Collapses repeated separators and `.`, resolves `..` against the
/// components seen so far, and fails with `BadPath` for relative paths
/// or traversals above the root.
pub fn use_abs_path(p: &str) -> Result<String, FsError> {
    if !p.starts_with('/') {
        return Err(FsError::BadPath(p.to_string()));
    }
    let mut parts: Vec<&str> = Vec::new();
    for el in p.split('/') {
        match el {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(FsError::BadPath(p.to_string()));
                }
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Split a clean absolute path into its elements. `/` has none.
pub fn elems(p: &str) -> Vec<String> {
    p.split('/')
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// Component-wise prefix test. `/` is a prefix of everything;
/// `/a` is a prefix of `/a/b` but not of `/ab`.
pub fn has_prefix(path: &str, pref: &str) -> bool {
    if pref == "/" || path == pref {
        return true;
    }
    path.starts_with(pref) && path.as_bytes().get(pref.len()) == Some(&b'/')
}

/// The suffix of `path` under `pref`, such that `join(pref, suffix)`
/// rebuilds `path`. `None` when `pref` is not a component prefix.
pub fn suffix(path: &str, pref: &str) -> Option<String> {
    if !has_prefix(path, pref) {
        return None;
    }
    if path == pref {
        return Some("/".to_string());
    }
    if pref == "/" {
        return Some(path.to_string());
    }
    Some(path[pref.len()..].to_string())
}

/// Join an absolute base with an absolute suffix.
pub fn join(base: &str, suff: &str) -> String {
    match (base, suff) {
        (_, "/") => base.to_string(),
        ("/", _) => suff.to_string(),
        _ => format!("{}{}", base, suff),
    }
}

/// Parent directory of a clean absolute path. The root is its own parent.
pub fn dirname(p: &str) -> String {
    match p.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => p[..i].to_string(),
    }
}

/// Last element of a clean absolute path. The root's base is `/`.
pub fn basename(p: &str) -> String {
    match p.rfind('/') {
        Some(i) if p.len() > i + 1 => p[i + 1..].to_string(),
        _ => "/".to_string(),
    }
}
