//! Helpers for absolute, `/`-separated remote paths.
//!
//! Remote paths are plain strings: the root is `/`, every other normalized path starts with `/`
//! and has no trailing slash, no empty components, and no `.` or `..` components.

/// The root path.
pub const ROOT: &str = "/";

/// Normalizes an absolute path, collapsing `.`, `..` and repeated separators.
///
/// Returns `None` for relative paths. `..` at the root stays at the root.
#[must_use]
pub fn normalize(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

/// Resolves `target` the way a symbolic link at `link_path` would.
///
/// Absolute targets are normalized as-is; relative ones are interpreted against the link's
/// parent directory.
#[must_use]
pub fn resolve_link_target(link_path: &str, target: &str) -> Option<String> {
    if target.is_empty() {
        return None;
    }
    if target.starts_with('/') {
        return normalize(target);
    }
    let base = parent(link_path).unwrap_or(ROOT);
    normalize(&format!("{base}/{target}"))
}

/// Joins a child name onto a normalized directory path.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent of a normalized path, `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a normalized path, empty for the root.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// Whether `path` lies strictly below `ancestor`.
#[must_use]
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Moves `path` from below `from` to the same relative place below `to`.
///
/// Returns `None` unless `path` lies strictly below `from`.
#[must_use]
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if !is_descendant(path, from) {
        return None;
    }
    let suffix = if from == ROOT {
        &path[1..]
    } else {
        &path[from.len() + 1..]
    };
    Some(join(to, suffix))
}

/// The components of a normalized path, root excluded.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
