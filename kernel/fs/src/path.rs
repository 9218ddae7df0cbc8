//! Path parsing utilities.
//!
//! Paths are absolute, `/`-separated, with empty segments collapsed.

use alloc::string::String;

use crate::{FsError, NAME_MAX, PATH_MAX};

/// Splits a path into components, dropping empty segments.
///
/// `"/a//b/"` yields `a`, `b`; `"/"` yields nothing.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Whether the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Validates overall and per-component length limits.
pub fn check_lengths(path: &str) -> Result<(), FsError> {
    if path.len() >= PATH_MAX {
        return Err(FsError::NameTooLong);
    }
    if components(path).any(|c| c.len() > NAME_MAX) {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Splits a path into `(parent, final component)`.
///
/// `"/a/b/c"` gives `("/a/b", "c")`; `"/x"` gives `("/", "x")`.
/// The root itself has no final component.
pub fn split_parent(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    let cut = trimmed.rfind('/').ok_or(FsError::InvalidArgument)?;
    let name = &trimmed[cut + 1..];
    let parent = if cut == 0 { "/" } else { &trimmed[..cut] };
    if name.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    Ok((parent, name))
}

/// Joins a directory path and a relative tail into an absolute path.
pub fn join(dir: &str, tail: &str) -> String {
    let mut out = String::from(dir.trim_end_matches('/'));
    if out.is_empty() {
        out.push('/');
    }
    for comp in components(tail) {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(comp);
    }
    out
}

/// Collapses `.` and `..` components into a canonical absolute path.
///
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut stack: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    for comp in components(path) {
        match comp {
            "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    let mut out = String::from("/");
    for (i, comp) in stack.iter().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(comp);
    }
    out
}

/// Finds the longest registered mount point that prefixes `path`.
///
/// `/dev` matches `/dev/null` but not `/device`; `/` matches anything.
pub fn longest_prefix_match<'a>(
    path: &str,
    mount_points: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for mp in mount_points {
        let matches = mp == "/"
            || path == mp
            || (path.starts_with(mp) && path.as_bytes().get(mp.len()) == Some(&b'/'));
        if matches && best.is_none_or(|b| mp.len() > b.len()) {
            best = Some(mp);
        }
    }
    best
}

/// Strips a mount prefix, returning the in-filesystem remainder.
#[must_use]
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else if path.len() == mount.len() {
        ""
    } else {
        &path[mount.len() + 1..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn components_collapse_slashes() {
        let parts: Vec<_> = components("/usr//bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_parent("/x").unwrap(), ("/", "x"));
        assert_eq!(split_parent("/a/b/").unwrap(), ("/a", "b"));
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn join_paths() {
        assert_eq!(join("/a/b", "c/d"), "/a/b/c/d");
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/a/", "b"), "/a/b");
        assert_eq!(join("/a", ""), "/a");
    }

    #[test]
    fn longest_prefix_picks_deepest() {
        let mounts = ["/", "/dev", "/dev/pts"];
        assert_eq!(
            longest_prefix_match("/dev/pts/0", mounts.iter().copied()),
            Some("/dev/pts")
        );
        assert_eq!(
            longest_prefix_match("/dev/null", mounts.iter().copied()),
            Some("/dev")
        );
        assert_eq!(
            longest_prefix_match("/device", mounts.iter().copied()),
            Some("/")
        );
    }

    #[test]
    fn strip_prefix_cases() {
        assert_eq!(strip_mount_prefix("/a/b", "/"), "a/b");
        assert_eq!(strip_mount_prefix("/dev/null", "/dev"), "null");
        assert_eq!(strip_mount_prefix("/dev", "/dev"), "");
    }

    #[test]
    fn normalize_dots() {
        assert_eq!(normalize("/a/./b"), "/a/b");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/../x"), "/x");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/a/b/.."), "/a");
    }

    #[test]
    fn length_limits() {
        assert!(check_lengths("/ok/path").is_ok());
        let long = alloc::format!("/{}", "x".repeat(300));
        assert_eq!(check_lengths(&long), Err(FsError::NameTooLong));
        let long_comp = alloc::format!("/{}", "y".repeat(100));
        assert_eq!(check_lengths(&long_comp), Err(FsError::NameTooLong));
    }
}
