//! Slash-separated path handling for archive members and container paths.
//!
//! Archive names and container paths are always `/`-separated strings,
//! whatever the host does, so these helpers work on `&str` rather than
//! [`std::path::Path`].

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Symlink hops allowed while resolving one path, as in `MAXSYMLINKS`.
const MAX_SYMLINK_HOPS: usize = 32;

/// Lexically simplify `path`: collapse separators, drop `.`, fold `..`.
///
/// A relative path keeps leading `..` elements; an absolute one cannot go
/// above `/`. An empty result becomes `.`.
pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            part => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Parent of a slash-separated path (`/` for top-level entries).
pub fn dirname(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

/// Last element of a slash-separated path.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, base)| base)
}

/// Join `base` and `rel` with exactly one separator.
pub fn join(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// Normalise an archive member name, or `None` if it is not safe to use.
///
/// Unsafe means the name is empty, refers to the archive root itself, is
/// absolute, or climbs out of the archive with `..`.
pub fn entry_name(raw: &str) -> Option<String> {
    if raw.starts_with('/') {
        return None;
    }
    let name = clean(raw);
    if name == "." || name == ".." || name.starts_with("../") {
        return None;
    }
    Some(name)
}

/// Does a symlink at container path `link`, pointing at `target`, escape
/// the container root?
///
/// The check is lexical: `target` is resolved against the link's directory
/// (or `/` if absolute) and the link escapes if `..` ever climbs past `/`.
pub fn symlink_escapes(link: &str, target: &str) -> bool {
    let mut depth: Vec<&str> = Vec::new();
    if !target.starts_with('/') {
        depth.extend(dirname(link).split('/').filter(|p| !p.is_empty()));
    }

    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if depth.pop().is_none() {
                    return true;
                }
            }
            part => depth.push(part),
        }
    }

    false
}

/// Resolve container path `path` to a host path beneath `root`, following
/// symlinks that already exist as if `root` were `/`.
///
/// The result never lies outside `root`. Components that do not exist yet
/// are taken literally.
pub fn secure_join(root: &Path, path: &str) -> io::Result<PathBuf> {
    let mut pending: VecDeque<String> = components(path).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = host_path(root, &resolved).join(&part);
        let is_link = fs::symlink_metadata(&candidate)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);

        if !is_link {
            resolved.push(part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(io::Error::other(format!(
                "too many levels of symbolic links resolving {path}"
            )));
        }

        let target = fs::read_link(&candidate)?;
        let target = target.to_string_lossy();
        if target.starts_with('/') {
            resolved.clear();
        }
        for part in components(&target).collect::<Vec<_>>().into_iter().rev() {
            pending.push_front(part);
        }
    }

    Ok(host_path(root, &resolved))
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
}

fn host_path(root: &Path, parts: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in parts {
        path.push(part);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_clean() {
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("./a/../b"), "b");
        assert_eq!(clean("a/../.."), "..");
        assert_eq!(clean("/../x"), "/x");
        assert_eq!(clean("./"), ".");
        assert_eq!(clean(""), ".");
    }

    #[test]
    fn test_dirname_and_basename() {
        assert_eq!(dirname("/usr/local/bin/foo"), "/usr/local/bin");
        assert_eq!(dirname("/foo"), "/");
        assert_eq!(dirname("foo"), ".");
        assert_eq!(basename("bin/foo"), "foo");
        assert_eq!(basename("share/doc/"), "doc");
        assert_eq!(basename("foo"), "foo");
    }

    #[test]
    fn test_unsafe_entry_names() {
        assert_eq!(entry_name("./bin/foo").as_deref(), Some("bin/foo"));
        assert_eq!(entry_name("pkg/../bin").as_deref(), Some("bin"));
        assert_eq!(entry_name("."), None);
        assert_eq!(entry_name("./"), None);
        assert_eq!(entry_name("../etc/passwd"), None);
        assert_eq!(entry_name("a/../../etc"), None);
        assert_eq!(entry_name("/etc/passwd"), None);
    }

    #[test]
    fn test_symlink_escape_check() {
        assert!(!symlink_escapes("/usr/local/bin/foo", "../lib/foo"));
        assert!(!symlink_escapes("/usr/local/bin/foo", "/usr/bin/env"));
        assert!(!symlink_escapes("/usr/local/bin/foo", "../../../etc"));
        assert!(symlink_escapes("/usr/local/bin/foo", "../../../../etc"));
        assert!(symlink_escapes("/foo", "../x"));
        assert!(symlink_escapes("/foo", "/../x"));
    }

    #[test]
    fn test_secure_join_stays_in_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("real/dir")).unwrap();
        symlink("/real", root.join("abs")).unwrap();
        symlink("../../../../..", root.join("real/up")).unwrap();
        symlink("/data", root.join("etc")).unwrap();

        assert_eq!(secure_join(root, "/abs/dir/f").unwrap(), root.join("real/dir/f"));
        assert_eq!(secure_join(root, "/real/up/x").unwrap(), root.join("x"));
        assert_eq!(secure_join(root, "/../../x").unwrap(), root.join("x"));
        // An absolute link is re-rooted, never followed on the host.
        assert_eq!(secure_join(root, "/etc/passwd").unwrap(), root.join("data/passwd"));
    }

    #[test]
    fn test_secure_join_detects_loops() {
        let temp = TempDir::new().unwrap();
        symlink("b", temp.path().join("a")).unwrap();
        symlink("a", temp.path().join("b")).unwrap();

        assert!(secure_join(temp.path(), "/a/x").is_err());
    }
}
