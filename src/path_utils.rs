//! Path utilities for remote (always `/`) and local paths
//!
//! Remote paths are handled as plain strings with `/` separators regardless of the
//! local platform. Local paths go through `PathBuf` so Windows separators keep working.

use std::path::{Path, PathBuf};

/// Check if a remote path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Convert backslashes to forward slashes.
pub fn to_unix_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Append a trailing `/` unless the path already ends with one.
///
/// An empty path stays empty.
pub fn unix_include_trailing_slash(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Strip a trailing `/`, leaving the root `/` untouched.
pub fn unix_exclude_trailing_slash(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path.to_string()
    }
}

/// Join remote path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Do two remote paths name the same directory, ignoring a trailing `/`.
pub fn unix_same_path(a: &str, b: &str) -> bool {
    unix_exclude_trailing_slash(a) == unix_exclude_trailing_slash(b)
}

/// Directory part of a remote path, including the trailing `/`.
///
/// - `/home/user/file.txt` → `/home/user/`
/// - `/file.txt` → `/`
/// - `file.txt` → ``
pub fn unix_extract_file_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(pos) => path[..=pos].to_string(),
        None => String::new(),
    }
}

/// Last component of a remote path.
pub fn unix_extract_file_name(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path.to_string(),
    }
}

/// Parent directory of a remote path, without a trailing slash.
///
/// The parent of `/` is `/`.
pub fn unix_parent_directory(path: &str) -> String {
    let trimmed = unix_exclude_trailing_slash(path);
    if trimmed == "/" {
        return trimmed;
    }
    unix_exclude_trailing_slash(&unix_extract_file_dir(&trimmed))
}

/// Is `child` equal to `parent` or located below it.
pub fn unix_is_child_path(parent: &str, child: &str) -> bool {
    let parent = unix_include_trailing_slash(parent);
    let child = unix_include_trailing_slash(child);
    !parent.is_empty() && child.starts_with(&parent)
}

/// Resolve a remote path typed relative to `base`.
///
/// `..` maps to the parent of `base`; absolute paths and an empty base pass through.
pub fn expand_remote_file_name(path: &str, base: &str) -> String {
    let path = unix_exclude_trailing_slash(path);
    if is_absolute_remote_path(&path) || base.is_empty() {
        path
    } else if path == ".." {
        unix_parent_directory(base)
    } else {
        unix_exclude_trailing_slash(&join_remote_path(base, &path))
    }
}

fn mask_file_part(part: &str, mask: &str) -> String {
    let part: Vec<char> = part.chars().collect();
    let mut result = String::new();
    let mut rest = 0;
    let mut escaped = false;
    for m in mask.chars() {
        match m {
            '\\' if !escaped => escaped = true,
            '*' if !escaped => {
                result.extend(part.iter().skip(rest));
                rest = part.len();
            }
            '?' if !escaped => {
                if let Some(c) = part.get(rest) {
                    result.push(*c);
                    rest += 1;
                }
            }
            other => {
                result.push(other);
                rest += 1;
                escaped = false;
            }
        }
    }
    result
}

/// Rename `file_name` through a target mask such as `*.bak` or `*-20240101.*`.
///
/// `*`, `*.*` and an empty mask keep the name. A leading dot is not an
/// extension separator.
pub fn mask_file_name(file_name: &str, mask: &str) -> String {
    if mask.is_empty() || mask == "*" || mask == "*.*" {
        return file_name.to_string();
    }
    let Some(mask_dot) = mask.rfind('.') else {
        return mask_file_part(file_name, mask);
    };
    let (name, ext) = match file_name.rfind('.') {
        Some(p) if p > 0 => (&file_name[..p], &file_name[p + 1..]),
        _ => (file_name, ""),
    };
    let ext = mask_file_part(ext, &mask[mask_dot + 1..]);
    let name = mask_file_part(name, &mask[..mask_dot]);
    if ext.is_empty() {
        name
    } else {
        format!("{}.{}", name, ext)
    }
}

/// Join local path components using the platform separator.
pub fn join_local_path(base: &str, component: &str) -> String {
    let mut path = PathBuf::from(base);
    path.push(component);
    path.to_string_lossy().to_string()
}

/// Append the platform separator to a local directory path.
pub fn include_trailing_separator(path: &str) -> String {
    if path.is_empty() || path.ends_with(std::path::MAIN_SEPARATOR) || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}{}", path, std::path::MAIN_SEPARATOR)
    }
}

/// Relative path of `path` below `root`, using `/` separators.
///
/// Returns `None` when `path` is not inside `root`.
pub fn relative_unix_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}
