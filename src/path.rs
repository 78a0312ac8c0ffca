//! Path helpers
//!
//! Absolute, slash-separated store paths. `/` is the store root.
//!
//! Author: Moroya Sakamoto

/// Normalize an absolute path: collapse `//`, resolve `.` and `..`,
/// strip a trailing slash. Returns `None` for relative paths and for
/// paths escaping the root.
pub fn normalize(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(from_segments(&segments))
}

fn from_segments(segments: &[&str]) -> String {
    if segments.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(s);
    }
    out
}

/// Non-empty segments of a path
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Join a base path and a relative path. An empty relative path yields `base`.
pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    if base == "/" {
        format!("/{rel}")
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

/// Parent path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path, empty for the root
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// True if `path` equals `ancestor` or lies below it.
pub fn is_same_or_descendant(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// `path` relative to `ancestor` without a leading slash, `None` if `path`
/// is not below `ancestor`.
pub fn relative_to<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if !is_same_or_descendant(ancestor, path) {
        return None;
    }
    let rest = if ancestor == "/" {
        path
    } else {
        &path[ancestor.len()..]
    };
    Some(rest.trim_start_matches('/'))
}
