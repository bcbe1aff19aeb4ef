//! Virtual path helpers.
//!
//! Virtual paths are always absolute, `/`-separated and lexically cleaned.
//! Nothing here touches the host filesystem.

/// Suffix marking a balanced mount: `/drive.balance1` shares `/drive`.
pub const BALANCE_SUFFIX: &str = ".balance";

/// Normalize a user-supplied path: backslashes become `/`, a leading `/` is
/// added, `.` and `..` segments are resolved (never above root) and repeated
/// or trailing separators are dropped.
pub fn fix_and_clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Join a base path and a child name, then clean.
pub fn join(base: &str, name: &str) -> String {
    if name.is_empty() {
        return fix_and_clean_path(base);
    }
    fix_and_clean_path(&format!("{base}/{name}"))
}

/// Split a path into its parent directory and last segment.
///
/// `/` splits into `("/", "")`.
pub fn split(path: &str) -> (String, String) {
    let path = fix_and_clean_path(path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path),
    }
}

/// Parent directory of a path.
pub fn dir(path: &str) -> String {
    split(path).0
}

/// Last segment of a path.
pub fn base_name(path: &str) -> String {
    split(path).1
}

pub fn path_equal(a: &str, b: &str) -> bool {
    fix_and_clean_path(a) == fix_and_clean_path(b)
}

/// Whether `sub` equals `parent` or lies below it.
pub fn is_sub_path(parent: &str, sub: &str) -> bool {
    let parent = fix_and_clean_path(parent);
    let sub = fix_and_clean_path(sub);
    parent == "/" || sub == parent || sub.starts_with(&format!("{parent}/"))
}

/// Ensure a trailing separator.
pub fn path_add_separator_suffix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Mount path with any balance suffix removed.
pub fn actual_mount_path(mount_path: &str) -> &str {
    match mount_path.find(BALANCE_SUFFIX) {
        Some(idx) => &mount_path[..idx],
        None => mount_path,
    }
}

/// Whether the mount path carries a balance suffix.
pub fn is_balance(mount_path: &str) -> bool {
    mount_path.contains(BALANCE_SUFFIX)
}

/// Full virtual path of `path` inside the storage mounted at `mount_path`.
pub fn full_path(mount_path: &str, path: &str) -> String {
    join(actual_mount_path(mount_path), path)
}

/// Depth of a mount path, measured as separator count of its
/// separator-terminated form: `/` is 1, `/a` is 2, `/a/b` is 3.
pub fn mount_depth(mount_path: &str) -> usize {
    path_add_separator_suffix(actual_mount_path(mount_path))
        .matches('/')
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_and_clean_path() {
        assert_eq!(fix_and_clean_path(""), "/");
        assert_eq!(fix_and_clean_path("/"), "/");
        assert_eq!(fix_and_clean_path("a/b"), "/a/b");
        assert_eq!(fix_and_clean_path("/a//b/"), "/a/b");
        assert_eq!(fix_and_clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(fix_and_clean_path("/../../x"), "/x");
        assert_eq!(fix_and_clean_path("\\win\\style"), "/win/style");
    }

    #[test]
    fn test_join_and_split() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/a", ""), "/a");
        assert_eq!(join("/m/a", "links"), "/m/a/links");
        assert_eq!(split("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(split("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(split("/"), ("/".to_string(), String::new()));
        assert_eq!(dir("/a/b/c"), "/a/b");
        assert_eq!(base_name("/a/b/c"), "c");
    }

    #[test]
    fn test_is_sub_path() {
        assert!(is_sub_path("/", "/anything"));
        assert!(is_sub_path("/a", "/a"));
        assert!(is_sub_path("/a", "/a/b"));
        assert!(!is_sub_path("/a", "/ab"));
        assert!(!is_sub_path("/a/b", "/a"));
    }

    #[test]
    fn test_balance_paths() {
        assert_eq!(actual_mount_path("/drive.balance2"), "/drive");
        assert_eq!(actual_mount_path("/drive"), "/drive");
        assert!(is_balance("/drive.balance"));
        assert!(!is_balance("/drive"));
        assert_eq!(full_path("/drive.balance1", "/x"), "/drive/x");
    }

    #[test]
    fn test_mount_depth() {
        assert_eq!(mount_depth("/"), 1);
        assert_eq!(mount_depth("/a"), 2);
        assert_eq!(mount_depth("/a/b"), 3);
        assert_eq!(mount_depth("/a.balance9"), 2);
    }
}
