// Path canonicalization: NFKC normalization, traversal rejection, 512 char max.
//
// Canonical document paths are absolute: a single leading `/`, `/`-separated
// components, no trailing slash. Scope prefixes use the same form; the bare
// workspace root is `/`.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path contains invalid component: {0}")]
    InvalidComponent(String),
}

/// Normalize a document path for safe storage and uniqueness checking.
///
/// Rules:
/// - Apply Unicode NFKC normalization
/// - Convert all separators to `/`
/// - Collapse consecutive `/` into one
/// - Anchor at a single leading `/`, strip any trailing `/`
/// - Reject `.` and `..` path components (traversal)
/// - Reject null bytes
/// - Reject empty paths
/// - Enforce max 512 character limit (after normalization)
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    let components = split_components(input)?;

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    let result = format!("/{}", components.join("/"));

    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Normalize a folder prefix for scope checks and board filters.
///
/// Same rules as [`normalize_path`], except the bare root (`/`, ``, `///`)
/// is legal and normalizes to `/`.
pub fn normalize_folder(input: &str) -> Result<String, PathError> {
    if input.is_empty() {
        return Ok("/".to_string());
    }

    let components = split_components(input)?;

    if components.is_empty() {
        return Ok("/".to_string());
    }

    let result = format!("/{}", components.join("/"));

    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Whether a normalized scope prefix contains a normalized document path.
///
/// `/tasks` contains `/tasks/today.md` and the exact path `/tasks` itself,
/// but not `/tasks-archive/old.md`. The root scope `/` contains everything.
pub fn scope_contains(scope: &str, path: &str) -> bool {
    if scope == "/" || scope.is_empty() {
        return true;
    }

    if path == scope {
        return true;
    }

    path.len() > scope.len() && path.starts_with(scope) && path.as_bytes()[scope.len()] == b'/'
}

fn split_components(input: &str) -> Result<Vec<String>, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    // Apply Unicode NFKC normalization
    let normalized: String = input.nfkc().collect();

    // Convert backslashes to forward slashes
    let unified = normalized.replace('\\', "/");

    // Split into components, filter empty segments (from consecutive slashes)
    let components: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    // Validate each component
    for component in &components {
        if *component == "." {
            return Err(PathError::Traversal(".".to_string()));
        }
        if *component == ".." {
            return Err(PathError::Traversal("..".to_string()));
        }
        // Reject components that are only whitespace
        if component.trim().is_empty() {
            return Err(PathError::InvalidComponent(
                "(whitespace-only component)".to_string(),
            ));
        }
    }

    Ok(components.into_iter().map(ToOwned::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Valid paths
    #[test]
    fn test_simple_path() {
        assert_eq!(normalize_path("tasks/today.md").unwrap(), "/tasks/today.md");
    }

    #[test]
    fn test_leading_slash_is_canonical() {
        assert_eq!(normalize_path("/pr.md").unwrap(), "/pr.md");
        assert_eq!(normalize_path("pr.md").unwrap(), "/pr.md");
    }

    #[test]
    fn test_backslash_to_forward() {
        assert_eq!(
            normalize_path("tasks\\notes\\file.md").unwrap(),
            "/tasks/notes/file.md"
        );
    }

    #[test]
    fn test_strip_trailing_slash() {
        assert_eq!(normalize_path("/tasks/file.md/").unwrap(), "/tasks/file.md");
    }

    #[test]
    fn test_collapse_consecutive_slashes() {
        assert_eq!(
            normalize_path("tasks///nested//file.md").unwrap(),
            "/tasks/nested/file.md"
        );
    }

    #[test]
    fn test_unicode_nfkc() {
        // NFKC normalizes ﬁ (U+FB01, fi ligature) to "fi"
        assert_eq!(normalize_path("docs/\u{FB01}le.md").unwrap(), "/docs/file.md");
    }

    // Traversal attacks
    #[test]
    fn test_reject_dotdot() {
        assert_eq!(
            normalize_path("tasks/../etc/passwd"),
            Err(PathError::Traversal("..".to_string()))
        );
    }

    #[test]
    fn test_reject_leading_dotdot() {
        assert_eq!(
            normalize_path("../../../etc/passwd"),
            Err(PathError::Traversal("..".to_string()))
        );
    }

    #[test]
    fn test_reject_dot_component() {
        assert_eq!(
            normalize_path("tasks/./file.md"),
            Err(PathError::Traversal(".".to_string()))
        );
    }

    // Edge cases
    #[test]
    fn test_reject_empty() {
        assert_eq!(normalize_path(""), Err(PathError::Empty));
    }

    #[test]
    fn test_reject_only_slashes() {
        assert_eq!(normalize_path("///"), Err(PathError::Empty));
    }

    #[test]
    fn test_reject_null_byte() {
        assert_eq!(normalize_path("tasks/file\0.md"), Err(PathError::NullByte));
    }

    #[test]
    fn test_reject_too_long() {
        let long_path = "a/".repeat(300);
        assert_eq!(normalize_path(&long_path), Err(PathError::TooLong));
    }

    #[test]
    fn test_dotfile_allowed() {
        assert_eq!(normalize_path(".gitignore").unwrap(), "/.gitignore");
    }

    // Folder normalization
    #[test]
    fn test_folder_root_forms() {
        assert_eq!(normalize_folder("").unwrap(), "/");
        assert_eq!(normalize_folder("/").unwrap(), "/");
        assert_eq!(normalize_folder("///").unwrap(), "/");
    }

    #[test]
    fn test_folder_strips_trailing_slash() {
        assert_eq!(normalize_folder("/tasks/").unwrap(), "/tasks");
        assert_eq!(normalize_folder("tasks").unwrap(), "/tasks");
    }

    #[test]
    fn test_folder_rejects_traversal() {
        assert_eq!(
            normalize_folder("/tasks/../notes"),
            Err(PathError::Traversal("..".to_string()))
        );
    }

    // Scope matching
    #[test]
    fn test_scope_contains_descendants() {
        assert!(scope_contains("/tasks", "/tasks/today.md"));
        assert!(scope_contains("/tasks", "/tasks/deep/nested.md"));
        assert!(scope_contains("/tasks", "/tasks"));
    }

    #[test]
    fn test_scope_excludes_siblings() {
        assert!(!scope_contains("/tasks", "/notes/today.md"));
        assert!(!scope_contains("/tasks", "/tasks-archive/old.md"));
    }

    #[test]
    fn test_root_scope_contains_everything() {
        assert!(scope_contains("/", "/tasks/today.md"));
        assert!(scope_contains("", "/anything.md"));
    }
}
