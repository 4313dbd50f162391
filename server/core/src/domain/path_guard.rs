// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Workspace path safety.
//!
//! Agent input filenames come from the outside world (content
//! heuristics over decrypted data, artifact lists printed by the agent
//! itself) and must never escape the sandbox workspace. Validation is
//! by component inspection, not string prefix matching.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathGuardError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Resolve `name` against `root`, refusing anything that would land
/// outside it: absolute paths, `..` components, null bytes.
pub fn resolve_inside(root: &Path, name: &str) -> Result<PathBuf, PathGuardError> {
    if name.is_empty() {
        return Err(PathGuardError::InvalidPath("empty filename".into()));
    }
    if name.contains('\0') {
        return Err(PathGuardError::InvalidPath(
            "filename contains null byte".into(),
        ));
    }

    let candidate = Path::new(name);
    let mut resolved = root.to_path_buf();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                tracing::warn!(path = %name, "path traversal attempt rejected");
                return Err(PathGuardError::PathTraversal(name.to_string()));
            }
            Component::RootDir | Component::Prefix(_) => {
                tracing::warn!(path = %name, "absolute path rejected");
                return Err(PathGuardError::PathTraversal(name.to_string()));
            }
        }
    }

    // Component-level checks above are the real guard; this re-verifies
    // the invariant on the assembled path.
    if !resolved.starts_with(root) {
        return Err(PathGuardError::PathTraversal(name.to_string()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_name() {
        let resolved = resolve_inside(Path::new("/ws"), "data.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/ws/data.txt"));
    }

    #[test]
    fn accepts_nested_relative_path() {
        let resolved = resolve_inside(Path::new("/ws"), "out/report.md").unwrap();
        assert_eq!(resolved, PathBuf::from("/ws/out/report.md"));
    }

    #[test]
    fn rejects_parent_components() {
        assert!(resolve_inside(Path::new("/ws"), "../etc/passwd").is_err());
        assert!(resolve_inside(Path::new("/ws"), "out/../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(resolve_inside(Path::new("/ws"), "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_null_bytes_and_empty() {
        assert!(resolve_inside(Path::new("/ws"), "a\0b").is_err());
        assert!(resolve_inside(Path::new("/ws"), "").is_err());
    }

    #[test]
    fn normalizes_current_dir() {
        let resolved = resolve_inside(Path::new("/ws"), "./out/./r.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/ws/out/r.txt"));
    }
}
