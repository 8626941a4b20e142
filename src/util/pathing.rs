//! Path normalization and base-confinement checks shared by the indexer,
//! the transfer engine, and the router. Resolution is purely lexical (it
//! does not require the target to exist on disk), mirroring `Path.resolve()`
//! semantics for paths that may not yet exist.

use std::path::{Component, Path, PathBuf};

use crate::error::PathEscapeError;

/// Collapse `.`/`..` components without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `p` against `base`: absolute paths pass through normalization
/// unchanged, relative paths are joined to `base` first.
pub fn normalize_path(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        lexical_normalize(p)
    } else {
        lexical_normalize(&base.join(p))
    }
}

/// Confirm `target` lies within `base` after normalization, returning the
/// path relative to `base` on success.
pub fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, PathEscapeError> {
    let base_norm = lexical_normalize(base);
    let target_norm = lexical_normalize(target);
    match target_norm.strip_prefix(&base_norm) {
        Ok(rel) if !rel.components().any(|c| matches!(c, Component::ParentDir)) => {
            Ok(rel.to_path_buf())
        }
        _ => Err(PathEscapeError {
            base: base_norm.display().to_string(),
            attempted: target_norm.display().to_string(),
        }),
    }
}

/// Render a relative path in POSIX form (forward slashes) regardless of host OS.
pub fn to_posix_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_parent_refs() {
        let base = Path::new("/shares/docs");
        let resolved = normalize_path(base, Path::new("sub/../a.txt"));
        assert_eq!(resolved, Path::new("/shares/docs/a.txt"));
    }

    #[test]
    fn ensure_within_rejects_escape() {
        let base = Path::new("/shares/docs");
        let target = Path::new("/shares/docs/../secrets/x");
        assert!(ensure_within(base, target).is_err());
    }

    #[test]
    fn ensure_within_accepts_nested_path() {
        let base = Path::new("/shares/docs");
        let target = Path::new("/shares/docs/a/b.txt");
        let rel = ensure_within(base, target).unwrap();
        assert_eq!(to_posix_string(&rel), "a/b.txt");
    }

    #[test]
    fn absolute_input_passes_through_normalization() {
        let base = Path::new("/shares/docs");
        let resolved = normalize_path(base, Path::new("/elsewhere/a.txt"));
        assert_eq!(resolved, Path::new("/elsewhere/a.txt"));
    }
}
