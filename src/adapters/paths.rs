//! Traversal guards. Each adapter derives paths differently, so each one
//! calls into these helpers with its own notion of "root".

use std::path::{Component, Path, PathBuf};

use super::AdapterError;

/// Lexically normalizes `relative` against a virtual root. Any `..` that
/// would climb above the root, and any absolute path, is rejected.
pub fn clean_relative(relative: &str) -> Result<String, AdapterError> {
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                let name = name
                    .to_str()
                    .ok_or_else(|| AdapterError::PathRejected(relative.to_string()))?;
                parts.push(name);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(AdapterError::PathRejected(format!(
                        "'{relative}' escapes the configured root"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AdapterError::PathRejected(format!(
                    "'{relative}' must be relative to the configured root"
                )));
            }
        }
    }

    Ok(parts.join("/"))
}

/// Joins `relative` onto `root` and verifies the normalized result is still
/// inside `root`.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, AdapterError> {
    let root = PathBuf::from(path_clean::clean(root));
    let joined = PathBuf::from(path_clean::clean(root.join(relative)));
    if joined.starts_with(&root) {
        Ok(joined)
    } else {
        Err(AdapterError::PathRejected(format!(
            "'{relative}' escapes the configured root"
        )))
    }
}

/// Same check after symlinks are resolved; both paths must exist.
pub fn ensure_canonical_within(root: &Path, candidate: &Path) -> Result<PathBuf, AdapterError> {
    let canonical_root = root.canonicalize()?;
    let canonical = candidate.canonicalize().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            AdapterError::NotFound(candidate.display().to_string())
        }
        _ => AdapterError::Io(err),
    })?;

    if canonical.starts_with(&canonical_root) {
        Ok(canonical)
    } else {
        Err(AdapterError::PathRejected(format!(
            "'{}' resolves outside the configured root",
            candidate.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_relative_collapses_inner_parent_segments() {
        assert_eq!(clean_relative("docs/./drafts/../notes.md").expect("clean"), "docs/notes.md");
    }

    #[test]
    fn clean_relative_rejects_escape() {
        let error = clean_relative("docs/../../etc/passwd").expect_err("escape must fail");
        assert!(matches!(error, AdapterError::PathRejected(_)));
    }

    #[test]
    fn clean_relative_rejects_absolute() {
        assert!(matches!(
            clean_relative("/etc/passwd"),
            Err(AdapterError::PathRejected(_))
        ));
    }

    #[test]
    fn resolve_within_rejects_parent_escape() {
        let error = resolve_within(Path::new("/srv/docs"), "../../etc/passwd")
            .expect_err("escape must fail");
        assert!(matches!(error, AdapterError::PathRejected(_)));
    }

    #[test]
    fn resolve_within_rejects_absolute_override() {
        assert!(resolve_within(Path::new("/srv/docs"), "/etc/passwd").is_err());
    }

    #[test]
    fn resolve_within_accepts_nested_paths() {
        let resolved = resolve_within(Path::new("/srv/docs"), "a/b/../c.md").expect("inside");
        assert_eq!(resolved, PathBuf::from("/srv/docs/a/c.md"));
    }

    #[test]
    fn prefix_sibling_is_not_inside_root() {
        assert!(resolve_within(Path::new("/srv/docs"), "../docs-private/x").is_err());
    }
}
