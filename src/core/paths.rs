//! Shared path manipulation utilities and project-root containment.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::core::errors::{Result, TriageError};

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the deepest existing ancestor is
/// canonicalized and the remaining components are resolved syntactically, so
/// a symlinked directory part way down still resolves to its real target.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    // Try filesystem resolution first (handles symlinks).
    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    let normalized = normalize_syntactic(&absolute);
    let mut existing = normalized.as_path();
    let mut rest = Vec::new();
    while let Some(parent) = existing.parent() {
        if let Some(name) = existing.file_name() {
            rest.push(name.to_owned());
        }
        existing = parent;
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            let mut out = canonical;
            for name in rest.iter().rev() {
                out.push(name);
            }
            return out;
        }
    }

    normalized
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Confirms caller-supplied paths stay inside the project root.
///
/// Comparison is component-wise on fully resolved paths, so `..` segments
/// and symlinks pointing outside the root are both rejected.
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: PathBuf,
}

impl PathValidator {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: resolve_absolute_path(root),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `raw` (relative paths are taken from the project root) and
    /// require the result to be the root or a descendant of it.
    pub fn validate(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = resolve_absolute_path(&joined);
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(TriageError::PathEscapesRoot {
                path: raw.to_string(),
                root: self.root.clone(),
            })
        }
    }

    /// Like [`validate`](Self::validate) but also requires the path to exist.
    pub fn validate_existing(&self, raw: &str) -> Result<PathBuf> {
        let resolved = self.validate(raw)?;
        if resolved.exists() {
            Ok(resolved)
        } else {
            Err(TriageError::FeaturePathNotFound {
                path: raw.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn normalizes_nonexistent_path_syntactically() {
        #[cfg(unix)]
        let root = Path::new("/");
        #[cfg(windows)]
        let root = Path::new("C:");

        let input = root.join("nonexistent").join("foo").join("..").join("bar");
        let expected = root.join("nonexistent").join("bar");

        assert!(std::fs::canonicalize(&input).is_err());
        let resolved = resolve_absolute_path(&input);
        assert_eq!(resolved, expected);
    }

    #[test]
    fn handles_parent_at_root() {
        #[cfg(unix)]
        {
            let input = Path::new("/../foo");
            let resolved = normalize_syntactic(input);
            assert_eq!(resolved, Path::new("/foo"));
        }
    }

    fn project() -> (tempfile::TempDir, PathValidator) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("features/api")).unwrap();
        fs::write(dir.path().join("features/api/auth.feature"), "Feature: Auth\n").unwrap();
        let validator = PathValidator::new(dir.path());
        (dir, validator)
    }

    #[test]
    fn parent_traversal_escapes_root() {
        let (_dir, validator) = project();
        for raw in ["../../etc/passwd", "features/../../secrets"] {
            let err = validator.validate(raw).unwrap_err();
            assert_eq!(err.code(), "TRG-1201", "{raw} should escape");
        }
    }

    #[test]
    fn descendant_is_accepted() {
        let (_dir, validator) = project();
        let resolved = validator.validate("features/api/auth.feature").unwrap();
        assert!(resolved.starts_with(validator.root()));
        assert!(resolved.ends_with("features/api/auth.feature"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("proj");
        let sibling = parent.path().join("proj-secrets");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&sibling).unwrap();
        let validator = PathValidator::new(&root);
        let raw = sibling.to_string_lossy().to_string();
        assert!(validator.validate(&raw).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let (dir, validator) = project();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("features/escape")).unwrap();
        let err = validator.validate("features/escape/x.feature").unwrap_err();
        assert_eq!(err.code(), "TRG-1201");
    }

    #[test]
    fn missing_path_is_reported_separately() {
        let (_dir, validator) = project();
        let err = validator.validate_existing("features/ui").unwrap_err();
        assert_eq!(err.code(), "TRG-1202");
    }
}
