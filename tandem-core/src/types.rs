//! Relative path helpers and the exclude set.
//!
//! Every path that crosses the wire or names a shadow entry is a
//! `/`-separated string relative to the synchronized root. The root itself is
//! [`ROOT`] (`"."`).

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::error::CoreError;
use crate::repository::REPO_DIR_NAME;

/// Relative path of the synchronized root.
pub const ROOT: &str = ".";

/// Join a directory and an entry name into a relative path.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT || dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent directory of a relative path; the parent of a top-level entry is [`ROOT`].
pub fn parent(rel: &str) -> &str {
    match rel.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => ROOT,
    }
}

/// Reject absolute paths, `..` components, empty components and newlines.
pub fn validate(rel: &str) -> Result<(), CoreError> {
    if rel == ROOT {
        return Ok(());
    }
    let bad = rel.is_empty()
        || rel.starts_with('/')
        || rel.contains('\n')
        || rel.contains('\\')
        || rel.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(CoreError::InvalidPath(rel.to_string()));
    }
    Ok(())
}

/// Map a relative path onto the filesystem below `root`.
pub fn to_fs(root: &Path, rel: &str) -> PathBuf {
    if rel == ROOT {
        return root.to_path_buf();
    }
    let mut path = root.to_path_buf();
    for part in rel.split('/') {
        path.push(part);
    }
    path
}

/// Inverse of [`to_fs`]. Returns `None` for paths outside `root` or with
/// non-UTF-8 components.
pub fn from_fs(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        Some(ROOT.to_string())
    } else {
        Some(parts.join("/"))
    }
}

/// Path-component names ignored everywhere during probing, diffing and
/// committing. Always contains the repository directory itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeSet {
    names: BTreeSet<String>,
}

impl ExcludeSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !n.is_empty())
            .collect();
        names.insert(REPO_DIR_NAME.to_string());
        Self { names }
    }

    /// True when a single entry name is excluded.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// True when any component of a relative path is excluded.
    pub fn excludes_path(&self, rel: &str) -> bool {
        rel.split('/')
            .filter(|part| !part.is_empty() && *part != ROOT)
            .any(|part| self.is_excluded(part))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for ExcludeSet {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn join_and_parent_are_inverse_for_nested_paths() {
        let rel = join("foo", "bar.txt");
        assert_eq!(rel, "foo/bar.txt");
        assert_eq!(parent(&rel), "foo");
        assert_eq!(join(ROOT, "foo"), "foo");
        assert_eq!(parent("foo"), ROOT);
    }

    #[rstest]
    #[case(".", true)]
    #[case("foo", true)]
    #[case("foo/bar.txt", true)]
    #[case("", false)]
    #[case("/etc/passwd", false)]
    #[case("../outside", false)]
    #[case("foo/../../x", false)]
    #[case("foo//bar", false)]
    #[case("foo/./bar", false)]
    #[case("line\nbreak", false)]
    fn validate_rejects_escaping_paths(#[case] rel: &str, #[case] ok: bool) {
        assert_eq!(validate(rel).is_ok(), ok, "validate({rel:?})");
    }

    #[test]
    fn fs_mapping_round_trips() {
        let root = Path::new("/srv/tree");
        let path = to_fs(root, "a/b/c");
        assert_eq!(path, PathBuf::from("/srv/tree/a/b/c"));
        assert_eq!(from_fs(root, &path).as_deref(), Some("a/b/c"));
        assert_eq!(from_fs(root, root).as_deref(), Some(ROOT));
        assert_eq!(from_fs(root, Path::new("/elsewhere")), None);
    }

    #[test]
    fn exclude_set_always_contains_repository_dir() {
        let set = ExcludeSet::new(["node_modules"]);
        assert!(set.is_excluded(REPO_DIR_NAME));
        assert!(set.is_excluded("node_modules"));
        assert!(set.excludes_path("web/node_modules/left-pad"));
        assert!(!set.excludes_path("web/src/main.rs"));
        assert!(!set.excludes_path(ROOT));
    }
}
