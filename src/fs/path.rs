//! Virtual path to backing path translation

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Maps virtual paths under the mount onto the backing root
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its backing path
    ///
    /// One leading separator is stripped and the rest is joined onto the
    /// root. Existence is not checked. `..` components are refused since
    /// they would escape the root.
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        if virtual_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::PathResolution(format!(
                "{:?} contains a parent directory component",
                virtual_path
            )));
        }

        let relative = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        Ok(self.root.join(relative))
    }

    /// Convert a backing path back to its virtual path
    pub fn to_virtual(&self, backing_path: &Path) -> Option<PathBuf> {
        backing_path
            .strip_prefix(&self.root)
            .ok()
            .map(|p| PathBuf::from("/").join(p))
    }

    /// Virtual path of `name` inside the virtual directory `parent`
    pub fn child(parent: &Path, name: &OsStr) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(parent.join(name)),
            _ => Err(Error::PathResolution(format!(
                "{:?} is not a single path component",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new("/srv/backing")
    }

    #[test]
    fn test_resolve_strips_leading_slash() {
        let t = translator();
        assert_eq!(
            t.resolve(Path::new("/a.txt")).unwrap(),
            PathBuf::from("/srv/backing/a.txt")
        );
        assert_eq!(
            t.resolve(Path::new("/dir/sub/file")).unwrap(),
            PathBuf::from("/srv/backing/dir/sub/file")
        );
    }

    #[test]
    fn test_resolve_relative_and_root() {
        let t = translator();
        assert_eq!(
            t.resolve(Path::new("a.txt")).unwrap(),
            PathBuf::from("/srv/backing/a.txt")
        );
        assert_eq!(t.resolve(Path::new("/")).unwrap(), PathBuf::from("/srv/backing"));
    }

    #[test]
    fn test_resolve_rejects_parent_components() {
        let t = translator();
        assert!(matches!(
            t.resolve(Path::new("/../etc/passwd")),
            Err(Error::PathResolution(_))
        ));
    }

    #[test]
    fn test_to_virtual() {
        let t = translator();
        assert_eq!(
            t.to_virtual(Path::new("/srv/backing/dir/a.txt")),
            Some(PathBuf::from("/dir/a.txt"))
        );
        assert_eq!(t.to_virtual(Path::new("/elsewhere/a.txt")), None);
    }

    #[test]
    fn test_child() {
        assert_eq!(
            PathTranslator::child(Path::new("/dir"), OsStr::new("a.txt")).unwrap(),
            PathBuf::from("/dir/a.txt")
        );
        assert!(PathTranslator::child(Path::new("/dir"), OsStr::new("..")).is_err());
        assert!(PathTranslator::child(Path::new("/dir"), OsStr::new("a/b")).is_err());
    }
}
